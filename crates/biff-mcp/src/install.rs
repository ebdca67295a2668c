//! Host registration: the MCP server entry the coding-session client
//! launches, plus the `.biff` template `init` drops in a repo root.

use std::path::{Path, PathBuf};

use anyhow::Context;
use biff::relay::atomic_write;
use serde_json::{json, Value};

/// Key under `mcpServers` in the host MCP config.
pub const SERVER_KEY: &str = "biff";

/// `~/.claude.json`, the host's user-scope MCP registration file.
pub fn mcp_config_path() -> Option<PathBuf> {
    Some(dirs::home_dir()?.join(".claude.json"))
}

fn read_json(path: &Path) -> Value {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_else(|| json!({}))
}

fn write_json(path: &Path, value: &Value) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value)? + "\n";
    atomic_write(path, &text).with_context(|| format!("writing {}", path.display()))
}

fn server_entry() -> anyhow::Result<Value> {
    let exe = std::env::current_exe().context("resolving current executable")?;
    Ok(json!({
        "type": "stdio",
        "command": exe.display().to_string(),
        "args": ["serve"],
    }))
}

/// Register the biff server under `mcpServers.biff`. Idempotent: an
/// existing entry is overwritten so it always points at this binary.
pub fn install(mcp_config: &Path) -> anyhow::Result<String> {
    let mut root = read_json(mcp_config);
    if !root.is_object() {
        root = json!({});
    }
    if root.get("mcpServers").map_or(true, |v| !v.is_object()) {
        root["mcpServers"] = json!({});
    }
    root["mcpServers"][SERVER_KEY] = server_entry()?;
    write_json(mcp_config, &root)?;
    Ok(format!(
        "Registered MCP server '{SERVER_KEY}' in {}. Restart your session to pick it up.",
        mcp_config.display()
    ))
}

/// Remove the registration, leaving other servers untouched.
pub fn uninstall(mcp_config: &Path) -> anyhow::Result<String> {
    let mut root = read_json(mcp_config);
    let removed = root
        .get_mut("mcpServers")
        .and_then(Value::as_object_mut)
        .and_then(|servers| servers.remove(SERVER_KEY))
        .is_some();
    if removed {
        write_json(mcp_config, &root)?;
        Ok(format!("Removed MCP server '{SERVER_KEY}'."))
    } else {
        Ok(format!("MCP server '{SERVER_KEY}' was not registered."))
    }
}

/// Whether the registration is present (doctor probe).
pub fn is_installed(mcp_config: &Path) -> bool {
    read_json(mcp_config)
        .get("mcpServers")
        .and_then(|servers| servers.get(SERVER_KEY))
        .is_some()
}

/// The executable the registration points at, if any.
pub fn registered_command(mcp_config: &Path) -> Option<PathBuf> {
    read_json(mcp_config)
        .get("mcpServers")?
        .get(SERVER_KEY)?
        .get("command")?
        .as_str()
        .map(PathBuf::from)
}

const BIFF_TEMPLATE: &str = "\
# Biff team configuration. Commit this file so the whole team shares it.

[team]
members = []

# Without a relay URL, biff uses a shared directory on this machine.
# Point url at a NATS server to span hosts. Set at most one of token,
# nkeys_seed, or user_credentials.
#
# [relay]
# url = \"nats://localhost:4222\"
# token = \"...\"
# nkeys_seed = \"/path/to/seed.nk\"
# user_credentials = \"/path/to/user.creds\"
";

/// Write a commented `.biff` template into `repo_root`. Refuses to
/// overwrite an existing file.
pub fn init(repo_root: &Path) -> anyhow::Result<String> {
    let path = repo_root.join(".biff");
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    atomic_write(&path, BIFF_TEMPLATE).with_context(|| format!("writing {}", path.display()))?;
    Ok(format!("Wrote {}.", path.display()))
}
