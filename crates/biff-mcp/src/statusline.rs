//! Status line integration for the host status bar.
//!
//! Install stashes the user's original `statusLine` command and replaces
//! it with `biff-mcp statusline`; at render time that subcommand runs
//! the stashed original, aggregates unread counts across every
//! repository's `~/.biff/unread/{repo}.json`, and composes the two as
//! `{original} | {biff segment}`. Uninstall restores the stash.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use biff::relay::atomic_write;
use serde_json::{json, Value};

/// `~/.claude/settings.json`, where the statusLine command lives.
pub fn settings_path() -> Option<PathBuf> {
    Some(dirs::home_dir()?.join(".claude").join("settings.json"))
}

/// `~/.biff/statusline-original.json`, the stash of the user's original
/// statusLine value.
pub fn stash_path() -> Option<PathBuf> {
    Some(dirs::home_dir()?.join(".biff").join("statusline-original.json"))
}

/// `~/.biff/unread`, one `{repo}.json` per repository.
pub fn unread_dir() -> Option<PathBuf> {
    Some(dirs::home_dir()?.join(".biff").join("unread"))
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

/// The statusLine settings object pointing at this binary.
fn biff_statusline_entry() -> anyhow::Result<Value> {
    let exe = std::env::current_exe().context("resolving current executable")?;
    Ok(json!({
        "type": "command",
        "command": format!("{} statusline", exe.display()),
    }))
}

/// Install the biff status line, stashing whatever was there before.
pub fn install(settings: &Path, stash: &Path) -> anyhow::Result<String> {
    let mut root = read_json(settings);
    let original = root.get("statusLine").cloned();

    write_json(stash, &json!({ "original": original }))?;

    root["statusLine"] = biff_statusline_entry()?;
    write_json(settings, &root)?;
    Ok("Status line installed.".to_string())
}

/// Restore the stashed statusLine and remove the stash.
pub fn uninstall(settings: &Path, stash: &Path) -> anyhow::Result<String> {
    if !stash.exists() {
        return Ok("Status line not installed.".to_string());
    }
    let stashed = read_json(stash);
    let original = stashed.get("original").cloned().unwrap_or(Value::Null);

    let mut root = read_json(settings);
    match original {
        Value::Null => {
            if let Some(obj) = root.as_object_mut() {
                obj.remove("statusLine");
            }
        }
        value => root["statusLine"] = value,
    }
    write_json(settings, &root)?;
    let _ = std::fs::remove_file(stash);
    Ok("Status line restored.".to_string())
}

/// Shell command stashed as the original statusLine, if any.
fn original_command(stash: &Path) -> Option<String> {
    let stashed = read_json(stash);
    stashed
        .get("original")?
        .get("command")?
        .as_str()
        .map(str::to_string)
}

/// Sum unread counts across every repository's status file.
fn aggregate_unread(unread_dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(unread_dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| ext == "json")
        })
        .map(|entry| {
            read_json(&entry.path())
                .get("count")
                .and_then(Value::as_u64)
                .unwrap_or(0)
        })
        .sum()
}

fn biff_segment(count: u64) -> String {
    if count == 0 {
        "biff(0)".to_string()
    } else {
        // Bold yellow so new messages stand out in the status bar.
        format!("\u{1b}[1;33mbiff({count})\u{1b}[0m")
    }
}

/// Run the stashed original command with the host's stdin payload.
/// Any failure (bad exit, timeout, missing shell) yields an empty
/// segment rather than breaking the bar.
async fn run_original(command: &str, stdin_data: &str) -> String {
    use tokio::io::AsyncWriteExt;

    let spawned = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(_) => return String::new(),
    };
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(stdin_data.as_bytes()).await;
    }
    match tokio::time::timeout(Duration::from_secs(5), child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        _ => String::new(),
    }
}

/// Produce the composed status bar text.
pub async fn run(stash: &Path, unread_dir_path: &Path, stdin_data: &str) -> String {
    let biff = biff_segment(aggregate_unread(unread_dir_path));
    match original_command(stash) {
        Some(command) => {
            let original = run_original(&command, stdin_data).await;
            if original.is_empty() {
                biff
            } else {
                format!("{original} | {biff}")
            }
        }
        None => biff,
    }
}
