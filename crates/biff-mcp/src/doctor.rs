//! Environment diagnostics: `biff-mcp doctor`.
//!
//! Six probes. The first four are required and gate the exit code; the
//! last two are informational.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use biff::config::{find_git_root, load_biff_file};

use crate::{install, statusline};

const RELAY_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of a single diagnostic probe.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
    pub required: bool,
}

impl CheckResult {
    fn required(name: &'static str, passed: bool, message: impl Into<String>) -> Self {
        Self {
            name,
            passed,
            message: message.into(),
            required: true,
        }
    }

    fn informational(name: &'static str, passed: bool, message: impl Into<String>) -> Self {
        Self {
            name,
            passed,
            message: message.into(),
            required: false,
        }
    }
}

fn check_identity_authority() -> CheckResult {
    let output = Command::new("gh").args(["auth", "status"]).output();
    match output {
        Ok(output) if output.status.success() => {
            CheckResult::required("Identity authority", true, "gh authenticated")
        }
        Ok(_) => CheckResult::required(
            "Identity authority",
            false,
            "gh not authenticated (run: gh auth login)",
        ),
        Err(_) => CheckResult::required(
            "Identity authority",
            false,
            "gh CLI not found (install it, or pass --user to serve)",
        ),
    }
}

fn check_registration(mcp_config: Option<&Path>) -> CheckResult {
    match mcp_config {
        Some(path) if install::is_installed(path) => {
            CheckResult::required("MCP registration", true, path.display().to_string())
        }
        Some(_) => CheckResult::required(
            "MCP registration",
            false,
            "not registered (run: biff-mcp install)",
        ),
        None => CheckResult::required("MCP registration", false, "no home directory"),
    }
}

fn check_server_binary(mcp_config: Option<&Path>) -> CheckResult {
    let command = mcp_config.and_then(install::registered_command);
    match command {
        Some(path) if path.exists() => {
            CheckResult::required("Server binary", true, path.display().to_string())
        }
        Some(path) => CheckResult::required(
            "Server binary",
            false,
            format!("{} missing (re-run: biff-mcp install)", path.display()),
        ),
        None => CheckResult::required(
            "Server binary",
            false,
            "no registration to inspect (run: biff-mcp install)",
        ),
    }
}

async fn check_relay() -> CheckResult {
    let repo_root = std::env::current_dir().ok().and_then(|cwd| find_git_root(&cwd));
    let config = match &repo_root {
        Some(root) => match load_biff_file(root) {
            Ok(config) => config,
            Err(err) => {
                return CheckResult::required("Relay", false, format!("config error: {err}"))
            }
        },
        None => Default::default(),
    };

    match config.relay_url {
        Some(url) => {
            let auth = config.relay_auth.unwrap_or_default();
            match biff::relay::nats::probe(&url, auth, RELAY_PROBE_TIMEOUT).await {
                Ok(()) => CheckResult::required("Relay", true, format!("reachable ({url})")),
                Err(err) => {
                    CheckResult::required("Relay", false, format!("unreachable ({url}): {err}"))
                }
            }
        }
        None => CheckResult::required("Relay", true, "local filesystem relay"),
    }
}

fn check_biff_file() -> CheckResult {
    let repo_root = std::env::current_dir().ok().and_then(|cwd| find_git_root(&cwd));
    match repo_root {
        Some(root) => {
            let path = root.join(".biff");
            if path.exists() {
                CheckResult::informational(".biff file", true, path.display().to_string())
            } else {
                CheckResult::informational(
                    ".biff file",
                    false,
                    format!("not found (run 'biff-mcp init' in {})", root.display()),
                )
            }
        }
        None => CheckResult::informational(
            ".biff file",
            false,
            "not in a git repo (sessions here share the _default scope)",
        ),
    }
}

fn check_statusline() -> CheckResult {
    match statusline::stash_path() {
        Some(stash) if stash.exists() => {
            CheckResult::informational("Status line", true, "installed")
        }
        _ => CheckResult::informational(
            "Status line",
            false,
            "not installed (run: biff-mcp install-statusline)",
        ),
    }
}

/// Run every probe in order.
pub async fn run_checks() -> Vec<CheckResult> {
    let mcp_config = install::mcp_config_path();
    vec![
        check_identity_authority(),
        check_registration(mcp_config.as_deref()),
        check_server_binary(mcp_config.as_deref()),
        check_relay().await,
        check_biff_file(),
        check_statusline(),
    ]
}

/// Print results and return the process exit code: 0 when every
/// required probe passed.
pub fn report(checks: &[CheckResult]) -> i32 {
    for check in checks {
        let symbol = if check.passed {
            "\u{2713}"
        } else if check.required {
            "\u{2717}"
        } else {
            "\u{25cb}"
        };
        println!("  {symbol} {}: {}", check.name, check.message);
    }
    let failures = checks.iter().filter(|c| c.required && !c.passed).count();
    if failures > 0 {
        println!("\n{failures} required check(s) failed.");
        1
    } else {
        println!("\nAll required checks passed.");
        0
    }
}
