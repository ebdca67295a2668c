//! Configuration discovery and identity resolution.
//!
//! Finds the `.biff` TOML file at the git repo root, resolves the login
//! and display name from `gh api user` (falling back to the OS user), and
//! computes the repo-scoped data directory every relay resource hangs off.
//!
//! Config file format (`.biff`):
//!
//! ```toml
//! [team]
//! members = ["kai", "eric", "priya"]
//!
//! [relay]
//! url = "nats://localhost:4222"
//! ```

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use thiserror::Error;

use crate::models::Identity;

/// Default base for per-repo data directories.
pub const DEFAULT_PREFIX: &str = "/tmp";

/// Repo scope used when the server is started outside any git repository.
pub const DEFAULT_REPO_NAME: &str = "_default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("conflicting auth in .biff [relay]: {0} (set at most one)")]
    ConflictingAuth(String),
    #[error("no user identity: install and authenticate the gh CLI, or pass --user")]
    NoIdentity,
    #[error("repo name {0:?} contains no usable characters after sanitization")]
    UnusableRepoName(String),
}

/// Authentication material for a remote relay. At most one field is set;
/// exclusivity is enforced at parse time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayAuth {
    /// Shared secret token.
    pub token: Option<String>,
    /// Path to an NKey seed file.
    pub nkeys_seed: Option<String>,
    /// Path to a credentials file.
    pub user_credentials: Option<String>,
}

/// Validated contents of a `.biff` file.
#[derive(Debug, Clone, Default)]
pub struct BiffConfig {
    pub team: Vec<String>,
    pub relay_url: Option<String>,
    pub relay_auth: Option<RelayAuth>,
}

/// Everything startup needs, fully resolved.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: BiffConfig,
    pub identity: Identity,
    /// Sanitized repo scope for every relay resource name.
    pub repo_name: String,
    pub data_dir: PathBuf,
    pub repo_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct RawBiffFile {
    #[serde(default)]
    team: RawTeam,
    #[serde(default)]
    relay: RawRelay,
}

#[derive(Debug, Deserialize, Default)]
struct RawTeam {
    #[serde(default)]
    members: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawRelay {
    url: Option<String>,
    token: Option<String>,
    nkeys_seed: Option<String>,
    user_credentials: Option<String>,
}

/// Walk up from `start` looking for a `.git` entry.
pub fn find_git_root(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir.join(".git").exists() {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

/// Extract `owner/repo` from an SSH or HTTPS git remote URL.
///
/// Nested paths (e.g. `gitlab.com/group/sub/repo`) are rejected so the
/// slug stays a two-part name.
fn parse_repo_slug(url: &str) -> Option<String> {
    let url = url.trim();
    let path = if let Some((_, rest)) = url.split_once("://") {
        // https://host/owner/repo(.git)
        rest.split_once('/').map(|(_, p)| p)?
    } else if let Some((userhost, rest)) = url.split_once(':') {
        // git@host:owner/repo(.git)
        if !userhost.contains('@') {
            return None;
        }
        rest
    } else {
        return None;
    };
    let slug = path.strip_suffix(".git").unwrap_or(path);
    if slug.split('/').count() == 2 && !slug.starts_with('/') && !slug.ends_with('/') {
        Some(slug.to_string())
    } else {
        None
    }
}

/// Resolve `owner/repo` from `git remote get-url origin`, if any.
pub fn get_repo_slug(repo_root: &Path) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo_root)
        .args(["remote", "get-url", "origin"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_repo_slug(&String::from_utf8_lossy(&output.stdout))
}

/// Sanitize a repo name or slug for use in relay resource names.
///
/// Bucket and stream names allow ASCII alphanumerics, dash, and
/// underscore only; subject dots are level separators and `*`/`>` are
/// wildcards. Slashes mark the owner/repo boundary and become
/// underscores; dots and spaces become dashes; everything else outside
/// the safe set is stripped.
pub fn sanitize_repo_name(name: &str) -> Result<String, ConfigError> {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' => '_',
            '.' | ' ' => '-',
            other => other,
        })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if sanitized.is_empty() {
        return Err(ConfigError::UnusableRepoName(name.to_string()));
    }
    Ok(sanitized)
}

/// Data directory for a repo scope: `{prefix}/biff/{repo}`.
pub fn compute_data_dir(prefix: &Path, repo_name: &str) -> PathBuf {
    prefix.join("biff").join(repo_name)
}

/// Per-repo unread status file consumed by the status bar:
/// `~/.biff/unread/{repo}.json`.
pub fn unread_file_path(repo_name: &str) -> Option<PathBuf> {
    Some(
        dirs::home_dir()?
            .join(".biff")
            .join("unread")
            .join(format!("{repo_name}.json")),
    )
}

/// Parse the `.biff` file at `repo_root`, returning defaults when absent.
pub fn load_biff_file(repo_root: &Path) -> Result<BiffConfig, ConfigError> {
    let path = repo_root.join(".biff");
    if !path.exists() {
        return Ok(BiffConfig::default());
    }
    let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    parse_biff_toml(&text).map_err(|err| match err {
        TomlFieldError::Parse(source) => ConfigError::Parse { path, source },
        TomlFieldError::ConflictingAuth(names) => ConfigError::ConflictingAuth(names),
    })
}

enum TomlFieldError {
    Parse(toml::de::Error),
    ConflictingAuth(String),
}

fn parse_biff_toml(text: &str) -> Result<BiffConfig, TomlFieldError> {
    let raw: RawBiffFile = toml::from_str(text).map_err(TomlFieldError::Parse)?;

    let set: Vec<&str> = [
        ("token", &raw.relay.token),
        ("nkeys_seed", &raw.relay.nkeys_seed),
        ("user_credentials", &raw.relay.user_credentials),
    ]
    .iter()
    .filter(|(_, v)| v.as_deref().is_some_and(|s| !s.is_empty()))
    .map(|(name, _)| *name)
    .collect();
    if set.len() > 1 {
        return Err(TomlFieldError::ConflictingAuth(set.join(", ")));
    }

    let relay_auth = if set.is_empty() {
        None
    } else {
        Some(RelayAuth {
            token: raw.relay.token.filter(|s| !s.is_empty()),
            nkeys_seed: raw.relay.nkeys_seed.filter(|s| !s.is_empty()),
            user_credentials: raw.relay.user_credentials.filter(|s| !s.is_empty()),
        })
    };

    Ok(BiffConfig {
        team: raw.team.members,
        relay_url: raw.relay.url.filter(|s| !s.is_empty()),
        relay_auth,
    })
}

/// Resolve login and display name from `gh api user` in one call.
pub fn get_github_identity() -> Option<Identity> {
    let output = Command::new("gh")
        .args(["api", "user", "--jq", r#"[.login, .name // ""] | @tsv"#])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut parts = stdout.trim().splitn(2, '\t');
    let login = parts.next()?.trim().to_string();
    if login.is_empty() {
        return None;
    }
    let display_name = parts.next().unwrap_or("").trim().to_string();
    Some(Identity {
        login,
        display_name,
    })
}

fn get_os_user() -> Option<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|u| !u.is_empty())
}

/// Overrides and knobs for [`load_config`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Skip identity resolution and use this login.
    pub user_override: Option<String>,
    /// Use this data directory instead of the computed one.
    pub data_dir_override: Option<PathBuf>,
    /// `Some(None)` forces the local relay; `Some(Some(url))` forces a
    /// cluster relay. `None` defers to the `.biff` file.
    pub relay_url_override: Option<Option<String>>,
    /// Base for the computed data directory.
    pub prefix: Option<PathBuf>,
    /// Directory to start the git-root walk from (default: cwd).
    pub start: Option<PathBuf>,
}

/// Discover and resolve all configuration.
///
/// Resolution order: CLI overrides, then the `.biff` file, then the
/// GitHub identity, then the OS username. Outside a git repository the
/// repo scope falls back to `_default` and the server still runs.
pub fn load_config(opts: LoadOptions) -> Result<ResolvedConfig, ConfigError> {
    let start = opts
        .start
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let repo_root = find_git_root(&start);

    let mut config = match &repo_root {
        Some(root) => load_biff_file(root)?,
        None => BiffConfig::default(),
    };

    // A relay override replaces both the URL and any file-sourced auth:
    // the .biff credentials belong to the .biff relay, not the override.
    if let Some(override_url) = opts.relay_url_override {
        config.relay_url = override_url.filter(|u| !u.is_empty());
        config.relay_auth = None;
    }

    let identity = match opts.user_override {
        Some(login) => Identity {
            login,
            display_name: String::new(),
        },
        None => get_github_identity()
            .or_else(|| {
                get_os_user().map(|login| Identity {
                    login,
                    display_name: String::new(),
                })
            })
            .ok_or(ConfigError::NoIdentity)?,
    };

    let repo_name = match &repo_root {
        Some(root) => {
            let slug = get_repo_slug(root);
            let raw = slug.unwrap_or_else(|| {
                root.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| DEFAULT_REPO_NAME.to_string())
            });
            sanitize_repo_name(&raw)?
        }
        None => DEFAULT_REPO_NAME.to_string(),
    };

    let prefix = opts
        .prefix
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PREFIX));
    let data_dir = opts
        .data_dir_override
        .unwrap_or_else(|| compute_data_dir(&prefix, &repo_name));

    Ok(ResolvedConfig {
        config,
        identity,
        repo_name,
        data_dir,
        repo_root,
    })
}
