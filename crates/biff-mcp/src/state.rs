//! Server-wide shared state.
//!
//! One `ServerState` value is constructed in the startup path and passed
//! explicitly to the tool handlers and the background poller; nothing
//! else in the process is global.

use std::sync::Arc;

use biff::{build_session_key, Relay, ResolvedConfig};

use crate::awareness::Awareness;

/// Everything a tool handler needs, constructed once at startup.
pub struct ServerState {
    pub config: ResolvedConfig,
    pub relay: Arc<dyn Relay>,
    /// This process's tty token, fixed for the process lifetime.
    pub tty: String,
    pub host: String,
    pub cwd: String,
    pub awareness: Awareness,
}

impl ServerState {
    pub fn new(config: ResolvedConfig, relay: Arc<dyn Relay>, tty: String) -> Self {
        let unread_path = biff::config::unread_file_path(&config.repo_name);
        Self {
            config,
            relay,
            tty,
            host: biff::tty::get_host(),
            cwd: biff::tty::get_cwd(),
            awareness: Awareness::new(unread_path),
        }
    }

    /// This process's login.
    pub fn login(&self) -> &str {
        &self.config.identity.login
    }

    /// Composite `{login}:{tty}` session key.
    pub fn session_key(&self) -> String {
        build_session_key(self.login(), &self.tty)
    }
}
