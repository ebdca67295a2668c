//! The awareness engine: turning unread-count changes into signals the
//! host can actually show.
//!
//! The host display surface ignores server-initiated notifications, so
//! visibility is indirect, through three complementary surfaces:
//!
//! 1. the mutable `read_messages` tool description (re-read by the
//!    client after a `tools/list_changed` notification),
//! 2. a background poller that keeps that description fresh between
//!    tool calls,
//! 3. a per-repo `~/.biff/unread/{repo}.json` status file aggregated by
//!    the external status bar.
//!
//! Belt and suspenders: every tool call refreshes synchronously (belt)
//! and captures the request peer; the poller (suspenders) reuses that
//! cached peer to notify outside any request. Both paths are
//! best-effort — failures are logged and never propagated.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use biff::relay::atomic_write;
use biff::{Relay, UnreadSummary};
use rmcp::service::{Peer, RoleServer};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::state::ServerState;

/// Poll cadence for the background unread check.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

const READ_MESSAGES_BASE: &str = "Check messages.";

/// The `read_messages` tool description for a given unread state.
pub fn read_messages_description(summary: &UnreadSummary) -> String {
    if summary.count == 0 {
        READ_MESSAGES_BASE.to_string()
    } else {
        format!(
            "Check messages ({} unread: {}). Marks all as read.",
            summary.count, summary.preview
        )
    }
}

/// Mutable awareness state shared between tool handlers and the poller.
pub struct Awareness {
    /// Most recent unread summary; `list_tools` renders from this.
    summary: Mutex<UnreadSummary>,
    /// Peer captured from the most recent tool call, so the poller can
    /// notify outside a request context.
    peer: Mutex<Option<Peer<RoleServer>>>,
    /// Serializes refreshes: at most one description mutation and
    /// notification in flight per process.
    gate: tokio::sync::Mutex<()>,
    unread_path: Option<PathBuf>,
}

impl Awareness {
    pub fn new(unread_path: Option<PathBuf>) -> Self {
        Self {
            summary: Mutex::new(UnreadSummary::default()),
            peer: Mutex::new(None),
            gate: tokio::sync::Mutex::new(()),
            unread_path,
        }
    }

    /// Remember the request peer. Called on every tool call — the client
    /// may have reconnected with a new transport session.
    pub fn capture_peer(&self, peer: Peer<RoleServer>) {
        if let Ok(mut guard) = self.peer.lock() {
            *guard = Some(peer);
        }
    }

    /// The summary the current tool list should render.
    pub fn current_summary(&self) -> UnreadSummary {
        self.summary
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Poll the relay and push every surface that changed.
    ///
    /// The status file is rewritten on every refresh; the description
    /// notification fires only when the summary actually changed. A
    /// relay failure skips the tick and leaves unread state untouched.
    pub async fn refresh(&self, relay: &dyn Relay, login: &str, tty: &str) {
        let _serialized = self.gate.lock().await;

        let summary = match relay.peek_unread(login, tty).await {
            Ok(summary) => summary,
            Err(err) => {
                debug!(error = %err, "unread poll failed, skipping tick");
                return;
            }
        };

        self.write_unread_file(&summary);

        let changed = match self.summary.lock() {
            Ok(mut guard) => {
                let changed = *guard != summary;
                *guard = summary;
                changed
            }
            Err(_) => return,
        };
        if !changed {
            return;
        }

        let peer = self.peer.lock().ok().and_then(|guard| guard.clone());
        if let Some(peer) = peer {
            if let Err(err) = peer.notify_tool_list_changed().await {
                debug!(error = %err, "tool list changed notification not delivered");
            }
        }
    }

    fn write_unread_file(&self, summary: &UnreadSummary) {
        let Some(path) = &self.unread_path else {
            return;
        };
        let json = serde_json::json!({
            "count": summary.count,
            "preview": summary.preview,
        });
        if let Err(err) = atomic_write(path, &(json.to_string() + "\n")) {
            warn!(path = %path.display(), error = %err, "failed to write unread status file");
        }
    }
}

/// Start the background poller. It exits within one tick of
/// cancellation.
pub fn spawn_poller(state: Arc<ServerState>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            let login = state.login().to_string();
            state
                .awareness
                .refresh(state.relay.as_ref(), &login, &state.tty)
                .await;
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn description_reflects_unread_state() {
        assert_eq!(
            read_messages_description(&UnreadSummary::default()),
            "Check messages."
        );
        let busy = UnreadSummary {
            count: 2,
            preview: "@kai about auth, @eric about lunch".to_string(),
        };
        let desc = read_messages_description(&busy);
        assert!(desc.contains("2 unread"));
        assert!(desc.contains("@kai about auth"));
        assert!(desc.ends_with("Marks all as read."));
    }

    #[test]
    fn unread_file_written_atomically() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("unread").join("widgets.json");
        let awareness = Awareness::new(Some(path.clone()));
        awareness.write_unread_file(&UnreadSummary {
            count: 3,
            preview: "@eric about lunch".to_string(),
        });

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["count"], 3);
        assert_eq!(parsed["preview"], "@eric about lunch");
    }
}
