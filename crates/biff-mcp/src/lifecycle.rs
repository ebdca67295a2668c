//! Startup and shutdown around the serve loop.
//!
//! Startup order matters: orphan reconciliation runs before this
//! process's own session is inserted, so a crashed predecessor of the
//! same identity is logged out (with `reason=orphan` on the wtmp log)
//! before `who` can ever see both. The relay's TTL is the backstop for
//! sessions this path never gets to reap.

use std::sync::Arc;

use biff::relay::SESSION_TTL;
use biff::{LogoutReason, Relay, RelayResult, SessionEvent, UserSession};
use tracing::{info, warn};

use crate::state::ServerState;

/// Reap sessions this identity left behind on this host, insert the new
/// session, and record the login event.
pub async fn startup(state: &Arc<ServerState>) -> RelayResult<()> {
    reconcile_orphans(state).await;

    let session = UserSession::new(
        state.login(),
        &state.tty,
        &state.config.identity.display_name,
        &state.host,
        &state.cwd,
    );
    state.relay.put_session(&session).await?;
    if let Err(err) = state.relay.log_event(&SessionEvent::login(&session)).await {
        warn!(error = %err, "login event not recorded");
    }
    info!(session = %session.key(), repo = %state.config.repo_name, "session started");
    Ok(())
}

/// Crash recovery: any stale session of this login on this host is
/// logged out and removed. Failures here never block startup.
async fn reconcile_orphans(state: &Arc<ServerState>) {
    let expired = match state.relay.expired_sessions(SESSION_TTL).await {
        Ok(expired) => expired,
        Err(err) => {
            warn!(error = %err, "orphan scan failed, relying on relay TTL");
            return;
        }
    };
    for orphan in expired
        .iter()
        .filter(|s| s.user == state.login() && s.host == state.host)
    {
        info!(session = %orphan.key(), "reaping orphaned session");
        if let Err(err) = state
            .relay
            .log_event(&SessionEvent::logout(orphan, LogoutReason::Orphan))
            .await
        {
            warn!(error = %err, "orphan logout event not recorded");
        }
        if let Err(err) = state.relay.delete_session(&orphan.key()).await {
            warn!(error = %err, "orphan session not removed");
        }
    }
}

/// Graceful close: logout event, session removal, relay release. Each
/// step is best-effort so a flaky relay cannot wedge process exit.
pub async fn shutdown(state: &Arc<ServerState>) {
    let key = state.session_key();
    let session = state
        .relay
        .list_sessions()
        .await
        .ok()
        .and_then(|sessions| sessions.into_iter().find(|s| s.key() == key))
        .unwrap_or_else(|| {
            UserSession::new(
                state.login(),
                &state.tty,
                &state.config.identity.display_name,
                &state.host,
                &state.cwd,
            )
        });

    if let Err(err) = state
        .relay
        .log_event(&SessionEvent::logout(&session, LogoutReason::Normal))
        .await
    {
        warn!(error = %err, "logout event not recorded");
    }
    if let Err(err) = state.relay.delete_session(&key).await {
        warn!(error = %err, "session entry not removed");
    }
    if let Err(err) = state.relay.close().await {
        warn!(error = %err, "relay close failed");
    }
    info!(session = %key, "session ended");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    use biff::{BiffConfig, EventKind, Identity, LocalRelay, Relay, ResolvedConfig};
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_state(dir: &TempDir) -> Arc<ServerState> {
        let resolved = ResolvedConfig {
            config: BiffConfig::default(),
            identity: Identity {
                login: "kai".to_string(),
                display_name: String::new(),
            },
            repo_name: "widgets".to_string(),
            data_dir: dir.path().to_path_buf(),
            repo_root: None,
        };
        let relay = Arc::new(LocalRelay::new(dir.path().to_path_buf()));
        Arc::new(ServerState::new(resolved, relay, "aabb1122".to_string()))
    }

    #[tokio::test]
    async fn startup_inserts_session_and_logs_login() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        startup(&state).await.unwrap();

        let session = state.relay.get_session("kai").await.unwrap().unwrap();
        assert_eq!(session.tty, "aabb1122");

        let events = state.relay.recent_events(Some("kai"), 10).await.unwrap();
        assert_eq!(events[0].kind, EventKind::Login);
    }

    #[tokio::test]
    async fn startup_reaps_same_host_orphans_only() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        // A stale session of ours on this host, and one on another host.
        let mut mine = UserSession::new("kai", "deadbeef", "", &state.host, "/src");
        mine.last_active = Utc::now() - Duration::from_secs(600);
        state.relay.put_session(&mine).await.unwrap();
        let mut elsewhere = UserSession::new("kai", "feedface", "", "other-host", "/src");
        elsewhere.last_active = Utc::now() - Duration::from_secs(600);
        state.relay.put_session(&elsewhere).await.unwrap();

        startup(&state).await.unwrap();

        let expired = state
            .relay
            .expired_sessions(SESSION_TTL)
            .await
            .unwrap();
        let keys: Vec<String> = expired.iter().map(UserSession::key).collect();
        assert!(!keys.contains(&"kai:deadbeef".to_string()));
        assert!(keys.contains(&"kai:feedface".to_string()));

        let events = state.relay.recent_events(Some("kai"), 10).await.unwrap();
        let orphan_logout = events
            .iter()
            .find(|e| e.reason == Some(LogoutReason::Orphan))
            .unwrap();
        assert_eq!(orphan_logout.tty, "deadbeef");
    }

    #[tokio::test]
    async fn shutdown_removes_session_and_logs_logout() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        startup(&state).await.unwrap();
        shutdown(&state).await;

        assert!(state.relay.get_session("kai").await.unwrap().is_none());
        let events = state.relay.recent_events(Some("kai"), 10).await.unwrap();
        assert_eq!(events[0].kind, EventKind::Logout);
        assert_eq!(events[0].reason, Some(LogoutReason::Normal));
    }
}
