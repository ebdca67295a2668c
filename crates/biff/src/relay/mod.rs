//! Relay capability set and backend selection.
//!
//! The relay abstracts how one server process reaches the shared
//! storage+transport layer. The server is per-user; the relay is shared.
//! Two implementations exist: [`LocalRelay`](local::LocalRelay) over a
//! per-repo filesystem directory, and [`NatsRelay`](nats::NatsRelay) over
//! a clustered pub/sub + KV bus.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ResolvedConfig;
use crate::models::{InvalidAddress, Message, SessionEvent, UnreadSummary, UserSession};

pub mod local;
pub mod nats;

pub use local::LocalRelay;
pub use nats::NatsRelay;

/// How long a live session stays visible in `who`/`finger` after its last
/// heartbeat, and the orphan-reaping threshold at startup.
pub const SESSION_TTL: Duration = Duration::from_secs(120);

/// Upper bound on any single relay operation.
pub const OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced by relay operations. Failures are reported upward,
/// never retried inside the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The backing store is unreachable (or an operation timed out).
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    /// A user/tty address form failed validation.
    #[error(transparent)]
    InvalidAddress(#[from] InvalidAddress),
    /// A bug-shaped failure: corrupt state the relay cannot express.
    #[error("internal relay error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Unavailable(err.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

/// The capability set every backend exposes, atomically per operation.
///
/// Session keys are composite `{user}:{tty}` strings. `deliver` followed
/// by `drain_for` from any process eventually returns the message;
/// `drain_for` is atomic with respect to concurrent drains of the same
/// inbox, so a message reaches at most one caller.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Upsert the caller's session snapshot.
    async fn put_session(&self, session: &UserSession) -> RelayResult<()>;

    /// Refresh `last_active` to now.
    async fn touch_session(&self, key: &str) -> RelayResult<()>;

    /// All live sessions in this repository scope.
    async fn list_sessions(&self) -> RelayResult<Vec<UserSession>>;

    /// Any live session of `login`; the newest `last_active` wins when
    /// several exist.
    async fn get_session(&self, login: &str) -> RelayResult<Option<UserSession>>;

    async fn set_plan(&self, key: &str, plan: &str) -> RelayResult<()>;

    async fn set_mesg(&self, key: &str, enabled: bool) -> RelayResult<()>;

    async fn set_tty_name(&self, key: &str, name: &str) -> RelayResult<()>;

    /// Remove a session entry (graceful shutdown, orphan reaping).
    async fn delete_session(&self, key: &str) -> RelayResult<()>;

    /// Sessions whose `last_active` is older than `threshold`, without
    /// sweeping them. Startup orphan reconciliation reads these before
    /// any `list_sessions` call gets a chance to sweep.
    async fn expired_sessions(&self, threshold: Duration) -> RelayResult<Vec<UserSession>>;

    /// Route a message to the broadcast inbox (`User` address) or the
    /// targeted session inbox (`Session` address).
    async fn deliver(&self, message: &Message) -> RelayResult<()>;

    /// Return and remove all pending messages for both `User(login)` and
    /// `Session(login, tty)`, merged and sorted by `sent_at` ascending.
    async fn drain_for(&self, login: &str, tty: &str) -> RelayResult<Vec<Message>>;

    /// Same merge as [`drain_for`](Relay::drain_for), without removal.
    async fn peek_unread(&self, login: &str, tty: &str) -> RelayResult<UnreadSummary>;

    /// Append to the session-history log.
    async fn log_event(&self, event: &SessionEvent) -> RelayResult<()>;

    /// Newest events first, optionally filtered by login.
    async fn recent_events(
        &self,
        user: Option<&str>,
        limit: usize,
    ) -> RelayResult<Vec<SessionEvent>>;

    /// Release all backing resources.
    async fn close(&self) -> RelayResult<()>;
}

/// Select a backend from resolved configuration: a relay URL means the
/// cluster relay, its absence means the filesystem relay.
pub async fn relay_for_config(resolved: &ResolvedConfig) -> RelayResult<Arc<dyn Relay>> {
    match &resolved.config.relay_url {
        Some(url) => {
            let relay = NatsRelay::connect(
                url,
                resolved.config.relay_auth.clone().unwrap_or_default(),
                &resolved.repo_name,
                &resolved.identity.login,
            )
            .await?;
            Ok(Arc::new(relay))
        }
        None => Ok(Arc::new(LocalRelay::new(resolved.data_dir.clone()))),
    }
}

/// Atomically write `content` to `path` via temp-file-then-rename,
/// creating parent directories as needed.
pub fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    if let Err(err) = std::fs::write(&tmp, content) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }
    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

/// Bound a relay future by [`OP_TIMEOUT`], surfacing `Unavailable`.
pub(crate) async fn with_timeout<T, F>(fut: F) -> RelayResult<T>
where
    F: std::future::Future<Output = RelayResult<T>>,
{
    match tokio::time::timeout(OP_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Unavailable("operation timed out".to_string())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        atomic_write(&path, "one").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one");
        atomic_write(&path, "two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        // No temp litter left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn with_timeout_bounds_slow_operations() {
        tokio::time::pause();
        let fut = with_timeout::<(), _>(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let result = fut.await;
        assert!(matches!(result, Err(RelayError::Unavailable(_))));
    }
}
