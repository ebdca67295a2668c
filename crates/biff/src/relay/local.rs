//! Filesystem relay for single-host teams.
//!
//! Rooted at a per-repo data directory:
//!
//! ```text
//! {data_dir}/
//!     session-kai-a1b2c3d4.json      # one session snapshot per file
//!     inbox-kai-a1b2c3d4.jsonl       # targeted messages
//!     userinbox-kai.jsonl            # broadcast messages
//!     wtmp.jsonl                     # login/logout event log
//! ```
//!
//! Snapshots are written temp-file-then-rename. Inboxes are append-only
//! JSONL; drains hold an exclusive advisory lock across read+truncate so
//! concurrent drainers in different processes serialize and each message
//! is consumed exactly once.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use tracing::warn;

use crate::models::{
    build_unread_summary, parse_session_key, validate_user, Address, Message, SessionEvent,
    UnreadSummary, UserSession,
};
use crate::relay::{atomic_write, Relay, RelayError, RelayResult, SESSION_TTL};

const WTMP_MAX_LINES: usize = 10_000;
const WTMP_KEEP_LINES: usize = 5_000;

/// Relay over a shared filesystem directory.
#[derive(Debug, Clone)]
pub struct LocalRelay {
    data_dir: PathBuf,
}

impl LocalRelay {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn session_path(&self, user: &str, tty: &str) -> PathBuf {
        self.data_dir.join(format!("session-{user}-{tty}.json"))
    }

    fn session_inbox_path(&self, user: &str, tty: &str) -> PathBuf {
        self.data_dir.join(format!("inbox-{user}-{tty}.jsonl"))
    }

    fn user_inbox_path(&self, user: &str) -> PathBuf {
        self.data_dir.join(format!("userinbox-{user}.jsonl"))
    }

    fn wtmp_path(&self) -> PathBuf {
        self.data_dir.join("wtmp.jsonl")
    }

    fn read_session_file(&self, path: &Path) -> Option<UserSession> {
        let text = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&text) {
            Ok(session) => Some(session),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping corrupt session file");
                None
            }
        }
    }

    fn write_session(&self, session: &UserSession) -> RelayResult<()> {
        let path = self.session_path(&session.user, &session.tty);
        let json = serde_json::to_string_pretty(session)
            .map_err(|err| RelayError::Internal(err.to_string()))?;
        atomic_write(&path, &(json + "\n"))?;
        Ok(())
    }

    /// Read-modify-write one session snapshot.
    fn update_session<F>(&self, key: &str, mutate: F) -> RelayResult<()>
    where
        F: FnOnce(&mut UserSession),
    {
        let (user, tty) = parse_session_key(key)?;
        let path = self.session_path(user, tty);
        let mut session = self.read_session_file(&path).unwrap_or_else(|| {
            // A tool call can race the snapshot write at startup; recover
            // with a minimal entry rather than failing the call.
            UserSession::new(user, tty, "", "", "")
        });
        mutate(&mut session);
        self.write_session(&session)
    }

    fn scan_sessions(&self) -> RelayResult<Vec<(PathBuf, UserSession)>> {
        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut sessions = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if !name.starts_with("session-") || !name.ends_with(".json") {
                continue;
            }
            if let Some(session) = self.read_session_file(&path) {
                sessions.push((path, session));
            }
        }
        Ok(sessions)
    }

    /// Open an inbox file and take an exclusive advisory lock.
    ///
    /// Both append (deliver) and read+truncate (drain) go through this,
    /// so a drain can never truncate away a line appended mid-flight by
    /// another process.
    fn open_locked(path: &Path) -> RelayResult<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn append_line(path: &Path, line: &str) -> RelayResult<()> {
        let mut file = Self::open_locked(path)?;
        file.seek(std::io::SeekFrom::End(0))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    fn parse_inbox_lines(path: &Path, text: &str) -> Vec<Message> {
        let mut messages = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(msg) => messages.push(msg),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "skipping malformed inbox line"
                    );
                }
            }
        }
        messages
    }

    /// Read an inbox, truncating it to empty while the lock is held.
    fn drain_inbox(path: &Path) -> RelayResult<Vec<Message>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut file = Self::open_locked(path)?;
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        let messages = Self::parse_inbox_lines(path, &text);
        file.set_len(0)?;
        Ok(messages)
    }

    /// Read an inbox without consuming it.
    fn peek_inbox(path: &Path) -> RelayResult<Vec<Message>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = OpenOptions::new().read(true).open(path)?;
        file.lock_shared()?;
        let mut text = String::new();
        (&file).read_to_string(&mut text)?;
        Ok(Self::parse_inbox_lines(path, &text))
    }

    fn merged_pending(&self, login: &str, tty: &str, consume: bool) -> RelayResult<Vec<Message>> {
        validate_user(login)?;
        validate_user(tty)?;
        let paths = [
            self.user_inbox_path(login),
            self.session_inbox_path(login, tty),
        ];
        let mut messages = Vec::new();
        for path in &paths {
            let mut batch = if consume {
                Self::drain_inbox(path)?
            } else {
                Self::peek_inbox(path)?
            };
            messages.append(&mut batch);
        }
        // Stable sort: within one inbox, ties keep arrival order.
        messages.sort_by_key(|m| m.sent_at);
        Ok(messages)
    }

    fn rotate_wtmp_locked(file: &mut File, text: &str) -> RelayResult<()> {
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() <= WTMP_MAX_LINES {
            return Ok(());
        }
        let keep = &lines[lines.len() - WTMP_KEEP_LINES..];
        let mut rewritten = keep.join("\n");
        rewritten.push('\n');
        file.set_len(0)?;
        file.seek(std::io::SeekFrom::Start(0))?;
        file.write_all(rewritten.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

#[async_trait]
impl Relay for LocalRelay {
    async fn put_session(&self, session: &UserSession) -> RelayResult<()> {
        validate_user(&session.user)?;
        validate_user(&session.tty)?;
        self.write_session(session)
    }

    async fn touch_session(&self, key: &str) -> RelayResult<()> {
        self.update_session(key, |session| {
            session.last_active = Utc::now();
        })
    }

    async fn list_sessions(&self) -> RelayResult<Vec<UserSession>> {
        let cutoff = Utc::now() - SESSION_TTL;
        let mut live = Vec::new();
        for (path, session) in self.scan_sessions()? {
            if session.last_active >= cutoff {
                live.push(session);
            } else {
                // Stale snapshot: the owning process is gone. Sweep it so
                // the directory doesn't accumulate dead entries.
                let _ = std::fs::remove_file(&path);
            }
        }
        Ok(live)
    }

    async fn get_session(&self, login: &str) -> RelayResult<Option<UserSession>> {
        validate_user(login)?;
        let sessions = self.list_sessions().await?;
        Ok(sessions
            .into_iter()
            .filter(|s| s.user == login)
            .max_by_key(|s| s.last_active))
    }

    async fn set_plan(&self, key: &str, plan: &str) -> RelayResult<()> {
        self.update_session(key, |session| {
            session.plan = plan.to_string();
        })
    }

    async fn set_mesg(&self, key: &str, enabled: bool) -> RelayResult<()> {
        self.update_session(key, |session| {
            session.messages_enabled = enabled;
        })
    }

    async fn set_tty_name(&self, key: &str, name: &str) -> RelayResult<()> {
        self.update_session(key, |session| {
            session.tty_name = if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            };
        })
    }

    async fn delete_session(&self, key: &str) -> RelayResult<()> {
        let (user, tty) = parse_session_key(key)?;
        let path = self.session_path(user, tty);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn expired_sessions(&self, threshold: Duration) -> RelayResult<Vec<UserSession>> {
        let cutoff = Utc::now() - threshold;
        Ok(self
            .scan_sessions()?
            .into_iter()
            .map(|(_, session)| session)
            .filter(|s| s.last_active < cutoff)
            .collect())
    }

    async fn deliver(&self, message: &Message) -> RelayResult<()> {
        validate_user(&message.from_user)?;
        let line =
            serde_json::to_string(message).map_err(|err| RelayError::Internal(err.to_string()))?;
        let path = match &message.to {
            Address::User(user) => {
                validate_user(user)?;
                self.user_inbox_path(user)
            }
            Address::Session { user, tty } => {
                validate_user(user)?;
                validate_user(tty)?;
                self.session_inbox_path(user, tty)
            }
        };
        Self::append_line(&path, &line)
    }

    async fn drain_for(&self, login: &str, tty: &str) -> RelayResult<Vec<Message>> {
        self.merged_pending(login, tty, true)
    }

    async fn peek_unread(&self, login: &str, tty: &str) -> RelayResult<UnreadSummary> {
        let pending = self.merged_pending(login, tty, false)?;
        Ok(build_unread_summary(&pending, pending.len()))
    }

    async fn log_event(&self, event: &SessionEvent) -> RelayResult<()> {
        let line =
            serde_json::to_string(event).map_err(|err| RelayError::Internal(err.to_string()))?;
        let path = self.wtmp_path();
        let mut file = Self::open_locked(&path)?;
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        text.push_str(&line);
        text.push('\n');
        Self::rotate_wtmp_locked(&mut file, &text)
    }

    async fn recent_events(
        &self,
        user: Option<&str>,
        limit: usize,
    ) -> RelayResult<Vec<SessionEvent>> {
        if let Some(user) = user {
            validate_user(user)?;
        }
        let path = self.wtmp_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path)?;
        let mut events: Vec<SessionEvent> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    warn!(error = %err, "skipping malformed wtmp line");
                }
            }
        }
        if let Some(user) = user {
            events.retain(|e| e.user == user);
        }
        // Appended chronologically; newest first for display.
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }

    async fn close(&self) -> RelayResult<()> {
        // Nothing held open between operations.
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::{EventKind, LogoutReason};
    use tempfile::TempDir;

    fn relay() -> (TempDir, LocalRelay) {
        let dir = TempDir::new().unwrap();
        let relay = LocalRelay::new(dir.path().to_path_buf());
        (dir, relay)
    }

    fn message(to: &str, body: &str) -> Message {
        Message::new("eric", "cc001122", Address::parse(to).unwrap(), body)
    }

    #[tokio::test]
    async fn session_round_trip() {
        let (_dir, relay) = relay();
        let session = UserSession::new("kai", "a1b2c3d4", "Kai", "devbox", "/src");
        relay.put_session(&session).await.unwrap();

        let found = relay.get_session("kai").await.unwrap().unwrap();
        assert_eq!(found.tty, "a1b2c3d4");
        assert_eq!(found.display_name, "Kai");
        assert!(found.last_active >= found.started_at);
    }

    #[tokio::test]
    async fn touch_is_monotone() {
        let (_dir, relay) = relay();
        let session = UserSession::new("kai", "a1b2c3d4", "", "devbox", "/src");
        relay.put_session(&session).await.unwrap();

        let before = relay.get_session("kai").await.unwrap().unwrap().last_active;
        relay.touch_session("kai:a1b2c3d4").await.unwrap();
        let after = relay.get_session("kai").await.unwrap().unwrap().last_active;
        assert!(after >= before);
    }

    #[tokio::test]
    async fn newest_session_wins_for_login() {
        let (_dir, relay) = relay();
        let mut older = UserSession::new("kai", "aaaaaaaa", "", "devbox", "/src");
        older.last_active = Utc::now() - Duration::from_secs(30);
        let newer = UserSession::new("kai", "bbbbbbbb", "", "devbox", "/src");
        relay.put_session(&older).await.unwrap();
        relay.put_session(&newer).await.unwrap();

        let found = relay.get_session("kai").await.unwrap().unwrap();
        assert_eq!(found.tty, "bbbbbbbb");
    }

    #[tokio::test]
    async fn stale_sessions_hidden_and_swept() {
        let (dir, relay) = relay();
        let mut stale = UserSession::new("kai", "a1b2c3d4", "", "devbox", "/src");
        stale.last_active = Utc::now() - Duration::from_secs(600);
        relay.put_session(&stale).await.unwrap();

        assert!(relay.list_sessions().await.unwrap().is_empty());
        assert!(!dir.path().join("session-kai-a1b2c3d4.json").exists());
    }

    #[tokio::test]
    async fn expired_sessions_visible_without_sweep() {
        let (dir, relay) = relay();
        let mut stale = UserSession::new("kai", "a1b2c3d4", "", "devbox", "/src");
        stale.last_active = Utc::now() - Duration::from_secs(600);
        relay.put_session(&stale).await.unwrap();

        let expired = relay.expired_sessions(SESSION_TTL).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert!(dir.path().join("session-kai-a1b2c3d4.json").exists());
    }

    #[tokio::test]
    async fn targeted_deliver_drain_pop() {
        let (_dir, relay) = relay();
        relay.deliver(&message("kai:a1b2c3d4", "hi")).await.unwrap();

        let drained = relay.drain_for("kai", "a1b2c3d4").await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].body, "hi");

        // POP semantics: a second drain returns nothing.
        assert!(relay.drain_for("kai", "a1b2c3d4").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn broadcast_and_targeted_never_cross() {
        let (dir, relay) = relay();
        relay.deliver(&message("kai", "broadcast")).await.unwrap();
        relay.deliver(&message("kai:a1b2c3d4", "targeted")).await.unwrap();

        assert!(dir.path().join("userinbox-kai.jsonl").exists());
        assert!(dir.path().join("inbox-kai-a1b2c3d4.jsonl").exists());

        // A different session of kai sees only the broadcast.
        let other = relay.drain_for("kai", "ffffffff").await.unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].body, "broadcast");

        // The targeted copy still waits for its session.
        let mine = relay.drain_for("kai", "a1b2c3d4").await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].body, "targeted");
    }

    #[tokio::test]
    async fn drain_merges_sorted_by_sent_at() {
        let (_dir, relay) = relay();
        let mut first = message("kai:a1b2c3d4", "first");
        first.sent_at = Utc::now() - Duration::from_secs(60);
        let second = message("kai", "second");
        // Deliver newest first to prove sorting is by sent_at, not file order.
        relay.deliver(&second).await.unwrap();
        relay.deliver(&first).await.unwrap();

        let drained = relay.drain_for("kai", "a1b2c3d4").await.unwrap();
        let bodies: Vec<&str> = drained.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn peek_counts_without_consuming() {
        let (_dir, relay) = relay();
        relay.deliver(&message("kai", "one")).await.unwrap();
        relay.deliver(&message("kai:a1b2c3d4", "two")).await.unwrap();

        let summary = relay.peek_unread("kai", "a1b2c3d4").await.unwrap();
        assert_eq!(summary.count, 2);
        assert!(summary.preview.contains("@eric about one"));

        // Still there afterwards.
        assert_eq!(relay.drain_for("kai", "a1b2c3d4").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn malformed_inbox_lines_are_skipped() {
        let (dir, relay) = relay();
        relay.deliver(&message("kai", "good")).await.unwrap();
        let inbox = dir.path().join("userinbox-kai.jsonl");
        let mut text = std::fs::read_to_string(&inbox).unwrap();
        text.push_str("{not json\n");
        std::fs::write(&inbox, text).unwrap();

        let drained = relay.drain_for("kai", "a1b2c3d4").await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].body, "good");
    }

    #[tokio::test]
    async fn wtmp_append_filter_and_order() {
        let (_dir, relay) = relay();
        let kai = UserSession::new("kai", "a1b2c3d4", "", "devbox", "/src");
        let eric = UserSession::new("eric", "cc001122", "", "laptop", "/src");
        relay.log_event(&SessionEvent::login(&kai)).await.unwrap();
        relay.log_event(&SessionEvent::login(&eric)).await.unwrap();
        relay
            .log_event(&SessionEvent::logout(&kai, LogoutReason::Normal))
            .await
            .unwrap();

        let events = relay.recent_events(Some("kai"), 10).await.unwrap();
        assert_eq!(events.len(), 2);
        // Newest first.
        assert_eq!(events[0].kind, EventKind::Logout);
        assert_eq!(events[0].reason, Some(LogoutReason::Normal));
        assert_eq!(events[1].kind, EventKind::Login);

        let limited = relay.recent_events(None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn wtmp_rotates_keeping_newest() {
        let (dir, relay) = relay();
        let path = dir.path().join("wtmp.jsonl");
        let session = UserSession::new("kai", "a1b2c3d4", "", "devbox", "/src");
        let line = serde_json::to_string(&SessionEvent::login(&session)).unwrap();
        let mut bulk = String::new();
        for _ in 0..WTMP_MAX_LINES {
            bulk.push_str(&line);
            bulk.push('\n');
        }
        std::fs::write(&path, bulk).unwrap();

        relay.log_event(&SessionEvent::login(&session)).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), WTMP_KEEP_LINES);
    }

    #[tokio::test]
    async fn path_escaping_names_rejected() {
        let (_dir, relay) = relay();
        assert!(matches!(
            relay.drain_for("../etc", "a1b2c3d4").await,
            Err(RelayError::InvalidAddress(_))
        ));
        let mut bad = UserSession::new("kai", "a1b2c3d4", "", "", "");
        bad.user = "../../escape".to_string();
        assert!(relay.put_session(&bad).await.is_err());
    }
}
