//! Clustered relay over a NATS JetStream bus.
//!
//! Sessions live in a per-repo KV bucket with a 30-day TTL; messages ride
//! a per-repo `WorkQueue` stream whose ack-on-read semantics give the POP
//! contract for free; wtmp events ride a second, age-limited stream.
//! All resource names are deterministic and repository-scoped:
//!
//! ```text
//! KV bucket:   biff-{repo}-sessions
//! stream:      BIFF_{repo}_INBOX     subjects biff.{repo}.inbox.>
//! wtmp stream: BIFF_{repo}_WTMP      subjects biff.{repo}.wtmp.>
//! client name: biff-{repo}-{login}
//! ```
//!
//! Targeted subjects carry four tokens (`biff.{repo}.inbox.{u}.{t}`),
//! broadcast three (`biff.{repo}.inbox.{u}`), so exact-match consumer
//! filters never cross kinds while one `inbox.>` filter covers both.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_nats::jetstream::{self, consumer, kv, stream};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayAuth;
use crate::models::{
    build_unread_summary, validate_user, Address, EventKind, LogoutReason, Message, SessionEvent,
    UnreadSummary, UserSession,
};
use crate::relay::{with_timeout, Relay, RelayError, RelayResult};

const KV_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const WTMP_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const INBOX_MAX_BYTES: i64 = 10 * 1024 * 1024;
const KV_MAX_BYTES: i64 = 1024 * 1024;
const FETCH_BATCH: usize = 100;
const FETCH_EXPIRES: Duration = Duration::from_secs(1);
const WTMP_READ_BATCH: usize = 500;
const WTMP_READ_EXPIRES: Duration = Duration::from_millis(400);

fn unavailable(err: impl std::fmt::Display) -> RelayError {
    RelayError::Unavailable(err.to_string())
}

async fn apply_auth(
    options: async_nats::ConnectOptions,
    auth: RelayAuth,
) -> RelayResult<async_nats::ConnectOptions> {
    if let Some(token) = auth.token {
        Ok(options.token(token))
    } else if let Some(seed_path) = auth.nkeys_seed {
        let seed = std::fs::read_to_string(&seed_path)
            .map_err(|err| RelayError::Unavailable(format!("nkey seed {seed_path}: {err}")))?;
        Ok(options.nkey(seed.trim().to_string()))
    } else if let Some(creds) = auth.user_credentials {
        options
            .credentials_file(&creds)
            .await
            .map_err(|err| RelayError::Unavailable(format!("credentials {creds}: {err}")))
    } else {
        Ok(options)
    }
}

/// Reachability probe for diagnostics: connect within `timeout`, then
/// drop the connection. Provisions nothing.
pub async fn probe(url: &str, auth: RelayAuth, timeout: Duration) -> RelayResult<()> {
    let options = apply_auth(
        async_nats::ConnectOptions::new()
            .name("biff-doctor")
            .connection_timeout(timeout),
        auth,
    )
    .await?;
    match tokio::time::timeout(timeout, options.connect(url)).await {
        Ok(Ok(_client)) => Ok(()),
        Ok(Err(err)) => Err(unavailable(err)),
        Err(_) => Err(RelayError::Unavailable("connection timed out".to_string())),
    }
}

/// Relay over a NATS JetStream deployment.
pub struct NatsRelay {
    js: jetstream::Context,
    kv: kv::Store,
    inbox: stream::Stream,
    repo: String,
    /// KV keys this process deleted itself, so the TTL watcher can tell
    /// its own deletions apart from server-side evictions.
    self_deleted: std::sync::Arc<Mutex<HashSet<String>>>,
    ttl_watcher: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl std::fmt::Debug for NatsRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsRelay")
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}

impl NatsRelay {
    /// Connect and provision all repo-scoped infrastructure. Repeated
    /// creates are idempotent on the server side.
    pub async fn connect(
        url: &str,
        auth: RelayAuth,
        repo: &str,
        login: &str,
    ) -> RelayResult<Self> {
        let mut options = async_nats::ConnectOptions::new()
            .name(format!("biff-{repo}-{login}"))
            .connection_timeout(Duration::from_secs(5))
            .event_callback(|event| async move {
                match event {
                    async_nats::Event::Connected => info!("reconnected to relay bus"),
                    async_nats::Event::Disconnected => warn!("disconnected from relay bus"),
                    async_nats::Event::ClientError(err) => error!(%err, "relay bus client error"),
                    other => debug!(event = %other, "relay bus event"),
                }
            });

        options = apply_auth(options, auth).await?;

        let client = options.connect(url).await.map_err(unavailable)?;
        let js = jetstream::new(client);

        let kv = js
            .create_key_value(kv::Config {
                bucket: format!("biff-{repo}-sessions"),
                max_age: KV_TTL,
                max_bytes: KV_MAX_BYTES,
                ..Default::default()
            })
            .await
            .map_err(unavailable)?;

        let inbox = js
            .get_or_create_stream(stream::Config {
                name: format!("BIFF_{repo}_INBOX"),
                subjects: vec![format!("biff.{repo}.inbox.>").into()],
                retention: stream::RetentionPolicy::WorkQueue,
                max_bytes: INBOX_MAX_BYTES,
                max_age: KV_TTL,
                allow_direct: true,
                ..Default::default()
            })
            .await
            .map_err(unavailable)?;

        js.get_or_create_stream(stream::Config {
            name: format!("BIFF_{repo}_WTMP"),
            subjects: vec![format!("biff.{repo}.wtmp.>").into()],
            max_age: WTMP_MAX_AGE,
            ..Default::default()
        })
        .await
        .map_err(unavailable)?;

        let relay = Self {
            js,
            kv,
            inbox,
            repo: repo.to_string(),
            self_deleted: std::sync::Arc::new(Mutex::new(HashSet::new())),
            ttl_watcher: Mutex::new(None),
        };
        relay.spawn_ttl_watcher();
        Ok(relay)
    }

    fn kv_key(user: &str, tty: &str) -> String {
        // KV keys forbid ':', so the composite key is dot-joined here.
        format!("{user}.{tty}")
    }

    fn broadcast_subject(&self, user: &str) -> String {
        format!("biff.{}.inbox.{user}", self.repo)
    }

    fn session_subject(&self, user: &str, tty: &str) -> String {
        format!("biff.{}.inbox.{user}.{tty}", self.repo)
    }

    fn wtmp_subject(&self, user: &str) -> String {
        format!("biff.{}.wtmp.{user}", self.repo)
    }

    fn wtmp_stream_name(&self) -> String {
        format!("BIFF_{}_WTMP", self.repo)
    }

    async fn read_kv_session(&self, key: &str) -> RelayResult<Option<UserSession>> {
        let Some(bytes) = self.kv.get(key).await.map_err(unavailable)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                warn!(key, error = %err, "skipping corrupt session entry");
                Ok(None)
            }
        }
    }

    async fn write_kv_session(&self, session: &UserSession) -> RelayResult<()> {
        let key = Self::kv_key(&session.user, &session.tty);
        let json =
            serde_json::to_vec(session).map_err(|err| RelayError::Internal(err.to_string()))?;
        self.kv
            .put(key.as_str(), json.into())
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    /// Read-modify-write one session entry; `put` resets the KV TTL.
    async fn update_session<F>(&self, key: &str, mutate: F) -> RelayResult<()>
    where
        F: FnOnce(&mut UserSession),
    {
        let (user, tty) = crate::models::parse_session_key(key)?;
        let kv_key = Self::kv_key(user, tty);
        let mut session = self
            .read_kv_session(&kv_key)
            .await?
            .unwrap_or_else(|| UserSession::new(user, tty, "", "", ""));
        mutate(&mut session);
        self.write_kv_session(&session).await
    }

    async fn all_sessions(&self) -> RelayResult<Vec<UserSession>> {
        let mut keys = self.kv.keys().await.map_err(unavailable)?;
        let mut sessions = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(unavailable)?;
            if let Some(session) = self.read_kv_session(&key).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// One of the two per-caller durable consumers. `WorkQueue` allows a
    /// single consumer per filter subject; durables let repeated drains
    /// and peeks share it instead of racing ephemeral cleanup.
    async fn inbox_consumer(
        &self,
        durable: &str,
        filter: &str,
    ) -> RelayResult<consumer::Consumer<consumer::pull::Config>> {
        self.inbox
            .get_or_create_consumer(
                durable,
                consumer::pull::Config {
                    durable_name: Some(durable.to_string()),
                    filter_subject: filter.to_string(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    max_deliver: 1,
                    ..Default::default()
                },
            )
            .await
            .map_err(unavailable)
    }

    async fn drain_consumer(
        &self,
        durable: &str,
        filter: &str,
        out: &mut Vec<Message>,
    ) -> RelayResult<()> {
        let consumer = self.inbox_consumer(durable, filter).await?;
        let mut batch = consumer
            .fetch()
            .max_messages(FETCH_BATCH)
            .expires(FETCH_EXPIRES)
            .messages()
            .await
            .map_err(unavailable)?;
        while let Some(raw) = batch.next().await {
            let raw = raw.map_err(unavailable)?;
            match serde_json::from_slice::<Message>(&raw.payload) {
                Ok(msg) => out.push(msg),
                Err(err) => warn!(filter, error = %err, "skipping malformed bus message"),
            }
            raw.ack().await.map_err(unavailable)?;
        }
        Ok(())
    }

    async fn pending_count(&self, durable: &str, filter: &str) -> RelayResult<u64> {
        let mut consumer = self.inbox_consumer(durable, filter).await?;
        let info = consumer.info().await.map_err(unavailable)?;
        Ok(info.num_pending)
    }

    /// Newest pending message on a subject, read without consuming via
    /// direct get. Absence is not an error.
    async fn peek_last(&self, subject: &str) -> Option<Message> {
        match self.inbox.direct_get_last_for_subject(subject).await {
            Ok(raw) => serde_json::from_slice(&raw.payload).ok(),
            Err(_) => None,
        }
    }

    fn spawn_ttl_watcher(&self) {
        let cancel = CancellationToken::new();
        let kv = self.kv.clone();
        let js = self.js.clone();
        let wtmp_subject_prefix = format!("biff.{}.wtmp", self.repo);
        let self_deleted = std::sync::Arc::clone(&self.self_deleted);
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let mut entries = tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    watch = kv.watch(">") => match watch {
                        Ok(entries) => entries,
                        Err(err) => {
                            warn!(error = %err, "session watcher failed to start, retrying");
                            tokio::select! {
                                _ = task_cancel.cancelled() => return,
                                _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                            }
                        }
                    },
                };
                loop {
                    let entry = tokio::select! {
                        _ = task_cancel.cancelled() => return,
                        entry = entries.next() => entry,
                    };
                    match entry {
                        Some(Ok(entry))
                            if matches!(
                                entry.operation,
                                kv::Operation::Delete | kv::Operation::Purge
                            ) =>
                        {
                            let ours = self_deleted
                                .lock()
                                .map(|mut set| set.remove(&entry.key))
                                .unwrap_or(false);
                            if ours {
                                continue;
                            }
                            let Some((user, tty)) = entry.key.split_once('.') else {
                                continue;
                            };
                            let event = SessionEvent {
                                kind: EventKind::Logout,
                                user: user.to_string(),
                                tty: tty.to_string(),
                                host: String::new(),
                                timestamp: Utc::now(),
                                reason: Some(LogoutReason::Ttl),
                                tty_name: None,
                            };
                            let subject = format!("{wtmp_subject_prefix}.{user}");
                            if let Ok(json) = serde_json::to_vec(&event) {
                                match js.publish(subject, json.into()).await {
                                    Ok(ack) => {
                                        if let Err(err) = ack.await {
                                            warn!(error = %err, "ttl logout event not acked");
                                        }
                                    }
                                    Err(err) => {
                                        warn!(error = %err, "failed to publish ttl logout event");
                                    }
                                }
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "session watcher stream error, restarting");
                            break;
                        }
                        None => break,
                    }
                }
            }
        });

        if let Ok(mut guard) = self.ttl_watcher.lock() {
            *guard = Some((cancel, handle));
        }
    }
}

#[async_trait]
impl Relay for NatsRelay {
    async fn put_session(&self, session: &UserSession) -> RelayResult<()> {
        validate_user(&session.user)?;
        validate_user(&session.tty)?;
        with_timeout(self.write_kv_session(session)).await
    }

    async fn touch_session(&self, key: &str) -> RelayResult<()> {
        with_timeout(self.update_session(key, |session| {
            session.last_active = Utc::now();
        }))
        .await
    }

    async fn list_sessions(&self) -> RelayResult<Vec<UserSession>> {
        with_timeout(async {
            let cutoff = Utc::now() - crate::relay::SESSION_TTL;
            Ok(self
                .all_sessions()
                .await?
                .into_iter()
                .filter(|s| s.last_active >= cutoff)
                .collect())
        })
        .await
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
        with_timeout(self.update_session(key, |session| {
            session.plan = plan.to_string();
        }))
        .await
    }

    async fn set_mesg(&self, key: &str, enabled: bool) -> RelayResult<()> {
        with_timeout(self.update_session(key, |session| {
            session.messages_enabled = enabled;
        }))
        .await
    }

    async fn set_tty_name(&self, key: &str, name: &str) -> RelayResult<()> {
        with_timeout(self.update_session(key, |session| {
            session.tty_name = if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            };
        }))
        .await
    }

    async fn delete_session(&self, key: &str) -> RelayResult<()> {
        let (user, tty) = crate::models::parse_session_key(key)?;
        let kv_key = Self::kv_key(user, tty);
        if let Ok(mut set) = self.self_deleted.lock() {
            set.insert(kv_key.clone());
        }
        with_timeout(async {
            self.kv
                .delete(kv_key.as_str())
                .await
                .map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn expired_sessions(&self, threshold: Duration) -> RelayResult<Vec<UserSession>> {
        with_timeout(async {
            let cutoff = Utc::now() - threshold;
            Ok(self
                .all_sessions()
                .await?
                .into_iter()
                .filter(|s| s.last_active < cutoff)
                .collect())
        })
        .await
    }

    async fn deliver(&self, message: &Message) -> RelayResult<()> {
        validate_user(&message.from_user)?;
        let subject = match &message.to {
            Address::User(user) => {
                validate_user(user)?;
                self.broadcast_subject(user)
            }
            Address::Session { user, tty } => {
                validate_user(user)?;
                validate_user(tty)?;
                self.session_subject(user, tty)
            }
        };
        let json =
            serde_json::to_vec(message).map_err(|err| RelayError::Internal(err.to_string()))?;
        with_timeout(async {
            let ack = self.js.publish(subject, json.into()).await.map_err(unavailable)?;
            ack.await.map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn drain_for(&self, login: &str, tty: &str) -> RelayResult<Vec<Message>> {
        validate_user(login)?;
        validate_user(tty)?;
        with_timeout(async {
            let mut messages = Vec::new();
            self.drain_consumer(
                &format!("inbox-{login}"),
                &self.broadcast_subject(login),
                &mut messages,
            )
            .await?;
            self.drain_consumer(
                &format!("inbox-{login}-{tty}"),
                &self.session_subject(login, tty),
                &mut messages,
            )
            .await?;
            messages.sort_by_key(|m| m.sent_at);
            Ok(messages)
        })
        .await
    }

    async fn peek_unread(&self, login: &str, tty: &str) -> RelayResult<UnreadSummary> {
        validate_user(login)?;
        validate_user(tty)?;
        with_timeout(async {
            let broadcast = self.broadcast_subject(login);
            let targeted = self.session_subject(login, tty);
            let count = self
                .pending_count(&format!("inbox-{login}"), &broadcast)
                .await?
                + self
                    .pending_count(&format!("inbox-{login}-{tty}"), &targeted)
                    .await?;
            if count == 0 {
                return Ok(UnreadSummary::default());
            }
            let mut previews = Vec::new();
            for subject in [&broadcast, &targeted] {
                if let Some(msg) = self.peek_last(subject).await {
                    previews.push(msg);
                }
            }
            previews.sort_by_key(|m| m.sent_at);
            Ok(build_unread_summary(&previews, count as usize))
        })
        .await
    }

    async fn log_event(&self, event: &SessionEvent) -> RelayResult<()> {
        validate_user(&event.user)?;
        let subject = self.wtmp_subject(&event.user);
        let json =
            serde_json::to_vec(event).map_err(|err| RelayError::Internal(err.to_string()))?;
        with_timeout(async {
            let ack = self.js.publish(subject, json.into()).await.map_err(unavailable)?;
            ack.await.map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn recent_events(
        &self,
        user: Option<&str>,
        limit: usize,
    ) -> RelayResult<Vec<SessionEvent>> {
        let filter = match user {
            Some(user) => {
                validate_user(user)?;
                self.wtmp_subject(user)
            }
            None => format!("biff.{}.wtmp.>", self.repo),
        };
        with_timeout(async {
            let wtmp = self
                .js
                .get_stream(self.wtmp_stream_name())
                .await
                .map_err(unavailable)?;
            let consumer = wtmp
                .create_consumer(consumer::pull::Config {
                    filter_subject: filter.clone(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ..Default::default()
                })
                .await
                .map_err(unavailable)?;

            let mut events: Vec<SessionEvent> = Vec::new();
            loop {
                let mut batch = consumer
                    .fetch()
                    .max_messages(WTMP_READ_BATCH)
                    .expires(WTMP_READ_EXPIRES)
                    .messages()
                    .await
                    .map_err(unavailable)?;
                let mut received = 0;
                while let Some(raw) = batch.next().await {
                    let raw = raw.map_err(unavailable)?;
                    received += 1;
                    match serde_json::from_slice::<SessionEvent>(&raw.payload) {
                        Ok(event) => events.push(event),
                        Err(err) => warn!(error = %err, "skipping malformed wtmp entry"),
                    }
                    let _ = raw.ack().await;
                }
                if received < WTMP_READ_BATCH {
                    break;
                }
            }
            // Stream order is oldest first; newest first for display.
            events.reverse();
            events.truncate(limit);
            Ok(events)
        })
        .await
    }

    async fn close(&self) -> RelayResult<()> {
        let watcher = self.ttl_watcher.lock().ok().and_then(|mut g| g.take());
        if let Some((cancel, handle)) = watcher {
            cancel.cancel();
            let _ = handle.await;
        }
        // The client connection closes when the last clone drops.
        Ok(())
    }
}
