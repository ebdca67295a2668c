//! Data model for biff communication.
//!
//! Everything the relays store or ship over the wire lives here: messages,
//! sessions, wtmp events, and the address forms that route between them.
//! Stored timestamps are always UTC; rendering in the caller's local zone
//! is the tool layer's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Raised when a user/tty address form fails validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid address: {0}")]
pub struct InvalidAddress(pub String);

/// Characters allowed in logins and tty tokens.
///
/// The same rule protects both backends: no path separators or `..` for
/// the filesystem relay, no `.`/`*`/`>` which are subject metacharacters
/// on the bus.
fn valid_name_part(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Validate a bare login.
pub fn validate_user(user: &str) -> Result<&str, InvalidAddress> {
    if valid_name_part(user) {
        Ok(user)
    } else {
        Err(InvalidAddress(user.to_string()))
    }
}

/// Build a composite session key: `{user}:{tty}`.
pub fn build_session_key(user: &str, tty: &str) -> String {
    format!("{user}:{tty}")
}

/// Split a `{user}:{tty}` session key, validating both parts.
pub fn parse_session_key(key: &str) -> Result<(&str, &str), InvalidAddress> {
    let (user, tty) = key
        .split_once(':')
        .ok_or_else(|| InvalidAddress(key.to_string()))?;
    if valid_name_part(user) && valid_name_part(tty) {
        Ok((user, tty))
    } else {
        Err(InvalidAddress(key.to_string()))
    }
}

/// A message destination.
///
/// `User` is the broadcast form (`"kai"`): the message lands in the
/// per-login inbox and is consumed by whichever of kai's sessions reads
/// first. `Session` (`"kai:a1b2c3d4"`) targets one live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Address {
    User(String),
    Session { user: String, tty: String },
}

impl Address {
    /// Parse a `user` or `user:tty` address, tolerating a leading `@`.
    pub fn parse(raw: &str) -> Result<Self, InvalidAddress> {
        let bare = raw.trim().trim_start_matches('@');
        match bare.split_once(':') {
            Some((user, tty)) => {
                if valid_name_part(user) && valid_name_part(tty) {
                    Ok(Address::Session {
                        user: user.to_string(),
                        tty: tty.to_string(),
                    })
                } else {
                    Err(InvalidAddress(raw.to_string()))
                }
            }
            None => {
                if valid_name_part(bare) {
                    Ok(Address::User(bare.to_string()))
                } else {
                    Err(InvalidAddress(raw.to_string()))
                }
            }
        }
    }

    /// The login this address routes to.
    pub fn user(&self) -> &str {
        match self {
            Address::User(user) => user,
            Address::Session { user, .. } => user,
        }
    }

    /// The tty token, for targeted addresses only.
    pub fn tty(&self) -> Option<&str> {
        match self {
            Address::User(_) => None,
            Address::Session { tty, .. } => Some(tty),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Address::User(_))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::User(user) => write!(f, "{user}"),
            Address::Session { user, tty } => write!(f, "{user}:{tty}"),
        }
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> String {
        addr.to_string()
    }
}

impl TryFrom<String> for Address {
    type Error = InvalidAddress;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::parse(&s)
    }
}

/// Identity resolved once per process from the outside authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub login: String,
    pub display_name: String,
}

/// A single ephemeral message between sessions.
///
/// Immutable once built. Stored as one JSON object per JSONL line in the
/// local relay and as a stream message payload in the cluster relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub from_user: String,
    pub from_tty: String,
    pub to: Address,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// Build a new message stamped with the current time.
    pub fn new(from_user: &str, from_tty: &str, to: Address, body: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_user: from_user.to_string(),
            from_tty: from_tty.to_string(),
            to,
            body: body.to_string(),
            sent_at: Utc::now(),
        }
    }
}

/// A live session: one server process bound to one identity and tty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    pub user: String,
    pub tty: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub plan: String,
    pub started_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub messages_enabled: bool,
    /// Optional human label for the session, shown in TTY columns.
    #[serde(default)]
    pub tty_name: Option<String>,
}

fn default_true() -> bool {
    true
}

impl UserSession {
    pub fn new(user: &str, tty: &str, display_name: &str, host: &str, cwd: &str) -> Self {
        let now = Utc::now();
        Self {
            user: user.to_string(),
            tty: tty.to_string(),
            display_name: display_name.to_string(),
            host: host.to_string(),
            cwd: cwd.to_string(),
            plan: String::new(),
            started_at: now,
            last_active: now,
            messages_enabled: true,
            tty_name: None,
        }
    }

    /// Composite `{user}:{tty}` key.
    pub fn key(&self) -> String {
        build_session_key(&self.user, &self.tty)
    }

    /// The TTY column label: the human name when set, else the hex token.
    pub fn tty_label(&self) -> &str {
        self.tty_name.as_deref().unwrap_or(&self.tty)
    }
}

/// Login/logout event kinds on the wtmp log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Login,
    Logout,
}

/// Why a session was logged out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogoutReason {
    /// Graceful shutdown.
    Normal,
    /// Reaped at startup after a crash left the entry behind.
    Orphan,
    /// Store-side TTL eviction.
    Ttl,
}

/// One append-only entry on the session-history log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: EventKind,
    pub user: String,
    pub tty: String,
    #[serde(default)]
    pub host: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<LogoutReason>,
    /// Human tty label at event time, carried for `last` output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty_name: Option<String>,
}

impl SessionEvent {
    pub fn login(session: &UserSession) -> Self {
        Self {
            kind: EventKind::Login,
            user: session.user.clone(),
            tty: session.tty.clone(),
            host: session.host.clone(),
            timestamp: Utc::now(),
            reason: None,
            tty_name: session.tty_name.clone(),
        }
    }

    pub fn logout(session: &UserSession, reason: LogoutReason) -> Self {
        Self {
            kind: EventKind::Logout,
            user: session.user.clone(),
            tty: session.tty.clone(),
            host: session.host.clone(),
            timestamp: Utc::now(),
            reason: Some(reason),
            tty_name: session.tty_name.clone(),
        }
    }

    pub fn session_key(&self) -> String {
        build_session_key(&self.user, &self.tty)
    }
}

/// Summary of unread messages for the awareness surfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadSummary {
    pub count: usize,
    pub preview: String,
}

const MAX_PREVIEW_LEN: usize = 80;
const MAX_BODY_PREVIEW: usize = 40;
const MAX_PREVIEW_MESSAGES: usize = 3;

/// Build an [`UnreadSummary`] from pending messages.
///
/// Shared by both relays so the preview text is identical whichever
/// backend produced it. `count` may exceed `messages.len()` when the
/// caller could only peek at a subset.
pub fn build_unread_summary(messages: &[Message], count: usize) -> UnreadSummary {
    if count == 0 {
        return UnreadSummary::default();
    }
    let previews: Vec<String> = messages
        .iter()
        .take(MAX_PREVIEW_MESSAGES)
        .map(|m| {
            let body: String = m.body.chars().take(MAX_BODY_PREVIEW).collect();
            format!("@{} about {}", m.from_user, body)
        })
        .collect();
    let mut preview = previews.join(", ");
    if preview.chars().count() > MAX_PREVIEW_LEN {
        preview = preview.chars().take(MAX_PREVIEW_LEN - 3).collect::<String>() + "...";
    }
    UnreadSummary { count, preview }
}
