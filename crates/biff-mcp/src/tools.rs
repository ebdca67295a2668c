//! The tool operations: presence (`who`, `finger`, `plan`, `tty`),
//! messaging (`write`, `read_messages`), availability (`mesg`), and
//! session history (`last`).
//!
//! Every handler converts failures into a short user-facing string —
//! errors never propagate into the transport framing layer. Output
//! strings mimic the BSD originals these tools are named after.

use std::collections::HashMap;

use biff::{
    Address, EventKind, LogoutReason, Message, Relay, RelayError, SessionEvent, UserSession,
};
use rmcp::schemars::{self, JsonSchema};
use serde::Deserialize;
use tracing::warn;

use crate::format::{format_duration, format_idle, format_timestamp, render_table};
use crate::state::ServerState;

const MAX_PLAN_LEN: usize = 200;
const MAX_MESSAGE_LEN: usize = 4096;
const MAX_TTY_NAME_LEN: usize = 32;
const DEFAULT_LAST_COUNT: usize = 25;
const MAX_LAST_COUNT: usize = 200;

const RELAY_UNAVAILABLE: &str = "Relay unavailable.";

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PlanParams {
    /// What you're working on, shown to teammates (max 200 characters).
    pub message: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MesgParams {
    /// true to accept messages, false to mute notifications.
    pub enabled: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FingerParams {
    /// Login to look up, with or without a leading @.
    pub user: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteParams {
    /// Recipient: "user" reaches any of their sessions, "user:tty" one
    /// specific session.
    pub to: String,
    /// Message body (1-4096 characters).
    pub message: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct LastParams {
    /// Filter history to one login.
    #[serde(default)]
    pub user: Option<String>,
    /// Number of rows to show (default 25, max 200).
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TtyParams {
    /// Human-readable name for this session.
    pub name: String,
}

/// Heartbeat: refresh `last_active` before the primary action. A dead
/// relay will surface through the primary action; the heartbeat itself
/// only logs.
pub async fn heartbeat(state: &ServerState) {
    if let Err(err) = state.relay.touch_session(&state.session_key()).await {
        warn!(error = %err, "heartbeat failed");
    }
}

pub async fn plan(state: &ServerState, params: PlanParams) -> String {
    let message = params.message.trim().to_string();
    if message.chars().count() > MAX_PLAN_LEN {
        return format!("Plan update failed: message exceeds {MAX_PLAN_LEN} characters.");
    }
    match state.relay.set_plan(&state.session_key(), &message).await {
        Ok(()) => format!("Plan updated: {message}"),
        Err(RelayError::Unavailable(_)) => RELAY_UNAVAILABLE.to_string(),
        Err(err) => {
            warn!(error = %err, "plan update failed");
            "Plan update failed: internal error.".to_string()
        }
    }
}

pub async fn mesg(state: &ServerState, params: MesgParams) -> String {
    match state
        .relay
        .set_mesg(&state.session_key(), params.enabled)
        .await
    {
        Ok(()) => {
            if params.enabled {
                "is y".to_string()
            } else {
                "is n".to_string()
            }
        }
        Err(_) => RELAY_UNAVAILABLE.to_string(),
    }
}

pub async fn who(state: &ServerState) -> String {
    let mut sessions = match state.relay.list_sessions().await {
        Ok(sessions) => sessions,
        Err(_) => return RELAY_UNAVAILABLE.to_string(),
    };
    if sessions.is_empty() {
        return "No active sessions.".to_string();
    }
    sessions.sort_by(|a, b| (&a.user, &a.tty).cmp(&(&b.user, &b.tty)));

    let rows: Vec<Vec<String>> = sessions
        .iter()
        .map(|s| {
            vec![
                format!("@{}", s.user),
                s.tty_label().to_string(),
                if s.host.is_empty() { "-".to_string() } else { s.host.clone() },
                format_idle(s.last_active),
                (if s.messages_enabled { "y" } else { "n" }).to_string(),
                if s.plan.is_empty() { "-".to_string() } else { s.plan.clone() },
            ]
        })
        .collect();
    render_table(&["NAME", "TTY", "HOST", "IDLE", "MSG", "PLAN"], &rows)
}

pub async fn finger(state: &ServerState, params: FingerParams) -> String {
    let bare = params.user.trim().trim_start_matches('@').to_string();
    if biff::models::validate_user(&bare).is_err() {
        return format!("Login: {bare}\nNever logged in.");
    }
    let session = match state.relay.get_session(&bare).await {
        Ok(session) => session,
        Err(_) => return RELAY_UNAVAILABLE.to_string(),
    };
    let Some(session) = session else {
        return format!("Login: {bare}\nNever logged in.");
    };

    let mut lines = vec![format!("Login: {}", session.user)];
    if !session.display_name.is_empty() {
        lines.push(format!("Name: {}", session.display_name));
    }
    if !session.cwd.is_empty() {
        lines.push(format!("Directory: {}", session.cwd));
    }
    let host = if session.host.is_empty() {
        String::new()
    } else {
        format!(" from {}", session.host)
    };
    lines.push(format!(
        "On since {} on {}{host}, idle {}",
        format_timestamp(session.started_at),
        session.tty_label(),
        format_idle(session.last_active),
    ));
    lines.push(format!(
        "Messages: {}",
        if session.messages_enabled { "on" } else { "off" }
    ));
    if session.plan.is_empty() {
        lines.push("No Plan.".to_string());
    } else {
        lines.push(format!("Plan: {}", session.plan));
    }
    lines.join("\n")
}

pub async fn write(state: &ServerState, params: WriteParams) -> String {
    let body = params.message.trim();
    if body.is_empty() {
        return "Message failed: empty message".to_string();
    }
    if body.chars().count() > MAX_MESSAGE_LEN {
        return "Message failed: invalid input".to_string();
    }
    let to = match Address::parse(&params.to) {
        Ok(to) => to,
        Err(_) => return "Message failed: invalid address".to_string(),
    };

    let message = Message::new(state.login(), &state.tty, to.clone(), body);
    match state.relay.deliver(&message).await {
        Ok(()) => format!("Message sent to @{to}."),
        Err(RelayError::Unavailable(_)) => "Message failed: relay unavailable".to_string(),
        Err(RelayError::InvalidAddress(_)) => "Message failed: invalid address".to_string(),
        Err(err) => {
            warn!(error = %err, "message delivery failed");
            "Message failed: internal error".to_string()
        }
    }
}

pub async fn read_messages(state: &ServerState) -> String {
    let login = state.login().to_string();
    let messages = match state.relay.drain_for(&login, &state.tty).await {
        Ok(messages) => messages,
        Err(_) => return RELAY_UNAVAILABLE.to_string(),
    };
    if messages.is_empty() {
        return "No new messages.".to_string();
    }
    let rows: Vec<Vec<String>> = messages
        .iter()
        .map(|m| {
            vec![
                m.to.user().to_string(),
                format!("from {}", m.from_user),
                m.body.replace('\n', " "),
                format_timestamp(m.sent_at),
            ]
        })
        .collect();
    render_table(&["TO", "FROM", "MESSAGE", "TIME"], &rows)
}

pub async fn last(state: &ServerState, params: LastParams) -> String {
    let count = params
        .count
        .unwrap_or(DEFAULT_LAST_COUNT)
        .clamp(1, MAX_LAST_COUNT);
    let filter = params
        .user
        .as_deref()
        .map(|u| u.trim().trim_start_matches('@').to_string())
        .filter(|u| !u.is_empty());

    let events = match state
        .relay
        .recent_events(filter.as_deref(), count.saturating_mul(2))
        .await
    {
        Ok(events) => events,
        Err(_) => return RELAY_UNAVAILABLE.to_string(),
    };
    if events.is_empty() {
        return "No session history.".to_string();
    }

    let active_keys: Vec<String> = match state.relay.list_sessions().await {
        Ok(sessions) => sessions.iter().map(UserSession::key).collect(),
        Err(_) => Vec::new(),
    };

    let pairs = pair_events(&events);
    let rows: Vec<Vec<String>> = pairs
        .iter()
        .take(count)
        .map(|(login, logout)| last_row(login, logout.as_ref(), &active_keys))
        .collect();
    if rows.is_empty() {
        return "No session history.".to_string();
    }
    render_table(&["NAME", "TTY", "HOST", "LOGIN", "LOGOUT", "DURATION"], &rows)
}

/// Pair login events with their matching logout events.
///
/// Events arrive newest first. A login matches the earliest logout of
/// the same session key at or after the login time; an unmatched login
/// is either still live or simply gone.
fn pair_events(events: &[SessionEvent]) -> Vec<(SessionEvent, Option<SessionEvent>)> {
    let mut logouts: HashMap<String, Vec<SessionEvent>> = HashMap::new();
    let mut logins: Vec<SessionEvent> = Vec::new();
    for event in events {
        match event.kind {
            EventKind::Logout => logouts
                .entry(event.session_key())
                .or_default()
                .push(event.clone()),
            EventKind::Login => logins.push(event.clone()),
        }
    }

    logins
        .into_iter()
        .map(|login| {
            let matched = logouts.get_mut(&login.session_key()).and_then(|candidates| {
                let position = candidates
                    .iter()
                    .rposition(|logout| logout.timestamp >= login.timestamp)?;
                Some(candidates.remove(position))
            });
            (login, matched)
        })
        .collect()
}

fn last_row(
    login: &SessionEvent,
    logout: Option<&SessionEvent>,
    active_keys: &[String],
) -> Vec<String> {
    let tty = login
        .tty_name
        .clone()
        .unwrap_or_else(|| login.tty.clone());
    let host = if login.host.is_empty() {
        "-".to_string()
    } else {
        login.host.clone()
    };
    let (logout_cell, duration) = match logout {
        Some(logout) => {
            let marker = match logout.reason {
                Some(LogoutReason::Orphan) => " (orphan)",
                Some(LogoutReason::Ttl) => " (timeout)",
                _ => "",
            };
            (
                format!("{}{marker}", format_timestamp(logout.timestamp)),
                format_duration(login.timestamp, logout.timestamp),
            )
        }
        None if active_keys.contains(&login.session_key()) => {
            ("still logged in".to_string(), "-".to_string())
        }
        None => ("gone".to_string(), "-".to_string()),
    };
    vec![
        format!("@{}", login.user),
        tty,
        host,
        format_timestamp(login.timestamp),
        logout_cell,
        duration,
    ]
}

pub async fn tty(state: &ServerState, params: TtyParams) -> String {
    let name = params.name.trim().to_string();
    if name.is_empty() || name.chars().count() > MAX_TTY_NAME_LEN {
        return format!("Session name failed: must be 1-{MAX_TTY_NAME_LEN} characters.");
    }
    match state.relay.set_tty_name(&state.session_key(), &name).await {
        Ok(()) => format!("TTY: {name}"),
        Err(_) => RELAY_UNAVAILABLE.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use biff::{BiffConfig, Identity, LocalRelay, Relay, ResolvedConfig};
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_state(dir: &TempDir) -> ServerState {
        let resolved = ResolvedConfig {
            config: BiffConfig::default(),
            identity: Identity {
                login: "kai".to_string(),
                display_name: "Kai Chen".to_string(),
            },
            repo_name: "widgets".to_string(),
            data_dir: dir.path().to_path_buf(),
            repo_root: None,
        };
        let relay = Arc::new(LocalRelay::new(dir.path().to_path_buf()));
        ServerState::new(resolved, relay, "aabb1122".to_string())
    }

    async fn start_session(state: &ServerState) {
        let session = UserSession::new(
            state.login(),
            &state.tty,
            &state.config.identity.display_name,
            "devbox",
            "/src/widgets",
        );
        state.relay.put_session(&session).await.unwrap();
    }

    #[tokio::test]
    async fn presence_round_trip() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        start_session(&state).await;

        let out = plan(
            &state,
            PlanParams {
                message: "fixing auth".to_string(),
            },
        )
        .await;
        assert_eq!(out, "Plan updated: fixing auth");

        let block = finger(
            &state,
            FingerParams {
                user: "@kai".to_string(),
            },
        )
        .await;
        assert!(block.contains("Login: kai"));
        assert!(block.contains("Name: Kai Chen"));
        assert!(block.contains("Plan: fixing auth"));
        assert!(block.contains("Messages: on"));
        assert!(block.contains("On since "));

        let table = who(&state).await;
        assert!(table.starts_with('\u{25b6}'));
        assert!(table.contains("@kai"));
        assert!(table.contains("fixing auth"));
    }

    #[tokio::test]
    async fn plan_overflow_rejected() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        start_session(&state).await;

        let out = plan(
            &state,
            PlanParams {
                message: "x".repeat(201),
            },
        )
        .await;
        assert!(out.starts_with("Plan update failed"));

        // The stored plan is untouched.
        let stored = state.relay.get_session("kai").await.unwrap().unwrap();
        assert_eq!(stored.plan, "");
    }

    #[tokio::test]
    async fn mesg_follows_bsd_convention() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        start_session(&state).await;

        assert_eq!(
            mesg(&state, MesgParams { enabled: false }).await,
            "is n"
        );
        assert_eq!(mesg(&state, MesgParams { enabled: true }).await, "is y");
    }

    #[tokio::test]
    async fn finger_unknown_user() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let out = finger(
            &state,
            FingerParams {
                user: "nobody".to_string(),
            },
        )
        .await;
        assert!(out.contains("Never logged in."));
    }

    #[tokio::test]
    async fn targeted_message_round_trip() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        start_session(&state).await;

        // eric writes to kai's session from another relay handle.
        let eric_relay = LocalRelay::new(dir.path().to_path_buf());
        let msg = Message::new(
            "eric",
            "cc001122",
            Address::parse("kai:aabb1122").unwrap(),
            "hi",
        );
        eric_relay.deliver(&msg).await.unwrap();

        let table = read_messages(&state).await;
        assert!(table.contains("kai"));
        assert!(table.contains("from eric"));
        assert!(table.contains("hi"));

        assert_eq!(read_messages(&state).await, "No new messages.");
    }

    #[tokio::test]
    async fn write_validation() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        start_session(&state).await;

        let empty = write(
            &state,
            WriteParams {
                to: "eric".to_string(),
                message: "   ".to_string(),
            },
        )
        .await;
        assert_eq!(empty, "Message failed: empty message");

        let bad_addr = write(
            &state,
            WriteParams {
                to: "eric:".to_string(),
                message: "hi".to_string(),
            },
        )
        .await;
        assert_eq!(bad_addr, "Message failed: invalid address");

        let too_long = write(
            &state,
            WriteParams {
                to: "eric".to_string(),
                message: "x".repeat(5000),
            },
        )
        .await;
        assert_eq!(too_long, "Message failed: invalid input");

        let sent = write(
            &state,
            WriteParams {
                to: "@eric".to_string(),
                message: "lunch?".to_string(),
            },
        )
        .await;
        assert_eq!(sent, "Message sent to @eric.");

        let targeted = write(
            &state,
            WriteParams {
                to: "eric:cc001122".to_string(),
                message: "you specifically".to_string(),
            },
        )
        .await;
        assert_eq!(targeted, "Message sent to @eric:cc001122.");
    }

    #[tokio::test]
    async fn last_pairs_logins_with_logouts() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        start_session(&state).await;

        let mut session = UserSession::new("eric", "cc001122", "", "laptop", "/src");
        session.started_at = Utc::now() - Duration::from_secs(3600);
        let mut login_event = SessionEvent::login(&session);
        login_event.timestamp = session.started_at;
        state.relay.log_event(&login_event).await.unwrap();
        state
            .relay
            .log_event(&SessionEvent::logout(&session, LogoutReason::Normal))
            .await
            .unwrap();

        let table = last(
            &state,
            LastParams {
                user: Some("eric".to_string()),
                count: None,
            },
        )
        .await;
        assert!(table.contains("@eric"));
        assert!(table.contains("laptop"));
        assert!(table.contains("1:00"));
        assert!(!table.contains("still logged in"));
    }

    #[tokio::test]
    async fn last_marks_live_and_orphaned_sessions() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        start_session(&state).await;

        // Our own live session: login without logout.
        let me = state.relay.get_session("kai").await.unwrap().unwrap();
        state.relay.log_event(&SessionEvent::login(&me)).await.unwrap();

        // An orphaned one.
        let ghost = UserSession::new("eric", "deadbeef", "", "laptop", "/src");
        state.relay.log_event(&SessionEvent::login(&ghost)).await.unwrap();
        state
            .relay
            .log_event(&SessionEvent::logout(&ghost, LogoutReason::Orphan))
            .await
            .unwrap();

        let table = last(&state, LastParams { user: None, count: None }).await;
        assert!(table.contains("still logged in"));
        assert!(table.contains("(orphan)"));
    }

    #[tokio::test]
    async fn tty_names_the_session() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        start_session(&state).await;

        assert_eq!(
            tty(
                &state,
                TtyParams {
                    name: "auth-work".to_string()
                }
            )
            .await,
            "TTY: auth-work"
        );

        let table = who(&state).await;
        assert!(table.contains("auth-work"));

        let rejected = tty(&state, TtyParams { name: "  ".to_string() }).await;
        assert!(rejected.starts_with("Session name failed"));
    }
}
