//! End-to-end relay behavior over a shared temp directory: the
//! properties that must hold for two processes pointed at the same repo
//! scope, exercised through the public `Relay` trait.

#![allow(clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use biff::relay::SESSION_TTL;
use biff::{Address, LocalRelay, LogoutReason, Message, Relay, SessionEvent, UserSession};
use tempfile::TempDir;

fn shared_relay(dir: &TempDir) -> LocalRelay {
    LocalRelay::new(dir.path().to_path_buf())
}

#[tokio::test]
async fn broadcast_to_offline_user_persists() {
    let dir = TempDir::new().unwrap();
    let sender = shared_relay(&dir);

    // No kai session exists yet; broadcast delivery still succeeds.
    let msg = Message::new("eric", "cc001122", Address::parse("kai").unwrap(), "standup");
    sender.deliver(&msg).await.unwrap();

    // kai starts later, in a different relay handle, and finds it.
    let receiver = shared_relay(&dir);
    let session = UserSession::new("kai", "aabb1122", "", "devbox", "/src");
    receiver.put_session(&session).await.unwrap();
    let drained = receiver.drain_for("kai", "aabb1122").await.unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].body, "standup");
}

#[tokio::test]
async fn broadcast_consumed_by_first_reader_only() {
    let dir = TempDir::new().unwrap();
    let relay = shared_relay(&dir);

    let msg = Message::new("eric", "cc001122", Address::parse("kai").unwrap(), "hi");
    relay.deliver(&msg).await.unwrap();

    // Three sessions of kai race; only one gets the message.
    let mut totals = 0;
    for tty in ["aaaa0001", "aaaa0002", "aaaa0003"] {
        totals += relay.drain_for("kai", tty).await.unwrap().len();
    }
    assert_eq!(totals, 1);
}

#[tokio::test]
async fn concurrent_drainers_never_share_a_message() {
    let dir = TempDir::new().unwrap();
    let relay = Arc::new(shared_relay(&dir));

    for i in 0..20 {
        let msg = Message::new(
            "eric",
            "cc001122",
            Address::parse("kai").unwrap(),
            &format!("msg-{i}"),
        );
        relay.deliver(&msg).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let relay = Arc::clone(&relay);
        handles.push(tokio::spawn(async move {
            relay.drain_for("kai", "aabb1122").await.unwrap()
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for msg in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(msg.id), "message delivered to two drainers");
        }
    }
    assert_eq!(total, 20);
}

#[tokio::test]
async fn do_not_disturb_does_not_block_storage() {
    let dir = TempDir::new().unwrap();
    let relay = shared_relay(&dir);

    let session = UserSession::new("kai", "aabb1122", "", "devbox", "/src");
    relay.put_session(&session).await.unwrap();
    relay.set_mesg("kai:aabb1122", false).await.unwrap();

    let msg = Message::new(
        "eric",
        "cc001122",
        Address::parse("kai:aabb1122").unwrap(),
        "psst",
    );
    relay.deliver(&msg).await.unwrap();

    // The unread count sees through do-not-disturb...
    let summary = relay.peek_unread("kai", "aabb1122").await.unwrap();
    assert_eq!(summary.count, 1);

    // ...and reading on demand reveals the message.
    let drained = relay.drain_for("kai", "aabb1122").await.unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].body, "psst");

    let stored = relay.get_session("kai").await.unwrap().unwrap();
    assert!(!stored.messages_enabled);
}

#[tokio::test]
async fn set_mesg_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let relay = shared_relay(&dir);
    let session = UserSession::new("kai", "aabb1122", "", "devbox", "/src");
    relay.put_session(&session).await.unwrap();

    relay.set_mesg("kai:aabb1122", false).await.unwrap();
    relay.set_mesg("kai:aabb1122", false).await.unwrap();
    let stored = relay.get_session("kai").await.unwrap().unwrap();
    assert!(!stored.messages_enabled);
}

#[tokio::test]
async fn crash_recovery_flow() {
    let dir = TempDir::new().unwrap();

    // A process wrote a session and then died without logging out.
    {
        let relay = shared_relay(&dir);
        let mut session = UserSession::new("kai", "deadbeef", "", "devbox", "/src");
        session.last_active = chrono::Utc::now() - Duration::from_secs(600);
        relay.put_session(&session).await.unwrap();
        relay.log_event(&SessionEvent::login(&session)).await.unwrap();
    }

    // The next startup of the same identity reaps it.
    let relay = shared_relay(&dir);
    let orphans = relay.expired_sessions(SESSION_TTL).await.unwrap();
    assert_eq!(orphans.len(), 1);
    for orphan in &orphans {
        relay
            .log_event(&SessionEvent::logout(orphan, LogoutReason::Orphan))
            .await
            .unwrap();
        relay.delete_session(&orphan.key()).await.unwrap();
    }

    assert!(relay.list_sessions().await.unwrap().is_empty());
    let events = relay.recent_events(Some("kai"), 10).await.unwrap();
    assert_eq!(events[0].reason, Some(LogoutReason::Orphan));
}
