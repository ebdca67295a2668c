//! Biff core: the data model, configuration discovery, and relay
//! backends behind the team-communication server.
//!
//! Biff runs beside each developer's coding session and lets humans and
//! agents sharing a repository see each other, exchange ephemeral
//! messages, and coordinate without leaving the terminal. This crate is
//! transport-agnostic; the tool-call surface lives in `biff-mcp`.

pub mod config;
pub mod models;
pub mod relay;
pub mod tty;

pub use config::{load_config, BiffConfig, ConfigError, LoadOptions, RelayAuth, ResolvedConfig};
pub use models::{
    build_session_key, parse_session_key, Address, EventKind, Identity, InvalidAddress,
    LogoutReason, Message, SessionEvent, UnreadSummary, UserSession,
};
pub use relay::{relay_for_config, LocalRelay, NatsRelay, Relay, RelayError, RelayResult};
