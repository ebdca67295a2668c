//! Session identity: the per-process tty token and host facts.
//!
//! Each server process gets one random tty token at startup, analogous to
//! a Unix PTY device name. Combined with the login it forms the session
//! key `{user}:{tty}` that scopes inboxes and presence entries.

use rand::Rng;

/// Generate an 8-character lowercase hex tty token.
pub fn generate_tty() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 4] = rng.gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Current hostname, or `"unknown"` when the OS refuses to say.
pub fn get_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Current working directory as a display string.
pub fn get_cwd() -> String {
    std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}
