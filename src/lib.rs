//! Korgalore delivers public-inbox mailing list archives into user
//! mailboxes.
//!
//! Feeds are either remote archives published as epoch git
//! repositories (lore.kernel.org style) or local `lei` searches;
//! targets are IMAP, JMAP, Maildir, Gmail or an external command. The
//! pipeline keeps a per-(feed, delivery) commit cursor so every
//! message is delivered exactly once, in order, across crashes,
//! transient target failures, epoch rollovers and upstream rebases.

use std::sync::RwLock;

pub mod bozofilter;
pub mod config;
pub mod error;
pub mod feed;
pub mod message;
pub mod pipeline;
pub mod targets;
pub mod tracking;

pub use error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

static USER_AGENT_PLUS: RwLock<Option<String>> = RwLock::new(None);

/// Record the `main.user_agent_plus` config value; the latest call
/// wins.
pub fn set_user_agent_plus(id: &str) {
    *USER_AGENT_PLUS.write().expect("user agent lock") = Some(id.to_string());
}

/// The User-Agent string for outbound HTTP and search-tool calls:
/// `korgalore/<version>[+<id>]`.
pub fn user_agent() -> String {
    match USER_AGENT_PLUS.read().expect("user agent lock").as_deref() {
        Some(id) => format!("korgalore/{}+{}", VERSION, id),
        None => format!("korgalore/{}", VERSION),
    }
}

/// The value for `GIT_HTTP_USER_AGENT`:
/// `git/<git-version> (korgalore/<version>[+<id>])`.
pub fn git_http_user_agent(git_version: &str) -> String {
    format!("git/{} ({})", git_version, user_agent())
}
