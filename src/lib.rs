//! # Warden (session authentication and live policy core)
//!
//! `warden` guards an administrative API. It issues and verifies session tokens,
//! enforces login-failure lockouts per account and per source address, and keeps an
//! in-memory snapshot of the operational policy in sync with a shared key-value store.
//!
//! ## Policy Snapshot
//!
//! The policy document (lockout window, thresholds, address allow/deny lists, password
//! rules) lives in Vault KV-v2 and is never edited through the HTTP API. A single
//! background task watches the key and publishes each decoded revision as an immutable
//! [`settings::Settings`] value. Handlers read the current `Arc` once per request and
//! keep using it until they finish.
//!
//! - **Bootstrap:** the first fetch must succeed before the listener binds.
//! - **Bad revisions:** a document that fails to decode is logged and ignored; the
//!   previous snapshot stays in effect.
//!
//! ## Lockout
//!
//! Failed logins increment two independent counters (account and source address) in
//! Postgres. Reaching a threshold sets a lockout marker that lasts one window. Deny-listed
//! addresses are always refused; allow-listed addresses are exempt from address lockout
//! but not from account lockout.
//!
//! ## Sessions
//!
//! Tokens are signed JWTs. Each user has one server-side session record, so logging out
//! or signing in elsewhere revokes a token that would otherwise still verify.

pub mod api;
pub mod auth;
pub mod cli;
pub mod settings;
pub mod store;
pub mod vault;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
