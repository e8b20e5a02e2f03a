//! TTL-capable key/value primitives backing lockout counters and session state.
//!
//! Both traits are deliberately narrow: callers never read a counter, modify it
//! locally and write it back. Every mutation is a single store-side operation so
//! concurrent failed logins for the same key cannot lose updates.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid payload: {0}")]
    Decode(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("store unavailable")]
    Unavailable,
}

/// Counters and lockout markers.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` and return the new value.
    ///
    /// The expiry is set when the counter is created (or re-created after it
    /// expired) and is not extended by later increments.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Set a marker unless a live one already exists. An existing marker keeps
    /// its original expiry.
    async fn set_marker(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

/// Short-lived string values: active sessions and refresh codes.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Remove `key` and return its value if it was still live. Two concurrent
    /// takes of the same key never both observe the value.
    async fn take(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Push the expiry of a live key forward. Returns `false` if the key is gone.
    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key` only if it still holds `value`. Returns whether it was deleted.
    async fn delete_if(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Live keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Delete every key starting with `prefix`. Returns how many live keys went away.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;
}
