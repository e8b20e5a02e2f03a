//! In-process store used for local development and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{CounterStore, SessionStore, StoreError};

#[derive(Debug)]
struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Expiry uses `tokio::time::Instant`, so paused-clock tests can move through a
/// lockout window without sleeping.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: Mutex<HashMap<String, Entry<i64>>>,
    values: Mutex<HashMap<String, Entry<String>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        // Expired counters and markers are dropped on write.
        counters.retain(|_, entry| entry.live(now));
        let entry = counters.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at: now + ttl,
        });
        entry.value += 1;
        Ok(entry.value)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.check()?;
        let now = Instant::now();
        let counters = self.counters.lock().await;
        Ok(counters
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.value))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.counters.lock().await.remove(key);
        Ok(())
    }

    async fn set_marker(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        counters.retain(|_, entry| entry.live(now));
        counters.entry(key.to_string()).or_insert(Entry {
            value: 1,
            expires_at: now + ttl,
        });
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        let now = Instant::now();
        let counters = self.counters.lock().await;
        Ok(counters.get(key).is_some_and(|entry| entry.live(now)))
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        let mut values = self.values.lock().await;
        // Expired entries are dropped on write.
        let now = Instant::now();
        values.retain(|_, entry| entry.live(now));
        values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let now = Instant::now();
        let values = self.values.lock().await;
        Ok(values
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut values = self.values.lock().await;
        Ok(values
            .remove(key)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.value))
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut values = self.values.lock().await;
        match values.get_mut(key) {
            Some(entry) if entry.live(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut values = self.values.lock().await;
        if values
            .get(key)
            .is_some_and(|entry| entry.live(now) && entry.value == value)
        {
            values.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let now = Instant::now();
        let values = self.values.lock().await;
        let mut keys: Vec<String> = values
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        self.check()?;
        let now = Instant::now();
        let mut values = self.values.lock().await;
        let mut removed = 0;
        values.retain(|key, entry| {
            if !key.starts_with(prefix) {
                return true;
            }
            if entry.live(now) {
                removed += 1;
            }
            false
        });
        Ok(removed)
    }
}
