//! Login-failure lockout per account and per source address.
//!
//! Flow Overview:
//! 1) Before credentials are checked: refuse deny-listed addresses, then refuse if a
//!    lockout marker exists for the account or (unless allow-listed) the address.
//! 2) After a failed check: increment each tracked counter; a counter that reaches its
//!    threshold sets a marker lasting one window.
//! 3) After a successful check: delete the tracked counters.
//!
//! Counters are only touched through the store's atomic increment and delete. Any store
//! failure is returned to the caller; it never turns into an allow.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::AuthError;
use crate::settings::Settings;
use crate::store::{CounterStore, StoreError};

/// Which key space a counter belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyKind {
    Account,
    Address,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Account => f.write_str("account"),
            Self::Address => f.write_str("address"),
        }
    }
}

/// Counter, threshold and marker for one key space.
#[derive(Clone, Debug)]
struct Tally {
    kind: KeyKind,
    namespace: String,
}

impl Tally {
    fn counter_key(&self, id: &str) -> String {
        format!("{}:login:{}:{id}", self.namespace, self.kind)
    }

    fn marker_key(&self, id: &str) -> String {
        format!("{}:lock:{}:{id}", self.namespace, self.kind)
    }

    async fn locked(&self, store: &dyn CounterStore, id: &str) -> Result<bool, StoreError> {
        store.exists(&self.marker_key(id)).await
    }

    /// Record one failure. Returns true if this failure reached the threshold.
    async fn fail(
        &self,
        store: &dyn CounterStore,
        id: &str,
        threshold: i64,
        window: Duration,
    ) -> Result<bool, StoreError> {
        let count = store.incr(&self.counter_key(id), window).await?;
        debug!(kind = %self.kind, count, threshold, "login failure recorded");
        if count >= threshold {
            store.set_marker(&self.marker_key(id), window).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn reset(&self, store: &dyn CounterStore, id: &str) -> Result<(), StoreError> {
        store.delete(&self.counter_key(id)).await
    }
}

/// Where a login attempt is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attempt {
    /// Credentials not verified yet.
    Pending,
    Failed,
    Succeeded,
}

pub struct Lockout {
    store: Arc<dyn CounterStore>,
    account: Tally,
    address: Tally,
}

impl Lockout {
    pub fn new(store: Arc<dyn CounterStore>, namespace: &str) -> Self {
        Self {
            store,
            account: Tally {
                kind: KeyKind::Account,
                namespace: namespace.to_string(),
            },
            address: Tally {
                kind: KeyKind::Address,
                namespace: namespace.to_string(),
            },
        }
    }

    /// Run the pre-check (`Attempt::Pending`) or record the verification outcome.
    ///
    /// # Errors
    /// `Pending` fails with `AddressBlocked`, `AccountLocked` or `AddressLocked`.
    /// Any attempt fails with `TransientStore` if the counter store is unreachable.
    #[instrument(skip(self, settings))]
    pub async fn check_and_record(
        &self,
        settings: &Settings,
        account: &str,
        address: &str,
        attempt: Attempt,
    ) -> Result<(), AuthError> {
        let store = self.store.as_ref();
        let track_address = !settings.ip_whitelist.contains(address);

        match attempt {
            Attempt::Pending => {
                if settings.ip_blacklist.contains(address) {
                    warn!("Refused login from deny-listed address");
                    return Err(AuthError::AddressBlocked);
                }
                if self.account.locked(store, account).await? {
                    return Err(AuthError::AccountLocked);
                }
                if track_address && self.address.locked(store, address).await? {
                    return Err(AuthError::AddressLocked);
                }
            }
            Attempt::Failed => {
                let window = settings.login_ttl;
                if self
                    .account
                    .fail(store, account, settings.login_failures, window)
                    .await?
                {
                    warn!("Account locked after repeated login failures");
                }
                if track_address
                    && self
                        .address
                        .fail(store, address, settings.ip_login_failures, window)
                        .await?
                {
                    warn!("Address locked after repeated login failures");
                }
            }
            Attempt::Succeeded => {
                self.account.reset(store, account).await?;
                if track_address {
                    self.address.reset(store, address).await?;
                }
            }
        }
        Ok(())
    }

    /// Current failure count for an account or address inside the window.
    ///
    /// # Errors
    /// Returns an error if the counter store is unreachable.
    pub async fn failures(&self, kind: KeyKind, id: &str) -> Result<i64, StoreError> {
        let tally = match kind {
            KeyKind::Account => &self.account,
            KeyKind::Address => &self.address,
        };
        Ok(self
            .store
            .get(&tally.counter_key(id))
            .await?
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::AddressList;
    use crate::store::MemoryStore;

    const WINDOW: Duration = Duration::from_secs(15 * 60);

    fn settings() -> Settings {
        Settings {
            login_ttl: WINDOW,
            login_failures: 5,
            ip_login_failures: 10,
            ..Settings::default()
        }
    }

    fn lockout() -> (Arc<MemoryStore>, Lockout) {
        let store = Arc::new(MemoryStore::new());
        let lockout = Lockout::new(store.clone(), "lab");
        (store, lockout)
    }

    async fn fail(lockout: &Lockout, settings: &Settings, account: &str, address: &str) {
        let result = lockout
            .check_and_record(settings, account, address, Attempt::Failed)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn account_locks_at_threshold_until_window_ends() {
        let (_, lockout) = lockout();
        let settings = settings();

        for _ in 0..5 {
            let pre = lockout
                .check_and_record(&settings, "a1", "10.0.0.1", Attempt::Pending)
                .await;
            assert!(pre.is_ok());
            fail(&lockout, &settings, "a1", "10.0.0.1").await;
            tokio::time::advance(Duration::from_secs(10)).await;
        }

        let sixth = lockout
            .check_and_record(&settings, "a1", "10.0.0.2", Attempt::Pending)
            .await;
        assert!(matches!(sixth, Err(AuthError::AccountLocked)));

        tokio::time::advance(WINDOW).await;
        let later = lockout
            .check_and_record(&settings, "a1", "10.0.0.2", Attempt::Pending)
            .await;
        assert!(later.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn marker_is_not_extended_by_further_failures() {
        let (_, lockout) = lockout();
        let settings = settings();

        for _ in 0..5 {
            fail(&lockout, &settings, "a1", "10.0.0.1").await;
        }
        tokio::time::advance(WINDOW - Duration::from_secs(60)).await;
        fail(&lockout, &settings, "a1", "10.0.0.1").await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let result = lockout
            .check_and_record(&settings, "a1", "10.0.0.1", Attempt::Pending)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn success_resets_failure_history() {
        let (_, lockout) = lockout();
        let settings = settings();

        for _ in 0..3 {
            fail(&lockout, &settings, "a1", "10.0.0.1").await;
        }
        assert_eq!(lockout.failures(KeyKind::Account, "a1").await.ok(), Some(3));

        let ok = lockout
            .check_and_record(&settings, "a1", "10.0.0.1", Attempt::Succeeded)
            .await;
        assert!(ok.is_ok());
        assert_eq!(lockout.failures(KeyKind::Account, "a1").await.ok(), Some(0));
        assert_eq!(
            lockout.failures(KeyKind::Address, "10.0.0.1").await.ok(),
            Some(0)
        );

        fail(&lockout, &settings, "a1", "10.0.0.1").await;
        assert_eq!(lockout.failures(KeyKind::Account, "a1").await.ok(), Some(1));
    }

    #[tokio::test]
    async fn deny_list_wins_over_allow_list() {
        let (_, lockout) = lockout();
        let settings = Settings {
            ip_whitelist: ["10.0.0.9"].into_iter().collect(),
            ip_blacklist: ["10.0.0.9"].into_iter().collect(),
            ..settings()
        };
        let result = lockout
            .check_and_record(&settings, "a1", "10.0.0.9", Attempt::Pending)
            .await;
        assert!(matches!(result, Err(AuthError::AddressBlocked)));
        assert_eq!(
            lockout.failures(KeyKind::Address, "10.0.0.9").await.ok(),
            Some(0)
        );
    }

    #[tokio::test]
    async fn address_locks_across_accounts() {
        let (_, lockout) = lockout();
        let settings = Settings {
            ip_login_failures: 3,
            ..settings()
        };
        for account in ["a1", "a2", "a3"] {
            fail(&lockout, &settings, account, "10.0.0.7").await;
        }
        let result = lockout
            .check_and_record(&settings, "a4", "10.0.0.7", Attempt::Pending)
            .await;
        assert!(matches!(result, Err(AuthError::AddressLocked)));

        let elsewhere = lockout
            .check_and_record(&settings, "a4", "10.0.0.8", Attempt::Pending)
            .await;
        assert!(elsewhere.is_ok());
    }

    #[tokio::test]
    async fn allow_listed_address_is_exempt_from_address_lockout_only() {
        let (_, lockout) = lockout();
        let settings = Settings {
            ip_login_failures: 2,
            ip_whitelist: AddressList::from_iter(["10.0.0.0/24"]),
            ..settings()
        };
        for _ in 0..5 {
            fail(&lockout, &settings, "a1", "10.0.0.3").await;
        }
        assert_eq!(
            lockout.failures(KeyKind::Address, "10.0.0.3").await.ok(),
            Some(0)
        );

        let result = lockout
            .check_and_record(&settings, "a1", "10.0.0.3", Attempt::Pending)
            .await;
        assert!(matches!(result, Err(AuthError::AccountLocked)));
        let other = lockout
            .check_and_record(&settings, "a2", "10.0.0.3", Attempt::Pending)
            .await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn concurrent_failures_still_lock() {
        let (_, lockout) = lockout();
        let lockout = Arc::new(lockout);
        let settings = Arc::new(settings());

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let lockout = lockout.clone();
            let settings = settings.clone();
            tasks.push(tokio::spawn(async move {
                lockout
                    .check_and_record(&settings, "a1", "10.0.0.1", Attempt::Failed)
                    .await
                    .is_ok()
            }));
        }
        for task in tasks {
            assert!(task.await.is_ok_and(|ok| ok));
        }

        assert_eq!(lockout.failures(KeyKind::Account, "a1").await.ok(), Some(20));
        let result = lockout
            .check_and_record(&settings, "a1", "10.0.0.1", Attempt::Pending)
            .await;
        assert!(matches!(result, Err(AuthError::AccountLocked)));
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        let (store, lockout) = lockout();
        let settings = settings();
        store.set_unavailable(true);
        for attempt in [Attempt::Pending, Attempt::Failed, Attempt::Succeeded] {
            let result = lockout
                .check_and_record(&settings, "a1", "10.0.0.1", attempt)
                .await;
            assert!(matches!(result, Err(AuthError::TransientStore(_))));
        }
    }
}
