//! Durable, watchable configuration store.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};

use crate::store::StoreError;

/// One stored version of the configuration document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Revision {
    /// Version assigned by the store. Increases with every write and starts over when
    /// the key is deleted and written again.
    pub version: u64,
    pub payload: Vec<u8>,
}

pub type RevisionStream = mpsc::Receiver<Result<Revision, StoreError>>;

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Current document, or `None` if the key has never been written.
    async fn get(&self) -> Result<Option<Revision>, StoreError>;

    /// Subscribe to new revisions. The subscription ends when the returned
    /// receiver is dropped; a closed receiver means the watch has to be reopened.
    async fn watch(&self) -> Result<RevisionStream, StoreError>;
}

/// In-process configuration store for local development and tests.
#[derive(Debug)]
pub struct MemoryConfigStore {
    current: watch::Sender<Option<Revision>>,
    outage: watch::Sender<bool>,
    unavailable: AtomicBool,
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self {
            current: watch::Sender::new(None),
            outage: watch::Sender::new(false),
            unavailable: AtomicBool::new(false),
        }
    }
}

impl MemoryConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new document and notify watchers. Returns the new version.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> u64 {
        let payload = payload.into();
        let mut version = 0;
        self.current.send_modify(|current| {
            version = current.as_ref().map_or(1, |revision| revision.version + 1);
            *current = Some(Revision { version, payload });
        });
        version
    }

    /// Remove the document. The next `publish` starts again at version 1.
    pub fn delete(&self) {
        self.current.send_replace(None);
    }

    /// Simulate an outage. Open watches receive an error and close; `get` and
    /// `watch` fail until the store is available again.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
        self.outage.send_replace(unavailable);
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
impl ConfigStore for MemoryConfigStore {
    async fn get(&self) -> Result<Option<Revision>, StoreError> {
        self.check()?;
        Ok(self.current.borrow().clone())
    }

    async fn watch(&self) -> Result<RevisionStream, StoreError> {
        self.check()?;
        let (tx, rx) = mpsc::channel(16);
        let mut current = self.current.subscribe();
        current.mark_unchanged();
        let mut outage = self.outage.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    changed = outage.changed() => {
                        if changed.is_err() || *outage.borrow_and_update() {
                            let _ = tx.send(Err(StoreError::Unavailable)).await;
                            break;
                        }
                    }
                    changed = current.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let revision = current.borrow_and_update().clone();
                        if let Some(revision) = revision
                            && tx.send(Ok(revision)).await.is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_bumps_version_and_notifies() {
        let store = MemoryConfigStore::new();
        assert_eq!(store.get().await.ok(), Some(None));

        let mut updates = match store.watch().await {
            Ok(updates) => updates,
            Err(err) => panic!("watch failed: {err}"),
        };
        assert_eq!(store.publish(b"{}".to_vec()), 1);
        assert_eq!(store.publish(b"{\"login_failures\":3}".to_vec()), 2);

        let mut last = 0;
        while last < 2 {
            match updates.recv().await {
                Some(Ok(revision)) => last = revision.version,
                other => panic!("unexpected update: {other:?}"),
            }
        }
        assert_eq!(store.get().await.ok().flatten().map(|r| r.version), Some(2));
    }

    #[tokio::test]
    async fn delete_restarts_versions() {
        let store = MemoryConfigStore::new();
        store.publish(b"{}".to_vec());
        store.publish(b"{}".to_vec());
        store.delete();
        assert_eq!(store.get().await.ok(), Some(None));
        assert_eq!(store.publish(b"{}".to_vec()), 1);
    }

    #[tokio::test]
    async fn outage_closes_open_watches() {
        let store = MemoryConfigStore::new();
        let mut updates = match store.watch().await {
            Ok(updates) => updates,
            Err(err) => panic!("watch failed: {err}"),
        };
        store.set_unavailable(true);
        assert!(matches!(
            updates.recv().await,
            Some(Err(StoreError::Unavailable))
        ));
        assert!(updates.recv().await.is_none());
        assert!(store.watch().await.is_err());
        assert!(store.get().await.is_err());

        store.set_unavailable(false);
        assert!(store.watch().await.is_ok());
    }
}
