//! Keeps the process-wide [`Settings`] snapshot in step with the config store.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{ConfigStore, Revision, Settings};
use crate::auth::AuthError;

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(60);

/// Read handle on the published settings.
///
/// Cheap to clone. Readers get either the previous or the next complete document,
/// never a mix of both.
#[derive(Clone, Debug)]
pub struct Snapshot {
    rx: watch::Receiver<Arc<Settings>>,
}

impl Snapshot {
    /// A snapshot that never changes.
    #[must_use]
    pub fn fixed(settings: Settings) -> Self {
        let (_tx, rx) = watch::channel(Arc::new(settings));
        Self { rx }
    }

    #[must_use]
    pub fn current(&self) -> Arc<Settings> {
        self.rx.borrow().clone()
    }

    /// Wait until a newer snapshot is published.
    ///
    /// # Errors
    /// Returns an error once the synchronizer has stopped.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.rx.changed().await
    }
}

/// The only writer of the [`Snapshot`].
pub struct ConfigSync {
    store: Arc<dyn ConfigStore>,
    tx: watch::Sender<Arc<Settings>>,
    version: u64,
}

impl ConfigSync {
    /// Fetch the document once and publish it as the first snapshot.
    ///
    /// A key that was never written yields the built-in defaults.
    ///
    /// # Errors
    /// Returns `ConfigUnavailable` if the store cannot be read or the stored
    /// document is invalid.
    #[instrument(skip(store))]
    pub async fn bootstrap(store: Arc<dyn ConfigStore>) -> Result<(Self, Snapshot), AuthError> {
        let revision = store.get().await.map_err(|err| {
            error!("Failed to fetch settings: {err}");
            AuthError::ConfigUnavailable(err.to_string())
        })?;

        let (settings, version) = match revision {
            Some(Revision { version, payload }) => {
                let settings = Settings::from_slice(&payload).map_err(|err| {
                    error!("Stored settings are invalid: {err}");
                    AuthError::ConfigUnavailable(err.to_string())
                })?;
                (settings, version)
            }
            None => {
                warn!("No settings document found, using defaults");
                (Settings::default(), 0)
            }
        };

        info!(version, "settings loaded");

        let (tx, rx) = watch::channel(Arc::new(settings));
        Ok((
            Self {
                store,
                tx,
                version,
            },
            Snapshot { rx },
        ))
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Watch the store until `cancel` fires.
    ///
    /// Watch failures keep the current snapshot and reopen the watch with
    /// exponential backoff. After every (re)open the current document is fetched so
    /// changes made while disconnected are not missed.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut backoff = RETRY_BASE;

        loop {
            let opened = tokio::select! {
                () = cancel.cancelled() => break,
                opened = self.store.watch() => opened,
            };

            let mut updates = match opened {
                Ok(updates) => updates,
                Err(err) => {
                    warn!(
                        "Failed to watch settings, retrying in {} seconds: {err}",
                        backoff.as_secs()
                    );
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RETRY_MAX);
                    continue;
                }
            };
            backoff = RETRY_BASE;

            match self.store.get().await {
                Ok(Some(revision)) => self.apply(revision),
                Ok(None) => {}
                Err(err) => warn!("Failed to refresh settings after watch: {err}"),
            }

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("settings sync stopped");
                        return;
                    }
                    update = updates.recv() => match update {
                        Some(Ok(revision)) => self.apply(revision),
                        Some(Err(err)) => {
                            warn!("Settings watch error, keeping version {}: {err}", self.version);
                        }
                        None => {
                            warn!("Settings watch closed, reopening");
                            break;
                        }
                    }
                }
            }
        }

        info!("settings sync stopped");
    }

    /// Publish `revision` unless it is the one applied last.
    ///
    /// A version lower than the last one is a new document: stores restart their
    /// numbering when a key is deleted and written again.
    fn apply(&mut self, revision: Revision) {
        if revision.version == self.version {
            debug!(version = revision.version, "settings revision already applied");
            return;
        }
        if revision.version < self.version {
            warn!(
                version = revision.version,
                previous = self.version,
                "settings version went backwards, treating it as a rewritten document"
            );
        }
        // A rejected revision still counts as seen.
        let version = revision.version;
        self.version = version;
        match Settings::from_slice(&revision.payload) {
            Ok(settings) => {
                self.tx.send_replace(Arc::new(settings));
                info!(version, "settings updated");
            }
            Err(err) => {
                error!(version, "Ignoring invalid settings revision: {err}");
            }
        }
    }
}
