//! Settings document stored in Vault KV-v2.
//!
//! Flow Overview:
//! 1) `get` reads `/v1/{mount}/data/{path}`; the secret's fields are the document and
//!    the KV version is the revision number. A missing secret is `None`.
//! 2) `watch` polls `/v1/{mount}/metadata/{path}` and reads the document again whenever
//!    `current_version` moves. The poller stops when the receiver is dropped or after
//!    the first failed request; the caller reopens the watch.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info_span, instrument};

use crate::cli::globals::GlobalArgs;
use crate::settings::{ConfigStore, Revision, RevisionStream};
use crate::store::StoreError;

#[derive(Clone, Debug)]
pub struct VaultConfigStore {
    globals: GlobalArgs,
    client: Client,
    mount: String,
    path: String,
    poll: Duration,
}

impl VaultConfigStore {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        globals: GlobalArgs,
        mount: &str,
        path: &str,
        poll: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            globals,
            client: super::client()?,
            mount: mount.trim_matches('/').to_string(),
            path: path.trim_matches('/').to_string(),
            poll,
        })
    }

    async fn fetch(&self, kind: &str) -> Result<Option<Value>, StoreError> {
        let path = format!("/v1/{}/{kind}/{}", self.mount, self.path);
        let url = super::endpoint_url(&self.globals.vault_url, &path)
            .map_err(|err| StoreError::Rejected(err.to_string()))?;

        let span = info_span!(
            "vault.kv.read",
            http.method = "GET",
            vault.kv.endpoint = kind,
            url = %url
        );
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", self.globals.vault_token.expose_secret())
            .send()
            .instrument(span)
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Rejected(format!(
                "vault kv {kind} failed: {status} {body}"
            )));
        }
        Ok(Some(response.json().await?))
    }

    async fn current_version(&self) -> Result<Option<u64>, StoreError> {
        self.fetch("metadata")
            .await?
            .map(|body| parse_current_version(&body))
            .transpose()
    }
}

/// Extract the document and its version from a KV-v2 read response.
fn parse_secret(body: &Value) -> Result<Revision, StoreError> {
    let data = body
        .get("data")
        .ok_or_else(|| StoreError::Decode("vault response has no data".to_string()))?;
    let version = data
        .get("metadata")
        .and_then(|metadata| metadata.get("version"))
        .and_then(Value::as_u64)
        .ok_or_else(|| StoreError::Decode("vault response has no version".to_string()))?;
    let document = data
        .get("data")
        .filter(|document| document.is_object())
        .ok_or_else(|| StoreError::Decode("vault secret is not an object".to_string()))?;
    let payload =
        serde_json::to_vec(document).map_err(|err| StoreError::Decode(err.to_string()))?;
    Ok(Revision { version, payload })
}

fn parse_current_version(body: &Value) -> Result<u64, StoreError> {
    body.get("data")
        .and_then(|data| data.get("current_version"))
        .and_then(Value::as_u64)
        .ok_or_else(|| StoreError::Decode("vault metadata has no current_version".to_string()))
}

#[async_trait]
impl ConfigStore for VaultConfigStore {
    #[instrument(skip(self), fields(mount = %self.mount, path = %self.path))]
    async fn get(&self) -> Result<Option<Revision>, StoreError> {
        self.fetch("data")
            .await?
            .map(|body| parse_secret(&body))
            .transpose()
    }

    #[instrument(skip(self), fields(mount = %self.mount, path = %self.path))]
    async fn watch(&self) -> Result<RevisionStream, StoreError> {
        let mut last = self.current_version().await?;
        let (tx, rx) = mpsc::channel(4);
        let store = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.poll.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                let update = match store.current_version().await {
                    Ok(version) if version == last => continue,
                    Ok(version) => {
                        debug!(?version, "settings version changed");
                        last = version;
                        match store.get().await {
                            Ok(Some(revision)) => Ok(revision),
                            Ok(None) => continue,
                            Err(err) => Err(err),
                        }
                    }
                    Err(err) => Err(err),
                };

                let failed = update.is_err();
                if tx.send(update).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_kv_read_response() {
        let body = json!({
            "data": {
                "data": { "login_failures": 3, "ip_whitelist": ["10.0.0.1"] },
                "metadata": { "version": 7, "destroyed": false }
            }
        });
        let revision = parse_secret(&body);
        assert!(revision.is_ok());
        if let Ok(revision) = revision {
            assert_eq!(revision.version, 7);
            let document: Result<Value, _> = serde_json::from_slice(&revision.payload);
            assert_eq!(
                document.ok().and_then(|doc| doc.get("login_failures").cloned()),
                Some(json!(3))
            );
        }
    }

    #[test]
    fn rejects_malformed_kv_response() {
        assert!(parse_secret(&json!({})).is_err());
        assert!(parse_secret(&json!({ "data": { "data": null, "metadata": { "version": 1 } } })).is_err());
        assert!(parse_secret(&json!({ "data": { "data": {}, "metadata": {} } })).is_err());
    }

    #[test]
    fn parses_current_version() {
        let body = json!({ "data": { "current_version": 12, "oldest_version": 1 } });
        assert_eq!(parse_current_version(&body).ok(), Some(12));
        assert!(parse_current_version(&json!({ "data": {} })).is_err());
    }

    #[test]
    fn trims_mount_and_path() {
        let globals = GlobalArgs::new("http://127.0.0.1:8200".to_string());
        let store = VaultConfigStore::new(globals, "/secret/", "/warden/values/", Duration::from_secs(5));
        assert!(store.is_ok_and(|store| store.mount == "secret" && store.path == "warden/values"));
    }
}
