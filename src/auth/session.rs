//! Session tokens, refresh codes and revocation.
//!
//! Flow Overview:
//! 1) `issue` signs fresh claims and records `{ns}:session:{sub} -> jti`. A user has one
//!    session; issuing again replaces it.
//! 2) `verify` checks the signature and expiry, then requires the recorded jti to match
//!    so a logged-out or replaced token stops working before it expires.
//! 3) `issue_refresh_code` stores a single-use grant under the hash of a random code;
//!    `refresh_token` takes it atomically and issues a new token.
//! 4) `logout` removes the session record only if it still belongs to the token.
//! 5) `list`, `revoke` and `clear` manage the records directly: a revoked user's token
//!    and refresh codes stop working on their next use.

use base64::Engine;
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::{AuthError, Claims, ClaimsCodec};
use crate::settings::Settings;
use crate::store::{SessionStore, StoreError};

/// A signed token together with the claims it carries.
#[derive(Clone, Debug)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
}

#[derive(Serialize, Deserialize)]
struct RefreshGrant {
    sub: String,
    jti: String,
}

pub struct Sessions {
    store: Arc<dyn SessionStore>,
    codec: Arc<dyn ClaimsCodec>,
    namespace: String,
    refresh_code_ttl: Duration,
}

impl Sessions {
    pub fn new(
        store: Arc<dyn SessionStore>,
        codec: Arc<dyn ClaimsCodec>,
        namespace: &str,
        refresh_code_ttl: Duration,
    ) -> Self {
        Self {
            store,
            codec,
            namespace: namespace.to_string(),
            refresh_code_ttl,
        }
    }

    fn session_prefix(&self) -> String {
        format!("{}:session:", self.namespace)
    }

    fn session_key(&self, sub: &str) -> String {
        format!("{}{sub}", self.session_prefix())
    }

    fn refresh_key(&self, code: &str) -> String {
        format!("{}:refresh:{:x}", self.namespace, Sha256::digest(code.as_bytes()))
    }

    /// Sign a new token for `sub` and make it the user's only session.
    ///
    /// # Errors
    /// Returns `Signing` or `TransientStore`.
    #[instrument(skip(self, settings))]
    pub async fn issue(&self, settings: &Settings, sub: &str) -> Result<IssuedToken, AuthError> {
        let claims = Claims::new(&self.namespace, sub, settings.session_ttl);
        let token = self.codec.sign(&claims)?;
        self.store
            .put(&self.session_key(sub), &claims.jti, settings.session_ttl)
            .await?;
        Ok(IssuedToken { token, claims })
    }

    /// # Errors
    /// Returns `Unauthenticated` if the token is invalid, expired or revoked.
    #[instrument(skip_all)]
    pub async fn verify(&self, settings: &Settings, token: &str) -> Result<Claims, AuthError> {
        let claims = self.codec.verify(token)?;
        let key = self.session_key(&claims.sub);
        match self.store.get(&key).await? {
            Some(jti) if jti == claims.jti => {
                self.store.touch(&key, settings.session_ttl).await?;
                Ok(claims)
            }
            _ => {
                debug!(sub = %claims.sub, "token has no live session");
                Err(AuthError::Unauthenticated)
            }
        }
    }

    /// Create a short-lived, single-use code that can be exchanged for a new token.
    ///
    /// Only the code's hash is stored.
    ///
    /// # Errors
    /// Returns `Signing` if no random code can be generated, or `TransientStore`.
    #[instrument(skip_all, fields(sub = %claims.sub))]
    pub async fn issue_refresh_code(&self, claims: &Claims) -> Result<String, AuthError> {
        let code = generate_code()?;
        let grant = RefreshGrant {
            sub: claims.sub.clone(),
            jti: claims.jti.clone(),
        };
        let grant = serde_json::to_string(&grant)
            .map_err(|err| AuthError::Signing(err.to_string()))?;
        self.store
            .put(&self.refresh_key(&code), &grant, self.refresh_code_ttl)
            .await?;
        Ok(code)
    }

    /// Exchange a refresh code for a new token. A code works at most once.
    ///
    /// # Errors
    /// Returns `InvalidRefreshCode` if the code is unknown, expired, already used or
    /// belongs to a session that has ended.
    #[instrument(skip_all)]
    pub async fn refresh_token(
        &self,
        settings: &Settings,
        code: &str,
    ) -> Result<IssuedToken, AuthError> {
        let Some(grant) = self.store.take(&self.refresh_key(code.trim())).await? else {
            return Err(AuthError::InvalidRefreshCode);
        };
        let grant: RefreshGrant = serde_json::from_str(&grant)
            .map_err(|err| StoreError::Decode(err.to_string()))?;

        let current = self.store.get(&self.session_key(&grant.sub)).await?;
        if current.as_deref() != Some(grant.jti.as_str()) {
            debug!(sub = %grant.sub, "refresh code outlived its session");
            return Err(AuthError::InvalidRefreshCode);
        }
        self.issue(settings, &grant.sub).await
    }

    /// Revoke the session behind `claims`.
    ///
    /// # Errors
    /// Returns `TransientStore` if the store is unreachable.
    #[instrument(skip_all, fields(sub = %claims.sub))]
    pub async fn logout(&self, claims: &Claims) -> Result<(), AuthError> {
        let removed = self
            .store
            .delete_if(&self.session_key(&claims.sub), &claims.jti)
            .await?;
        if !removed {
            debug!("session already ended");
        }
        Ok(())
    }

    /// Users that currently hold a session.
    ///
    /// # Errors
    /// Returns `TransientStore` if the store is unreachable.
    #[instrument(skip_all)]
    pub async fn list(&self) -> Result<Vec<String>, AuthError> {
        let prefix = self.session_prefix();
        Ok(self
            .store
            .keys(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    /// End whatever session `sub` currently has. Returns `false` if there was none.
    ///
    /// # Errors
    /// Returns `TransientStore` if the store is unreachable.
    #[instrument(skip(self))]
    pub async fn revoke(&self, sub: &str) -> Result<bool, AuthError> {
        let key = self.session_key(sub);
        let Some(jti) = self.store.get(&key).await? else {
            return Ok(false);
        };
        Ok(self.store.delete_if(&key, &jti).await?)
    }

    /// End every session in the namespace. Returns how many were live.
    ///
    /// # Errors
    /// Returns `TransientStore` if the store is unreachable.
    #[instrument(skip_all)]
    pub async fn clear(&self) -> Result<u64, AuthError> {
        let removed = self.store.delete_prefix(&self.session_prefix()).await?;
        info!(removed, "all sessions revoked");
        Ok(removed)
    }
}

/// 32 random bytes, URL-safe base64 without padding.
fn generate_code() -> Result<String, AuthError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| AuthError::Signing(err.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtCodec;
    use crate::store::MemoryStore;
    use secrecy::SecretString;

    fn sessions() -> (Arc<MemoryStore>, Sessions) {
        let store = Arc::new(MemoryStore::new());
        let codec = Arc::new(JwtCodec::new(&SecretString::from("test-key".to_string()), "lab"));
        let sessions = Sessions::new(store.clone(), codec, "lab", Duration::from_secs(60));
        (store, sessions)
    }

    async fn issue(sessions: &Sessions, settings: &Settings, sub: &str) -> IssuedToken {
        match sessions.issue(settings, sub).await {
            Ok(issued) => issued,
            Err(err) => panic!("issue failed: {err}"),
        }
    }

    #[tokio::test]
    async fn issued_token_verifies() {
        let (_, sessions) = sessions();
        let settings = Settings::default();
        let issued = issue(&sessions, &settings, "u1").await;
        let claims = sessions.verify(&settings, &issued.token).await;
        assert_eq!(claims.ok(), Some(issued.claims));
    }

    #[tokio::test]
    async fn logout_revokes_a_valid_token() {
        let (_, sessions) = sessions();
        let settings = Settings::default();
        let issued = issue(&sessions, &settings, "u1").await;
        assert!(sessions.logout(&issued.claims).await.is_ok());
        assert!(matches!(
            sessions.verify(&settings, &issued.token).await,
            Err(AuthError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn new_login_replaces_previous_session() {
        let (_, sessions) = sessions();
        let settings = Settings::default();
        let first = issue(&sessions, &settings, "u1").await;
        let second = issue(&sessions, &settings, "u1").await;
        assert!(sessions.verify(&settings, &first.token).await.is_err());
        assert!(sessions.verify(&settings, &second.token).await.is_ok());

        // Logging out the stale token leaves the current session alone.
        assert!(sessions.logout(&first.claims).await.is_ok());
        assert!(sessions.verify(&settings, &second.token).await.is_ok());
    }

    #[tokio::test]
    async fn refresh_code_is_single_use() {
        let (_, sessions) = sessions();
        let settings = Settings::default();
        let issued = issue(&sessions, &settings, "u1").await;
        let code = sessions
            .issue_refresh_code(&issued.claims)
            .await
            .unwrap_or_default();
        assert!(!code.is_empty());

        let renewed = sessions.refresh_token(&settings, &code).await;
        assert!(renewed.is_ok());
        assert!(matches!(
            sessions.refresh_token(&settings, &code).await,
            Err(AuthError::InvalidRefreshCode)
        ));

        if let Ok(renewed) = renewed {
            assert_eq!(renewed.claims.sub, "u1");
            assert!(sessions.verify(&settings, &renewed.token).await.is_ok());
            assert!(sessions.verify(&settings, &issued.token).await.is_err());
        }
    }

    #[tokio::test]
    async fn concurrent_refresh_issues_one_token() {
        let (_, sessions) = sessions();
        let sessions = Arc::new(sessions);
        let settings = Arc::new(Settings::default());
        let issued = issue(&sessions, &settings, "u1").await;
        let code = sessions
            .issue_refresh_code(&issued.claims)
            .await
            .unwrap_or_default();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let sessions = sessions.clone();
            let settings = settings.clone();
            let code = code.clone();
            tasks.push(tokio::spawn(async move {
                sessions.refresh_token(&settings, &code).await.is_ok()
            }));
        }
        let mut successes = 0;
        for task in tasks {
            if task.await.is_ok_and(|ok| ok) {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_refresh_code_fails() {
        let (_, sessions) = sessions();
        let settings = Settings::default();
        let issued = issue(&sessions, &settings, "u1").await;
        let code = sessions
            .issue_refresh_code(&issued.claims)
            .await
            .unwrap_or_default();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(
            sessions.refresh_token(&settings, &code).await,
            Err(AuthError::InvalidRefreshCode)
        ));
    }

    #[tokio::test]
    async fn refresh_code_dies_with_its_session() {
        let (_, sessions) = sessions();
        let settings = Settings::default();
        let issued = issue(&sessions, &settings, "u1").await;
        let code = sessions
            .issue_refresh_code(&issued.claims)
            .await
            .unwrap_or_default();
        assert!(sessions.logout(&issued.claims).await.is_ok());
        assert!(matches!(
            sessions.refresh_token(&settings, &code).await,
            Err(AuthError::InvalidRefreshCode)
        ));
    }

    #[tokio::test]
    async fn unknown_code_fails() {
        let (_, sessions) = sessions();
        let settings = Settings::default();
        assert!(matches!(
            sessions.refresh_token(&settings, "nope").await,
            Err(AuthError::InvalidRefreshCode)
        ));
    }

    #[tokio::test]
    async fn revoke_ends_current_session_and_its_codes() {
        let (_, sessions) = sessions();
        let settings = Settings::default();
        let issued = issue(&sessions, &settings, "u1").await;
        let code = sessions
            .issue_refresh_code(&issued.claims)
            .await
            .unwrap_or_default();
        assert_eq!(sessions.revoke("u1").await.ok(), Some(true));
        assert_eq!(sessions.revoke("u1").await.ok(), Some(false));
        assert!(sessions.verify(&settings, &issued.token).await.is_err());
        assert!(matches!(
            sessions.refresh_token(&settings, &code).await,
            Err(AuthError::InvalidRefreshCode)
        ));
    }

    #[tokio::test]
    async fn list_and_clear_cover_the_namespace_only() {
        let (store, sessions) = sessions();
        let settings = Settings::default();
        let first = issue(&sessions, &settings, "u2").await;
        let second = issue(&sessions, &settings, "u1").await;
        assert!(sessions.issue_refresh_code(&second.claims).await.is_ok());
        assert!(store.put("other:session:u9", "jti", Duration::from_secs(60)).await.is_ok());

        assert_eq!(
            sessions.list().await.ok(),
            Some(vec!["u1".to_string(), "u2".to_string()])
        );
        assert_eq!(sessions.clear().await.ok(), Some(2));
        assert_eq!(sessions.list().await.ok(), Some(Vec::new()));
        assert!(sessions.verify(&settings, &first.token).await.is_err());
        assert!(sessions.verify(&settings, &second.token).await.is_err());
        assert!(store.keys("other:").await.is_ok_and(|keys| keys.len() == 1));
    }

    #[tokio::test]
    async fn verify_fails_closed_on_store_outage() {
        let (store, sessions) = sessions();
        let settings = Settings::default();
        let issued = issue(&sessions, &settings, "u1").await;
        store.set_unavailable(true);
        assert!(matches!(
            sessions.verify(&settings, &issued.token).await,
            Err(AuthError::TransientStore(_))
        ));
    }
}
