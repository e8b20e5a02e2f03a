//! Login and password change.
//!
//! Flow Overview:
//! 1) Capture the policy snapshot once; every step below uses the same document.
//! 2) Lockout pre-check (deny-list, account marker, address marker).
//! 3) Verify the password, then record the outcome with the lockout engine.
//! 4) Login refuses expired passwords, otherwise issues a session token. A password
//!    change stores the new hash and ends the user's session.
//!
//! Both password changes verify the current password through steps 2 and 3, so they
//! count toward the same account lockout as logins. One audit event is emitted per
//! attempt, whatever the outcome.

use std::time::SystemTime;
use tokio::time::Instant;
use tracing::{info, instrument};

use super::{
    Attempt, AuditAction, AuditEvent, AuthError, AuthState, Claims, IssuedToken,
    credentials::{Account, normalize_email, valid_email},
    password,
};
use crate::settings::Settings;

impl AuthState {
    /// Authenticate `email`/`password` from `address` and start a session.
    ///
    /// # Errors
    /// Returns the lockout errors, `InvalidCredentials`, `PasswordExpired` or
    /// `TransientStore`.
    #[instrument(skip(self, password))]
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        address: &str,
    ) -> Result<IssuedToken, AuthError> {
        let started = Instant::now();
        let settings = self.settings();
        let account = normalize_email(email);

        let result = self.attempt(&settings, &account, password, address).await;

        self.audit_attempt(
            AuditAction::Login,
            result.as_ref().map(|issued| issued.claims.sub.clone()),
            address,
            started,
        );
        result
    }

    async fn attempt(
        &self,
        settings: &Settings,
        account: &str,
        password: &str,
        address: &str,
    ) -> Result<IssuedToken, AuthError> {
        if !valid_email(account) || password.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }

        let verified = self
            .check_password(settings, account, password, address)
            .await?;

        if password::expired(verified.password_changed_at, settings.pwd_ttl, SystemTime::now()) {
            return Err(AuthError::PasswordExpired);
        }

        let issued = self.sessions.issue(settings, &verified.id).await?;
        info!(sub = %issued.claims.sub, "login succeeded");
        Ok(issued)
    }

    /// Change the caller's password. The new password must satisfy the current
    /// strength tier. Ends the caller's session on success.
    ///
    /// # Errors
    /// Returns `WeakPassword`, the lockout errors, `InvalidCredentials` if `current`
    /// is wrong, `Unauthenticated` if the user is gone, or `TransientStore`.
    #[instrument(skip_all, fields(sub = %claims.sub))]
    pub async fn change_password(
        &self,
        claims: &Claims,
        current: &str,
        new: &str,
        address: &str,
    ) -> Result<(), AuthError> {
        let started = Instant::now();
        let settings = self.settings();

        let result = match self.credentials.email(&claims.sub).await {
            Ok(Some(account)) => {
                self.rotate_password(&settings, &account, current, new, address)
                    .await
            }
            Ok(None) => Err(AuthError::Unauthenticated),
            Err(err) => Err(err.into()),
        };

        self.audit_attempt(
            AuditAction::PasswordChange,
            result.as_ref().cloned(),
            address,
            started,
        );
        result.map(|_| ())
    }

    /// Change a password without a session, proving identity with the current
    /// password. This is the way out for a user whose password has expired.
    ///
    /// # Errors
    /// Same as [`AuthState::change_password`], except an unknown email is
    /// `InvalidCredentials`.
    #[instrument(skip(self, current, new))]
    pub async fn change_expired_password(
        &self,
        email: &str,
        current: &str,
        new: &str,
        address: &str,
    ) -> Result<(), AuthError> {
        let started = Instant::now();
        let settings = self.settings();
        let account = normalize_email(email);

        let result = if !valid_email(&account) || current.is_empty() {
            Err(AuthError::InvalidCredentials)
        } else {
            self.rotate_password(&settings, &account, current, new, address)
                .await
        };

        self.audit_attempt(
            AuditAction::PasswordChange,
            result.as_ref().cloned(),
            address,
            started,
        );
        result.map(|_| ())
    }

    async fn rotate_password(
        &self,
        settings: &Settings,
        account: &str,
        current: &str,
        new: &str,
        address: &str,
    ) -> Result<String, AuthError> {
        if new == current || !settings.pwd_strategy.check(new) {
            return Err(AuthError::WeakPassword);
        }

        let verified = self
            .check_password(settings, account, current, address)
            .await?;

        if !self.credentials.set_password(&verified.id, new).await? {
            return Err(AuthError::InvalidCredentials);
        }
        self.sessions.revoke(&verified.id).await?;
        info!(sub = %verified.id, "password changed");
        Ok(verified.id)
    }

    /// Lockout pre-check, password verification and lockout bookkeeping.
    async fn check_password(
        &self,
        settings: &Settings,
        account: &str,
        password: &str,
        address: &str,
    ) -> Result<Account, AuthError> {
        self.lockout
            .check_and_record(settings, account, address, Attempt::Pending)
            .await?;

        let Some(verified) = self.credentials.verify(account, password).await? else {
            self.lockout
                .check_and_record(settings, account, address, Attempt::Failed)
                .await?;
            return Err(AuthError::InvalidCredentials);
        };

        self.lockout
            .check_and_record(settings, account, address, Attempt::Succeeded)
            .await?;
        Ok(verified)
    }

    fn audit_attempt(
        &self,
        action: AuditAction,
        result: Result<String, &AuthError>,
        address: &str,
        started: Instant,
    ) {
        let (outcome, identity) = match result {
            Ok(identity) => ("ok", Some(identity)),
            Err(err) => (err.kind(), None),
        };
        self.audit().emit(AuditEvent {
            action,
            outcome,
            identity,
            address: address.to_string(),
            elapsed: started.elapsed(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthBackends, AuthConfig, JwtCodec, MemoryCredentials};
    use crate::settings::Snapshot;
    use crate::store::MemoryStore;
    use secrecy::SecretString;
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    const PASSWORD: &str = "Correct1!";

    async fn state(settings: Settings, changed_at: SystemTime) -> (Arc<MemoryStore>, AuthState) {
        let store = Arc::new(MemoryStore::new());
        let credentials = Arc::new(MemoryCredentials::new());
        let added = credentials
            .add_user("u1", "a1@example.com", PASSWORD, changed_at)
            .await;
        assert!(added.is_ok());
        let state = AuthState::new(
            AuthConfig::new("lab".to_string()),
            Snapshot::fixed(settings),
            AuthBackends {
                counters: store.clone(),
                sessions: store.clone(),
                codec: Arc::new(JwtCodec::new(
                    &SecretString::from("test-key".to_string()),
                    "lab",
                )),
                credentials,
            },
        );
        (store, state)
    }

    #[tokio::test]
    async fn correct_password_issues_session() {
        let (_, state) = state(Settings::default(), SystemTime::now()).await;
        let issued = state.login("A1@example.com", PASSWORD, "10.0.0.1").await;
        assert!(issued.is_ok_and(|issued| issued.claims.sub == "u1"));
    }

    #[tokio::test]
    async fn lockout_blocks_correct_password() {
        let (_, state) = state(Settings::default(), SystemTime::now()).await;
        for _ in 0..5 {
            assert!(matches!(
                state.login("a1@example.com", "wrong", "10.0.0.1").await,
                Err(AuthError::InvalidCredentials)
            ));
        }
        assert!(matches!(
            state.login("a1@example.com", PASSWORD, "10.0.0.1").await,
            Err(AuthError::AccountLocked)
        ));
    }

    #[tokio::test]
    async fn deny_listed_address_is_blocked() {
        let settings = Settings {
            ip_blacklist: ["10.0.0.9"].into_iter().collect(),
            ip_whitelist: ["10.0.0.9"].into_iter().collect(),
            ..Settings::default()
        };
        let (_, state) = state(settings, SystemTime::now()).await;
        assert!(matches!(
            state.login("a1@example.com", PASSWORD, "10.0.0.9").await,
            Err(AuthError::AddressBlocked)
        ));
    }

    #[tokio::test]
    async fn expired_password_is_refused() {
        let settings = Settings {
            pwd_ttl: Duration::from_secs(24 * 60 * 60),
            ..Settings::default()
        };
        let (_, state) = state(settings, UNIX_EPOCH).await;
        assert!(matches!(
            state.login("a1@example.com", PASSWORD, "10.0.0.1").await,
            Err(AuthError::PasswordExpired)
        ));
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        let (store, state) = state(Settings::default(), SystemTime::now()).await;
        store.set_unavailable(true);
        assert!(matches!(
            state.login("a1@example.com", PASSWORD, "10.0.0.1").await,
            Err(AuthError::TransientStore(_))
        ));
    }

    #[tokio::test]
    async fn change_password_enforces_strength_and_ends_session() {
        let (_, state) = state(Settings::default(), SystemTime::now()).await;
        let Ok(issued) = state.login("a1@example.com", PASSWORD, "10.0.0.1").await else {
            panic!("login failed");
        };
        assert!(matches!(
            state
                .change_password(&issued.claims, PASSWORD, "short", "10.0.0.1")
                .await,
            Err(AuthError::WeakPassword)
        ));
        assert!(matches!(
            state
                .change_password(&issued.claims, PASSWORD, PASSWORD, "10.0.0.1")
                .await,
            Err(AuthError::WeakPassword)
        ));
        assert!(matches!(
            state
                .change_password(&issued.claims, "wrong", "Better2Password", "10.0.0.1")
                .await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(
            state
                .change_password(&issued.claims, PASSWORD, "Better2Password", "10.0.0.1")
                .await
                .is_ok()
        );

        let settings = state.settings();
        assert!(
            state
                .sessions()
                .verify(&settings, &issued.token)
                .await
                .is_err()
        );
        assert!(
            state
                .login("a1@example.com", "Better2Password", "10.0.0.1")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn wrong_current_password_counts_toward_lockout() {
        let (_, state) = state(Settings::default(), SystemTime::now()).await;
        let Ok(issued) = state.login("a1@example.com", PASSWORD, "10.0.0.1").await else {
            panic!("login failed");
        };
        for _ in 0..5 {
            assert!(matches!(
                state
                    .change_password(&issued.claims, "guess", "Better2Password", "10.0.0.2")
                    .await,
                Err(AuthError::InvalidCredentials)
            ));
        }
        // Locked now, even with the right current password.
        assert!(matches!(
            state
                .change_password(&issued.claims, PASSWORD, "Better2Password", "10.0.0.2")
                .await,
            Err(AuthError::AccountLocked)
        ));
        assert!(matches!(
            state.login("a1@example.com", PASSWORD, "10.0.0.3").await,
            Err(AuthError::AccountLocked)
        ));
    }

    #[tokio::test]
    async fn expired_password_can_be_replaced_without_a_session() {
        let settings = Settings {
            pwd_ttl: Duration::from_secs(24 * 60 * 60),
            ..Settings::default()
        };
        let (_, state) = state(settings, UNIX_EPOCH).await;
        assert!(matches!(
            state.login("a1@example.com", PASSWORD, "10.0.0.1").await,
            Err(AuthError::PasswordExpired)
        ));

        assert!(matches!(
            state
                .change_expired_password("a1@example.com", "wrong", "Better2Password", "10.0.0.1")
                .await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            state
                .change_expired_password("nobody@example.com", PASSWORD, "Better2Password", "10.0.0.1")
                .await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(
            state
                .change_expired_password("A1@example.com", PASSWORD, "Better2Password", "10.0.0.1")
                .await
                .is_ok()
        );
        let issued = state
            .login("a1@example.com", "Better2Password", "10.0.0.1")
            .await;
        assert!(issued.is_ok_and(|issued| issued.claims.sub == "u1"));
    }

    #[tokio::test]
    async fn expired_password_change_respects_deny_list() {
        let settings = Settings {
            ip_blacklist: ["10.0.0.9"].into_iter().collect(),
            ..Settings::default()
        };
        let (_, state) = state(settings, SystemTime::now()).await;
        assert!(matches!(
            state
                .change_expired_password("a1@example.com", PASSWORD, "Better2Password", "10.0.0.9")
                .await,
            Err(AuthError::AddressBlocked)
        ));
    }
}
