//! Password verification against the user table.
//!
//! Hashes are Argon2id PHC strings. Hashing and verification run on the blocking pool.

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use async_trait::async_trait;
use rand::rngs::OsRng;
use regex::Regex;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{Instrument, info_span};
use uuid::Uuid;

use crate::store::StoreError;

/// An active user whose password matched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub password_changed_at: SystemTime,
}

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Returns `None` for an unknown email, a disabled user or a wrong password.
    async fn verify(&self, email: &str, password: &str) -> Result<Option<Account>, StoreError>;

    /// Login email of an active user, or `None`.
    async fn email(&self, user_id: &str) -> Result<Option<String>, StoreError>;

    /// Store a new password for `user_id` and reset its change time. Returns `false`
    /// if the user no longer exists.
    async fn set_password(&self, user_id: &str, new: &str) -> Result<bool, StoreError>;
}

/// Normalize an email for lookups.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Lightweight email sanity check done before any store is touched.
#[must_use]
pub fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(email.trim()))
}

/// Hash a password into an Argon2id PHC string.
///
/// # Errors
/// Returns an error if hashing fails.
pub async fn hash_password(password: &str) -> Result<String, StoreError> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| StoreError::Decode(format!("failed to hash password: {err}")))
    })
    .await
    .map_err(|err| StoreError::Decode(format!("password hashing task failed: {err}")))?
}

async fn password_matches(password: &str, stored_hash: &str) -> Result<bool, StoreError> {
    let password = password.to_string();
    let stored_hash = stored_hash.to_string();
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&stored_hash)
            .map_err(|err| StoreError::Decode(format!("invalid password hash: {err}")))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(|err| StoreError::Decode(format!("password verification task failed: {err}")))?
}

fn from_epoch(seconds: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::try_from(seconds).unwrap_or_default())
}

#[derive(Clone, Debug)]
pub struct PgCredentials {
    pool: PgPool,
}

impl PgCredentials {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialVerifier for PgCredentials {
    async fn verify(&self, email: &str, password: &str) -> Result<Option<Account>, StoreError> {
        let query = r"
            SELECT id::text AS id, password_hash,
                EXTRACT(EPOCH FROM password_updated_at)::BIGINT AS changed_at
            FROM users
            WHERE email = $1 AND status = 'active'
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "users"
        );
        let row = sqlx::query(query)
            .bind(normalize_email(email))
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let stored_hash: String = row.get("password_hash");
        if !password_matches(password, &stored_hash).await? {
            return Ok(None);
        }
        Ok(Some(Account {
            id: row.get("id"),
            password_changed_at: from_epoch(row.get("changed_at")),
        }))
    }

    async fn email(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let Ok(user_id) = Uuid::parse_str(user_id) else {
            return Ok(None);
        };
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "users"
        );
        let row = sqlx::query("SELECT email FROM users WHERE id = $1 AND status = 'active'")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        Ok(row.map(|row| row.get("email")))
    }

    async fn set_password(&self, user_id: &str, new: &str) -> Result<bool, StoreError> {
        let Ok(user_id) = Uuid::parse_str(user_id) else {
            return Ok(false);
        };
        let new_hash = hash_password(new).await?;
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.sql.table = "users"
        );
        let query = r"
            UPDATE users
            SET password_hash = $2, password_updated_at = NOW()
            WHERE id = $1
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(new_hash)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone, Debug)]
struct MemoryUser {
    id: String,
    password_hash: String,
    active: bool,
    password_changed_at: SystemTime,
}

/// In-process user table for local development and tests.
#[derive(Debug, Default)]
pub struct MemoryCredentials {
    users: RwLock<HashMap<String, MemoryUser>>,
}

impl MemoryCredentials {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an active user.
    ///
    /// # Errors
    /// Returns an error if the password cannot be hashed.
    pub async fn add_user(
        &self,
        id: &str,
        email: &str,
        password: &str,
        password_changed_at: SystemTime,
    ) -> Result<(), StoreError> {
        let password_hash = hash_password(password).await?;
        self.users.write().await.insert(
            normalize_email(email),
            MemoryUser {
                id: id.to_string(),
                password_hash,
                active: true,
                password_changed_at,
            },
        );
        Ok(())
    }

    pub async fn set_active(&self, email: &str, active: bool) {
        if let Some(user) = self.users.write().await.get_mut(&normalize_email(email)) {
            user.active = active;
        }
    }
}

#[async_trait]
impl CredentialVerifier for MemoryCredentials {
    async fn verify(&self, email: &str, password: &str) -> Result<Option<Account>, StoreError> {
        let user = self.users.read().await.get(&normalize_email(email)).cloned();
        let Some(user) = user.filter(|user| user.active) else {
            return Ok(None);
        };
        if !password_matches(password, &user.password_hash).await? {
            return Ok(None);
        }
        Ok(Some(Account {
            id: user.id,
            password_changed_at: user.password_changed_at,
        }))
    }

    async fn email(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .users
            .read()
            .await
            .iter()
            .find(|(_, user)| user.id == user_id && user.active)
            .map(|(email, _)| email.clone()))
    }

    async fn set_password(&self, user_id: &str, new: &str) -> Result<bool, StoreError> {
        let new_hash = hash_password(new).await?;
        let mut users = self.users.write().await;
        let Some(user) = users.values_mut().find(|user| user.id == user_id) else {
            return Ok(false);
        };
        user.password_hash = new_hash;
        user.password_changed_at = SystemTime::now();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email(" Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn valid_email_is_a_sanity_check() {
        assert!(valid_email("ops@example.com"));
        assert!(valid_email(" Ops.Team@example.co.uk "));
        assert!(!valid_email("ops@example"));
        assert!(!valid_email("ops example@example.com"));
        assert!(!valid_email(""));
    }

    #[tokio::test]
    async fn verifies_hashed_passwords() {
        let credentials = MemoryCredentials::new();
        let added = credentials
            .add_user("u1", "alice@example.com", "Correct1!", SystemTime::now())
            .await;
        assert!(added.is_ok());

        let account = credentials.verify("ALICE@example.com ", "Correct1!").await;
        assert!(matches!(account, Ok(Some(Account { ref id, .. })) if id == "u1"));
        assert!(matches!(
            credentials.verify("alice@example.com", "wrong").await,
            Ok(None)
        ));
        assert!(matches!(
            credentials.verify("bob@example.com", "Correct1!").await,
            Ok(None)
        ));
    }

    #[tokio::test]
    async fn disabled_users_fail_like_wrong_passwords() {
        let credentials = MemoryCredentials::new();
        let added = credentials
            .add_user("u1", "alice@example.com", "Correct1!", SystemTime::now())
            .await;
        assert!(added.is_ok());
        credentials.set_active("alice@example.com", false).await;
        assert!(matches!(
            credentials.verify("alice@example.com", "Correct1!").await,
            Ok(None)
        ));
    }

    #[tokio::test]
    async fn set_password_replaces_hash_and_change_time() {
        let credentials = MemoryCredentials::new();
        let added = credentials
            .add_user("u1", "alice@example.com", "Correct1!", UNIX_EPOCH)
            .await;
        assert!(added.is_ok());
        assert_eq!(
            credentials.email("u1").await.ok(),
            Some(Some("alice@example.com".to_string()))
        );

        assert_eq!(credentials.set_password("u1", "Next2@xyz").await.ok(), Some(true));
        assert_eq!(credentials.set_password("u2", "Next2@xyz").await.ok(), Some(false));
        assert!(matches!(
            credentials.verify("alice@example.com", "Correct1!").await,
            Ok(None)
        ));
        let account = credentials.verify("alice@example.com", "Next2@xyz").await;
        assert!(matches!(account, Ok(Some(account)) if account.password_changed_at > UNIX_EPOCH));
    }

    #[tokio::test]
    async fn disabled_users_have_no_email() {
        let credentials = MemoryCredentials::new();
        let added = credentials
            .add_user("u1", "alice@example.com", "Correct1!", SystemTime::now())
            .await;
        assert!(added.is_ok());
        credentials.set_active("alice@example.com", false).await;
        assert_eq!(credentials.email("u1").await.ok(), Some(None));
        assert_eq!(credentials.email("nobody").await.ok(), Some(None));
    }

    #[test]
    fn negative_epoch_clamps_to_zero() {
        assert_eq!(from_epoch(-5), UNIX_EPOCH);
        assert_eq!(from_epoch(60), UNIX_EPOCH + Duration::from_secs(60));
    }
}
