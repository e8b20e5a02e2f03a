//! Postgres-backed store shared by every `warden` instance.
//!
//! Counters and markers live in `auth_counters`, sessions and refresh codes in
//! `auth_sessions` (see `db/sql/01_warden.sql`). Expiry is evaluated against the
//! database clock with `NOW()`, so instance clock skew does not matter. Expired rows
//! are invisible to every query and are removed by [`PgStore::spawn_purge`].

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span};

use super::{CounterStore, SessionStore, StoreError};

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

fn interval(ttl: Duration) -> String {
    format!("{} milliseconds", ttl.as_millis())
}

fn db_span(operation: &'static str) -> tracing::Span {
    info_span!("db.query", db.system = "postgresql", db.operation = operation)
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete expired rows from both tables.
    ///
    /// # Errors
    /// Returns an error if either delete fails.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let mut removed = 0;
        for query in [
            "DELETE FROM auth_counters WHERE expires_at <= NOW()",
            "DELETE FROM auth_sessions WHERE expires_at <= NOW()",
        ] {
            removed += sqlx::query(query)
                .execute(&self.pool)
                .instrument(db_span("DELETE"))
                .await?
                .rows_affected();
        }
        Ok(removed)
    }

    /// Periodically purge expired rows until `cancel` fires.
    pub fn spawn_purge(&self, every: Duration, cancel: CancellationToken) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => match store.purge_expired().await {
                        Ok(removed) => debug!("purged {removed} expired auth rows"),
                        Err(err) => error!("Failed to purge expired auth rows: {err}"),
                    },
                }
            }
        });
    }
}

#[async_trait]
impl CounterStore for PgStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        // A counter whose window has ended restarts at 1 with a fresh expiry; a live
        // counter keeps the expiry it was created with.
        let query = r"
            INSERT INTO auth_counters (key, value, expires_at)
            VALUES ($1, 1, NOW() + $2::interval)
            ON CONFLICT (key) DO UPDATE SET
                value = CASE WHEN auth_counters.expires_at <= NOW()
                    THEN 1 ELSE auth_counters.value + 1 END,
                expires_at = CASE WHEN auth_counters.expires_at <= NOW()
                    THEN EXCLUDED.expires_at ELSE auth_counters.expires_at END
            RETURNING value
        ";
        let row = sqlx::query(query)
            .bind(key)
            .bind(interval(ttl))
            .fetch_one(&self.pool)
            .instrument(db_span("UPSERT"))
            .await?;
        Ok(row.get("value"))
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let query = "SELECT value FROM auth_counters WHERE key = $1 AND expires_at > NOW()";
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT"))
            .await?;
        Ok(row.map(|row| row.get("value")))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM auth_counters WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .instrument(db_span("DELETE"))
            .await?;
        Ok(())
    }

    async fn set_marker(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO auth_counters (key, value, expires_at)
            VALUES ($1, 1, NOW() + $2::interval)
            ON CONFLICT (key) DO UPDATE SET value = 1, expires_at = EXCLUDED.expires_at
            WHERE auth_counters.expires_at <= NOW()
        ";
        sqlx::query(query)
            .bind(key)
            .bind(interval(ttl))
            .execute(&self.pool)
            .instrument(db_span("UPSERT"))
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let query =
            "SELECT EXISTS (SELECT 1 FROM auth_counters WHERE key = $1 AND expires_at > NOW())";
        let row = sqlx::query(query)
            .bind(key)
            .fetch_one(&self.pool)
            .instrument(db_span("SELECT"))
            .await?;
        Ok(row.get(0))
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO auth_sessions (key, value, expires_at)
            VALUES ($1, $2, NOW() + $3::interval)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
        ";
        sqlx::query(query)
            .bind(key)
            .bind(value)
            .bind(interval(ttl))
            .execute(&self.pool)
            .instrument(db_span("UPSERT"))
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let query = "SELECT value FROM auth_sessions WHERE key = $1 AND expires_at > NOW()";
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT"))
            .await?;
        Ok(row.map(|row| row.get("value")))
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        // DELETE .. RETURNING is atomic: only one caller gets the row back.
        let query =
            "DELETE FROM auth_sessions WHERE key = $1 RETURNING value, expires_at > NOW() AS live";
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(db_span("DELETE"))
            .await?;
        Ok(row.and_then(|row| {
            let live: bool = row.get("live");
            live.then(|| row.get("value"))
        }))
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let query = r"
            UPDATE auth_sessions SET expires_at = NOW() + $2::interval
            WHERE key = $1 AND expires_at > NOW()
        ";
        let result = sqlx::query(query)
            .bind(key)
            .bind(interval(ttl))
            .execute(&self.pool)
            .instrument(db_span("UPDATE"))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_if(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let query =
            "DELETE FROM auth_sessions WHERE key = $1 AND value = $2 AND expires_at > NOW()";
        let result = sqlx::query(query)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .instrument(db_span("DELETE"))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let query = r"
            SELECT key FROM auth_sessions
            WHERE starts_with(key, $1) AND expires_at > NOW()
            ORDER BY key
        ";
        let rows = sqlx::query(query)
            .bind(prefix)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT"))
            .await?;
        Ok(rows.iter().map(|row| row.get("key")).collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let query = r"
            WITH removed AS (
                DELETE FROM auth_sessions WHERE starts_with(key, $1) RETURNING expires_at
            )
            SELECT COUNT(*) FILTER (WHERE expires_at > NOW()) AS live FROM removed
        ";
        let row = sqlx::query(query)
            .bind(prefix)
            .fetch_one(&self.pool)
            .instrument(db_span("DELETE"))
            .await?;
        let live: i64 = row.get("live");
        Ok(u64::try_from(live).unwrap_or_default())
    }
}
