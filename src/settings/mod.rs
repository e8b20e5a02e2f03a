//! Operational policy document and its live, process-wide snapshot.
//!
//! Flow Overview:
//! 1) At startup [`ConfigSync::bootstrap`] fetches the document once; failure aborts startup.
//! 2) [`ConfigSync::run`] watches the store and publishes every decoded revision.
//! 3) Request handlers call [`Snapshot::current`] once and use that `Arc` to the end.
//!
//! The field names and units match the stored JSON document: durations are integer
//! nanoseconds.

mod address;
mod store;
mod sync;

pub use address::AddressList;
pub use store::{ConfigStore, MemoryConfigStore, Revision, RevisionStream};
pub use sync::{ConfigSync, Snapshot};

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

use crate::auth::password::PasswordStrategy;

const DEFAULT_LOGIN_TTL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_LOGIN_FAILURES: i64 = 5;
const DEFAULT_IP_LOGIN_FAILURES: i64 = 10;
const DEFAULT_PWD_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid settings document: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    Invalid(&'static str),
}

/// The policy document. Never mutated after it has been decoded.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Lockout window: failures accumulate and lockouts last this long.
    #[serde(deserialize_with = "nanos")]
    pub login_ttl: Duration,
    /// Failures per account within the window before the account is locked.
    pub login_failures: i64,
    /// Failures per source address within the window before the address is locked.
    pub ip_login_failures: i64,
    /// Addresses exempt from address lockout.
    pub ip_whitelist: AddressList,
    /// Addresses that are always refused. Wins over `ip_whitelist`.
    pub ip_blacklist: AddressList,
    pub pwd_strategy: PasswordStrategy,
    /// Password lifetime; zero means passwords never expire.
    #[serde(deserialize_with = "nanos")]
    pub pwd_ttl: Duration,
    #[serde(deserialize_with = "nanos")]
    pub session_ttl: Duration,
    #[serde(flatten)]
    pub integrations: Integrations,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            login_ttl: DEFAULT_LOGIN_TTL,
            login_failures: DEFAULT_LOGIN_FAILURES,
            ip_login_failures: DEFAULT_IP_LOGIN_FAILURES,
            ip_whitelist: AddressList::default(),
            ip_blacklist: AddressList::default(),
            pwd_strategy: PasswordStrategy::default(),
            pwd_ttl: DEFAULT_PWD_TTL,
            session_ttl: DEFAULT_SESSION_TTL,
            integrations: Integrations::default(),
        }
    }
}

impl Settings {
    /// Decode and validate a stored document.
    ///
    /// # Errors
    /// Returns an error if the payload is not a valid document or a policy value is
    /// out of range.
    pub fn from_slice(payload: &[u8]) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_slice(payload)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.login_ttl.is_zero() {
            return Err(SettingsError::Invalid("login_ttl must be positive"));
        }
        if self.login_failures < 1 {
            return Err(SettingsError::Invalid("login_failures must be at least 1"));
        }
        if self.ip_login_failures < 1 {
            return Err(SettingsError::Invalid("ip_login_failures must be at least 1"));
        }
        if self.session_ttl.is_zero() {
            return Err(SettingsError::Invalid("session_ttl must be positive"));
        }
        Ok(())
    }
}

/// Third-party integration parameters. Carried through untouched; secrets never
/// show up in `Debug` output.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Integrations {
    pub cloud: Option<String>,
    pub tencent_secret_id: Option<String>,
    #[serde(deserialize_with = "secret")]
    pub tencent_secret_key: Option<SecretString>,
    pub tencent_cos_bucket: Option<String>,
    pub tencent_cos_region: Option<String>,
    pub tencent_cos_expired: Option<i64>,
    pub tencent_cos_limit: Option<i64>,
    pub office: Option<String>,
    pub feishu_app_id: Option<String>,
    #[serde(deserialize_with = "secret")]
    pub feishu_app_secret: Option<SecretString>,
    #[serde(deserialize_with = "secret")]
    pub feishu_encrypt_key: Option<SecretString>,
    #[serde(deserialize_with = "secret")]
    pub feishu_verification_token: Option<SecretString>,
    pub redirect_url: Option<String>,
    pub email_host: Option<String>,
    pub email_port: Option<String>,
    pub email_username: Option<String>,
    #[serde(deserialize_with = "secret")]
    pub email_password: Option<SecretString>,
    pub openapi_url: Option<String>,
    pub openapi_key: Option<String>,
    #[serde(deserialize_with = "secret")]
    pub openapi_secret: Option<SecretString>,
}

fn nanos<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_nanos)
}

fn secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|value| !value.is_empty())
        .map(SecretString::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serde_json::json;

    const MINUTE_NANOS: u64 = 60 * 1_000_000_000;

    #[test]
    fn empty_document_uses_defaults() {
        let settings = Settings::from_slice(b"{}");
        assert!(settings.is_ok());
        if let Ok(settings) = settings {
            assert_eq!(settings.login_ttl, DEFAULT_LOGIN_TTL);
            assert_eq!(settings.login_failures, 5);
            assert_eq!(settings.ip_login_failures, 10);
            assert!(settings.ip_whitelist.is_empty());
            assert_eq!(settings.pwd_strategy, PasswordStrategy::MixedCase);
        }
    }

    #[test]
    fn decodes_stored_document() {
        let payload = json!({
            "login_ttl": 15 * MINUTE_NANOS,
            "login_failures": 3,
            "ip_login_failures": 20,
            "ip_whitelist": ["127.0.0.1"],
            "ip_blacklist": null,
            "pwd_strategy": 3,
            "pwd_ttl": 0,
            "cloud": "tencent",
            "tencent_secret_key": "s3cr3t",
            "unrelated_field": true
        });
        let settings = Settings::from_slice(payload.to_string().as_bytes());
        assert!(settings.is_ok());
        if let Ok(settings) = settings {
            assert_eq!(settings.login_ttl, Duration::from_secs(15 * 60));
            assert_eq!(settings.login_failures, 3);
            assert_eq!(settings.ip_login_failures, 20);
            assert!(settings.ip_whitelist.contains("127.0.0.1"));
            assert!(settings.ip_blacklist.is_empty());
            assert_eq!(settings.pwd_strategy, PasswordStrategy::Full);
            assert!(settings.pwd_ttl.is_zero());
            assert_eq!(settings.integrations.cloud.as_deref(), Some("tencent"));
            assert_eq!(
                settings
                    .integrations
                    .tencent_secret_key
                    .as_ref()
                    .map(|secret| secret.expose_secret().to_string()),
                Some("s3cr3t".to_string())
            );
        }
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let payload = json!({ "email_password": "hunter2" });
        let settings = Settings::from_slice(payload.to_string().as_bytes());
        assert!(settings.is_ok());
        if let Ok(settings) = settings {
            assert!(!format!("{settings:?}").contains("hunter2"));
        }
    }

    #[test]
    fn rejects_out_of_range_policy() {
        for payload in [
            json!({ "login_ttl": 0 }),
            json!({ "login_failures": 0 }),
            json!({ "ip_login_failures": -1 }),
            json!({ "pwd_strategy": 7 }),
            json!({ "login_ttl": "15m" }),
        ] {
            assert!(
                Settings::from_slice(payload.to_string().as_bytes()).is_err(),
                "accepted {payload}"
            );
        }
    }
}
