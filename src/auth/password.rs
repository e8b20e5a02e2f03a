//! Password strength tiers and expiry.

use serde::Deserialize;
use std::time::{Duration, SystemTime};

const MIN_LENGTH: usize = 8;

/// Strength tier stored as `pwd_strategy` in the settings document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum PasswordStrategy {
    /// Any non-empty password.
    Unrestricted,
    /// Upper and lower case letters.
    #[default]
    MixedCase,
    /// Letters in both cases plus digits.
    MixedCaseDigits,
    /// Letters in both cases, digits and special characters.
    Full,
}

impl TryFrom<u8> for PasswordStrategy {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unrestricted),
            1 => Ok(Self::MixedCase),
            2 => Ok(Self::MixedCaseDigits),
            3 => Ok(Self::Full),
            other => Err(format!("unknown password strategy {other}")),
        }
    }
}

impl PasswordStrategy {
    /// Whether `password` satisfies this tier.
    #[must_use]
    pub fn check(self, password: &str) -> bool {
        if password.is_empty() {
            return false;
        }
        if self == Self::Unrestricted {
            return true;
        }
        if password.chars().count() < MIN_LENGTH {
            return false;
        }

        let lower = password.chars().any(char::is_lowercase);
        let upper = password.chars().any(char::is_uppercase);
        let digit = password.chars().any(|c| c.is_ascii_digit());
        let special = password
            .chars()
            .any(|c| !c.is_alphanumeric() && !c.is_whitespace());

        match self {
            Self::Unrestricted => true,
            Self::MixedCase => lower && upper,
            Self::MixedCaseDigits => lower && upper && digit,
            Self::Full => lower && upper && digit && special,
        }
    }
}

/// A password last changed at `changed_at` is expired once `ttl` has passed.
/// A zero `ttl` disables expiry.
#[must_use]
pub fn expired(changed_at: SystemTime, ttl: Duration, now: SystemTime) -> bool {
    if ttl.is_zero() {
        return false;
    }
    now.duration_since(changed_at)
        .is_ok_and(|age| age >= ttl)
}
