//! Session token claims and the signing codec.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use utoipa::ToSchema;

use super::AuthError;

/// Decoded, verified contents of a session token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Token id; matches the user's server-side session while the token is current.
    pub jti: String,
    pub iss: String,
    pub iat: u64,
    pub exp: u64,
}

impl Claims {
    /// Fresh claims for `sub`, valid for `ttl` from now.
    #[must_use]
    pub fn new(issuer: &str, sub: &str, ttl: Duration) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        Self {
            sub: sub.to_string(),
            jti: ulid::Ulid::new().to_string(),
            iss: issuer.to_string(),
            iat: now,
            exp: now.saturating_add(ttl.as_secs()),
        }
    }
}

/// Signs and verifies session tokens.
pub trait ClaimsCodec: Send + Sync {
    /// # Errors
    /// Returns `Signing` if the token cannot be produced.
    fn sign(&self, claims: &Claims) -> Result<String, AuthError>;

    /// # Errors
    /// Returns `Unauthenticated` for a bad signature, issuer or expiry.
    fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// HS256 JWT codec keyed by a shared secret.
pub struct JwtCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtCodec {
    #[must_use]
    pub fn new(key: &SecretString, issuer: &str) -> Self {
        let secret = key.expose_secret().as_bytes();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl ClaimsCodec for JwtCodec {
    fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|err| AuthError::Signing(err.to_string()))
    }

    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| {
                debug!("Rejected session token: {err}");
                AuthError::Unauthenticated
            })
    }
}
