//! Session authentication and login-failure lockout.
//!
//! Flow Overview:
//! 1) `POST /login` runs [`AuthState::login`]: lockout pre-check, password check,
//!    lockout bookkeeping, then a signed token plus a server-side session record.
//! 2) Guarded routes go through [`guard::require_session`], which verifies the token
//!    and the session record and attaches [`Claims`].
//! 3) Refresh codes and logout operate on the same session record, so a revoked token
//!    stops verifying before its signature expires.

pub mod audit;
pub mod claims;
pub mod credentials;
mod error;
pub mod guard;
pub mod lockout;
mod login;
pub mod password;
pub mod session;
mod state;

pub use audit::{AuditAction, AuditEvent, AuditSink, ChannelAuditSink, NoopAuditSink};
pub use claims::{Claims, ClaimsCodec, JwtCodec};
pub use credentials::{CredentialVerifier, MemoryCredentials, PgCredentials};
pub use error::{AuthError, ErrorBody};
pub use lockout::{Attempt, KeyKind, Lockout};
pub use session::{IssuedToken, Sessions};
pub use state::{AuthBackends, AuthConfig, AuthState};
