//! Errors returned by the auth core.
//!
//! Every variant maps to a stable status code and a short message that never names
//! the account or the cause. Causes are logged server-side only.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unauthenticated")]
    Unauthenticated,
    /// Wrong identifier or password. Reported exactly like [`AuthError::Unauthenticated`].
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account locked")]
    AccountLocked,
    #[error("address locked")]
    AddressLocked,
    #[error("address blocked")]
    AddressBlocked,
    #[error("invalid refresh code")]
    InvalidRefreshCode,
    #[error("password expired")]
    PasswordExpired,
    #[error("password does not meet the strength policy")]
    WeakPassword,
    #[error("token signing failed: {0}")]
    Signing(String),
    #[error("configuration unavailable: {0}")]
    ConfigUnavailable(String),
    #[error("transient store error: {0}")]
    TransientStore(#[from] StoreError),
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub message: &'static str,
}

impl AuthError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated | Self::InvalidCredentials | Self::InvalidRefreshCode => {
                StatusCode::UNAUTHORIZED
            }
            Self::AddressBlocked | Self::PasswordExpired => StatusCode::FORBIDDEN,
            Self::AccountLocked | Self::AddressLocked => StatusCode::TOO_MANY_REQUESTS,
            Self::WeakPassword => StatusCode::BAD_REQUEST,
            Self::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ConfigUnavailable(_) | Self::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Caller-facing message.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Unauthenticated | Self::InvalidCredentials => "Authentication failed.",
            Self::AccountLocked | Self::AddressLocked => {
                "Too many failed attempts. Try again later."
            }
            Self::AddressBlocked => "Access denied.",
            Self::InvalidRefreshCode => "Invalid or expired refresh code.",
            Self::PasswordExpired => "Password expired. Reset your password to continue.",
            Self::WeakPassword => "Password does not meet the strength policy.",
            Self::Signing(_) => "Internal error.",
            Self::ConfigUnavailable(_) | Self::TransientStore(_) => {
                "Service temporarily unavailable. Try again later."
            }
        }
    }

    /// Label used in logs and audit events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::InvalidCredentials => "invalid_credentials",
            Self::AccountLocked => "account_locked",
            Self::AddressLocked => "address_locked",
            Self::AddressBlocked => "address_blocked",
            Self::InvalidRefreshCode => "invalid_refresh_code",
            Self::PasswordExpired => "password_expired",
            Self::WeakPassword => "weak_password",
            Self::Signing(_) => "signing",
            Self::ConfigUnavailable(_) => "config_unavailable",
            Self::TransientStore(_) => "transient_store",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Auth request failed: {self}");
        }
        let body = ErrorBody {
            message: self.public_message(),
        };
        (status, Json(body)).into_response()
    }
}
