//! Request-time session gate.
//!
//! Flow Overview: read the token (bearer header first, then the `access_token` cookie),
//! verify it against the session service, and attach the [`Claims`](super::Claims) to the request.
//! A request without a token is rejected as is; a request with an invalid token is
//! rejected and told to drop the cookie. Nothing is retried here.

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{
        HeaderMap, HeaderValue,
        header::{AUTHORIZATION, COOKIE, InvalidHeaderValue, SET_COOKIE},
        request::Parts,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{AuditAction, AuditEvent, AuthConfig, AuthError, AuthState};

pub const SESSION_COOKIE_NAME: &str = "access_token";

const UNKNOWN_ADDRESS: &str = "unknown";

/// Why the guard refused a request.
#[derive(Debug, PartialEq, Eq)]
pub enum Rejection {
    NoCredential,
    InvalidCredential,
}

/// Require a live session. On success the request carries `Extension<Claims>`.
pub async fn require_session(
    State(state): State<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let address = client_address(
        request.headers(),
        request.extensions().get::<ConnectInfo<SocketAddr>>(),
        state.config().trust_forwarded_for(),
    );

    let verified = match extract_session_token(request.headers()) {
        None => Err((Rejection::NoCredential, AuthError::Unauthenticated)),
        Some(token) => {
            let settings = state.settings();
            state
                .sessions()
                .verify(&settings, &token)
                .await
                .map_err(|err| (Rejection::InvalidCredential, err))
        }
    };

    match verified {
        Ok(claims) => {
            let identity = claims.sub.clone();
            request.extensions_mut().insert(claims);
            let response = next.run(request).await;
            emit(&state, "ok", Some(identity), address, started);
            response
        }
        Err((rejection, err)) => {
            debug!(?rejection, "request rejected: {err}");
            emit(&state, err.kind(), None, address, started);
            let clear = rejection == Rejection::InvalidCredential
                && matches!(err, AuthError::Unauthenticated);
            let mut response = err.into_response();
            if clear && let Ok(cookie) = clear_session_cookie(state.config()) {
                response.headers_mut().insert(SET_COOKIE, cookie);
            }
            response
        }
    }
}

fn emit(
    state: &AuthState,
    outcome: &'static str,
    identity: Option<String>,
    address: String,
    started: Instant,
) {
    state.audit().emit(AuditEvent {
        action: AuditAction::Request,
        outcome,
        identity,
        address,
        elapsed: started.elapsed(),
    });
}

/// Source address used for lockout and audit.
///
/// The socket peer, unless forwarded headers are trusted: then the first
/// `x-forwarded-for` hop, then `x-real-ip`.
#[must_use]
pub fn client_address(
    headers: &HeaderMap,
    peer: Option<&ConnectInfo<SocketAddr>>,
    trust_forwarded_for: bool,
) -> String {
    if trust_forwarded_for && let Some(forwarded) = forwarded_address(headers) {
        return forwarded;
    }
    peer.map_or_else(
        || UNKNOWN_ADDRESS.to_string(),
        |ConnectInfo(addr)| addr.ip().to_string(),
    )
}

fn forwarded_address(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Extractor for the request's source address.
///
/// Reads the trust setting from the `Extension<Arc<AuthState>>` layer; without it
/// forwarded headers are ignored.
#[derive(Clone, Debug)]
pub struct ClientAddress(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientAddress {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let trust = parts
            .extensions
            .get::<Arc<AuthState>>()
            .is_some_and(|state| state.config().trust_forwarded_for());
        Ok(Self(client_address(
            &parts.headers,
            parts.extensions.get::<ConnectInfo<SocketAddr>>(),
            trust,
        )))
    }
}

pub(crate) fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = extract_bearer_token(headers) {
        return Some(token);
    }
    let value = headers.get(COOKIE)?.to_str().ok()?;
    value.split(';').find_map(|pair| {
        let (key, val) = pair.trim().split_once('=')?;
        (key.trim() == SESSION_COOKIE_NAME && !val.trim().is_empty())
            .then(|| val.trim().to_string())
    })
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// `HttpOnly` cookie carrying the session token.
///
/// # Errors
/// Returns an error if the token is not a valid header value.
pub fn session_cookie(
    config: &AuthConfig,
    token: &str,
    max_age: Duration,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        max_age.as_secs()
    );
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// Expired cookie that makes the client drop its token.
///
/// # Errors
/// Returns an error if the cookie is not a valid header value.
pub fn clear_session_cookie(config: &AuthConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    session_cookie(config, "", Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    fn peer() -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::from(([192, 0, 2, 10], 4711)))
    }

    #[test]
    fn bearer_wins_over_cookie() {
        let headers = headers(&[
            ("authorization", "Bearer header-token"),
            ("cookie", "access_token=cookie-token"),
        ]);
        assert_eq!(
            extract_session_token(&headers).as_deref(),
            Some("header-token")
        );
    }

    #[test]
    fn reads_cookie_among_others() {
        let headers = headers(&[("cookie", "theme=dark; access_token=abc; lang=en")]);
        assert_eq!(extract_session_token(&headers).as_deref(), Some("abc"));
    }

    #[test]
    fn empty_values_are_missing() {
        assert_eq!(extract_session_token(&headers(&[("cookie", "access_token=")])), None);
        assert_eq!(extract_session_token(&headers(&[("authorization", "Bearer ")])), None);
        assert_eq!(extract_session_token(&HeaderMap::new()), None);
    }

    #[test]
    fn forwarded_headers_need_trust() {
        let headers = headers(&[("x-forwarded-for", "203.0.113.5, 10.0.0.1")]);
        let peer = peer();
        assert_eq!(client_address(&headers, Some(&peer), false), "192.0.2.10");
        assert_eq!(client_address(&headers, Some(&peer), true), "203.0.113.5");
    }

    #[test]
    fn real_ip_is_second_choice() {
        let headers = headers(&[("x-real-ip", "203.0.113.7")]);
        assert_eq!(client_address(&headers, None, true), "203.0.113.7");
        assert_eq!(client_address(&HeaderMap::new(), None, true), UNKNOWN_ADDRESS);
    }

    #[test]
    fn cookies_are_http_only_and_strict() {
        let config = AuthConfig::new("lab".to_string()).with_cookie_secure(true);
        let cookie = session_cookie(&config, "abc", Duration::from_secs(3600));
        assert_eq!(
            cookie.ok().as_ref().and_then(|value| value.to_str().ok()),
            Some("access_token=abc; Path=/; HttpOnly; SameSite=Strict; Max-Age=3600; Secure")
        );
        let cleared = clear_session_cookie(&AuthConfig::new("lab".to_string()));
        assert!(
            cleared
                .ok()
                .as_ref()
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.starts_with("access_token=;") && value.contains("Max-Age=0"))
        );
    }
}
