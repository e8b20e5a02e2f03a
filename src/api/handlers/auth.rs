//! Login, session and password endpoints.
//!
//! `login` and `change_expired_password` are public. The others run behind the session
//! guard and read the verified [`Claims`] from the request extensions.

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use utoipa::ToSchema;

use crate::auth::{
    AuthError, AuthState, Claims, ErrorBody, IssuedToken,
    guard::{ClientAddress, clear_session_cookie, session_cookie},
};

#[derive(ToSchema, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TokenResponse {
    pub token: String,
    /// Expiry as seconds since the Unix epoch.
    pub expires_at: u64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CodeResponse {
    pub code: String,
    /// Seconds until the code stops working.
    pub expires_in: u64,
}

#[derive(ToSchema, Deserialize)]
pub struct RefreshRequest {
    pub code: String,
}

#[derive(ToSchema, Deserialize)]
pub struct PasswordChangeRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(ToSchema, Deserialize)]
pub struct ExpiredPasswordChangeRequest {
    pub email: String,
    pub current_password: String,
    pub new_password: String,
}

/// Token body plus the session cookie.
fn token_response(state: &AuthState, issued: IssuedToken) -> Response {
    let max_age = Duration::from_secs(issued.claims.exp.saturating_sub(issued.claims.iat));
    let mut headers = HeaderMap::new();
    match session_cookie(state.config(), &issued.token, max_age) {
        Ok(cookie) => {
            headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build session cookie: {err}"),
    }
    let body = TokenResponse {
        token: issued.token,
        expires_at: issued.claims.exp,
    };
    (StatusCode::OK, headers, Json(body)).into_response()
}

/// `204 No Content` that also drops the session cookie.
fn cleared_response(state: &AuthState) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(state.config()) {
        headers.insert(SET_COOKIE, cookie);
    }
    (StatusCode::NO_CONTENT, headers).into_response()
}

#[utoipa::path(
    post,
    path = "/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session started", body = TokenResponse),
        (status = 401, description = "Invalid email or password", body = ErrorBody),
        (status = 403, description = "Address blocked or password expired", body = ErrorBody),
        (status = 429, description = "Account or address locked", body = ErrorBody),
        (status = 503, description = "Store or settings unavailable", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn login(
    state: Extension<Arc<AuthState>>,
    ClientAddress(address): ClientAddress,
    Json(request): Json<LoginRequest>,
) -> Result<Response, AuthError> {
    let issued = state
        .login(&request.email, &request.password, &address)
        .await?;
    Ok(token_response(&state, issued))
}

#[utoipa::path(
    get,
    path = "/verify",
    responses(
        (status = 204, description = "Session is live"),
        (status = 401, description = "Missing, invalid or revoked token", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "auth"
)]
pub async fn verify(Extension(_claims): Extension<Claims>) -> StatusCode {
    StatusCode::NO_CONTENT
}

#[utoipa::path(
    get,
    path = "/user",
    responses(
        (status = 200, description = "Claims of the current session", body = Claims),
        (status = 401, description = "Missing, invalid or revoked token", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "auth"
)]
pub async fn user(Extension(claims): Extension<Claims>) -> Json<Claims> {
    Json(claims)
}

#[utoipa::path(
    get,
    path = "/code",
    responses(
        (status = 200, description = "Single-use refresh code", body = CodeResponse),
        (status = 401, description = "Missing, invalid or revoked token", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "auth"
)]
pub async fn code(
    state: Extension<Arc<AuthState>>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<CodeResponse>, AuthError> {
    let code = state.sessions().issue_refresh_code(&claims).await?;
    Ok(Json(CodeResponse {
        code,
        expires_in: state.config().refresh_code_ttl().as_secs(),
    }))
}

#[utoipa::path(
    post,
    path = "/refresh_token",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New session token", body = TokenResponse),
        (status = 401, description = "Unknown, expired or used code", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "auth"
)]
pub async fn refresh_token(
    state: Extension<Arc<AuthState>>,
    Json(request): Json<RefreshRequest>,
) -> Result<Response, AuthError> {
    let settings = state.settings();
    let issued = state
        .sessions()
        .refresh_token(&settings, &request.code)
        .await?;
    Ok(token_response(&state, issued))
}

#[utoipa::path(
    post,
    path = "/logout",
    responses(
        (status = 204, description = "Session ended and cookie cleared"),
        (status = 401, description = "Missing, invalid or revoked token", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "auth"
)]
pub async fn logout(
    state: Extension<Arc<AuthState>>,
    Extension(claims): Extension<Claims>,
) -> Result<Response, AuthError> {
    state.sessions().logout(&claims).await?;
    Ok(cleared_response(&state))
}

#[utoipa::path(
    post,
    path = "/user/password",
    request_body = PasswordChangeRequest,
    responses(
        (status = 204, description = "Password changed; the session has ended"),
        (status = 400, description = "New password is too weak", body = ErrorBody),
        (status = 401, description = "Current password is wrong", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "auth"
)]
pub async fn change_password(
    state: Extension<Arc<AuthState>>,
    Extension(claims): Extension<Claims>,
    ClientAddress(address): ClientAddress,
    Json(request): Json<PasswordChangeRequest>,
) -> Result<Response, AuthError> {
    state
        .change_password(
            &claims,
            &request.current_password,
            &request.new_password,
            &address,
        )
        .await?;
    Ok(cleared_response(&state))
}

#[utoipa::path(
    post,
    path = "/login/password",
    request_body = ExpiredPasswordChangeRequest,
    responses(
        (status = 204, description = "Password changed; sign in with the new one"),
        (status = 400, description = "New password is too weak", body = ErrorBody),
        (status = 401, description = "Invalid email or password", body = ErrorBody),
        (status = 403, description = "Address blocked", body = ErrorBody),
        (status = 429, description = "Account or address locked", body = ErrorBody),
        (status = 503, description = "Store or settings unavailable", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn change_expired_password(
    state: Extension<Arc<AuthState>>,
    ClientAddress(address): ClientAddress,
    Json(request): Json<ExpiredPasswordChangeRequest>,
) -> Result<StatusCode, AuthError> {
    state
        .change_expired_password(
            &request.email,
            &request.current_password,
            &request.new_password,
            &address,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "Ids of users with a live session", body = [String]),
        (status = 401, description = "Missing, invalid or revoked token", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "sessions"
)]
pub async fn list_sessions(
    state: Extension<Arc<AuthState>>,
) -> Result<Json<Vec<String>>, AuthError> {
    Ok(Json(state.sessions().list().await?))
}

#[utoipa::path(
    delete,
    path = "/sessions/{uid}",
    params(("uid" = String, Path, description = "User id")),
    responses(
        (status = 204, description = "The user's session has ended"),
        (status = 401, description = "Missing, invalid or revoked token", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "sessions"
)]
pub async fn revoke_session(
    state: Extension<Arc<AuthState>>,
    Extension(claims): Extension<Claims>,
    Path(uid): Path<String>,
) -> Result<Response, AuthError> {
    state.sessions().revoke(&uid).await?;
    if uid == claims.sub {
        return Ok(cleared_response(&state));
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[utoipa::path(
    delete,
    path = "/sessions",
    responses(
        (status = 204, description = "Every session has ended, the caller's included"),
        (status = 401, description = "Missing, invalid or revoked token", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "sessions"
)]
pub async fn clear_sessions(state: Extension<Arc<AuthState>>) -> Result<Response, AuthError> {
    state.sessions().clear().await?;
    Ok(cleared_response(&state))
}
