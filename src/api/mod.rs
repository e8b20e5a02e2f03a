//! HTTP surface: router, server wiring and the `OpenAPI` document.
//!
//! Flow Overview:
//! 1) [`new`] starts Vault token renewal, connects Postgres and loads the first settings
//!    document. Startup stops here if the document cannot be read.
//! 2) The settings synchronizer, the expired-row purge and the audit writer run as
//!    background tasks for the lifetime of the server.
//! 3) [`router`] mounts the public routes and the guarded routes behind
//!    [`guard::require_session`].
//! 4) Shutdown (renewal failure or Ctrl-C) drains connections, then stops the tasks.

use crate::{
    auth::{
        AuthBackends, AuthConfig, AuthState, ChannelAuditSink, JwtCodec, PgCredentials, guard,
    },
    cli::globals::GlobalArgs,
    settings::ConfigSync,
    store::PgStore,
    vault::{self, kv::VaultConfigStore},
};
use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    middleware,
    routing::{delete, get, post},
};
use secrecy::SecretString;
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span, warn};
use ulid::Ulid;

pub(crate) mod handlers;
mod openapi;

pub use openapi::openapi;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the server needs besides the port, DSN and Vault session.
#[derive(Debug)]
pub struct ServerOptions {
    pub auth: AuthConfig,
    pub signing_key: SecretString,
    pub kv_mount: String,
    pub kv_path: String,
    pub config_poll: Duration,
    pub audit_buffer: usize,
}

/// Build the API router.
///
/// `/health`, `/login` and `/login/password` are public; every other route requires a
/// live session.
#[must_use]
pub fn router(state: Arc<AuthState>) -> Router {
    use handlers::{auth, health};

    let guarded = Router::new()
        .route("/verify", get(auth::verify))
        .route("/code", get(auth::code))
        .route("/refresh_token", post(auth::refresh_token))
        .route("/logout", post(auth::logout))
        .route("/user", get(auth::user))
        .route("/user/password", post(auth::change_password))
        .route(
            "/sessions",
            get(auth::list_sessions).delete(auth::clear_sessions),
        )
        .route("/sessions/{uid}", delete(auth::revoke_session))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            guard::require_session,
        ));

    Router::new()
        .route("/health", get(health::health))
        .route("/login", post(auth::login))
        .route("/login/password", post(auth::change_expired_password))
        .merge(guarded)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(state)),
        )
}

/// Start the server
/// # Errors
/// Return error if the database, Vault or the first settings fetch fails, or the
/// listener cannot be bound.
pub async fn new(
    port: u16,
    dsn: String,
    globals: &GlobalArgs,
    options: ServerOptions,
) -> Result<()> {
    // Renew vault token, gracefully shutdown if failed
    let (tx, rx) = mpsc::unbounded_channel();

    vault::renew::try_renew(globals, tx).await?;

    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let config_store = VaultConfigStore::new(
        globals.clone(),
        &options.kv_mount,
        &options.kv_path,
        options.config_poll,
    )?;
    let (sync, snapshot) = ConfigSync::bootstrap(Arc::new(config_store))
        .await
        .context("Failed to load settings from Vault")?;

    let cancel = CancellationToken::new();
    let sync_task = sync.spawn(cancel.clone());

    let store = Arc::new(PgStore::new(pool.clone()));
    store.spawn_purge(PURGE_INTERVAL, cancel.clone());

    let (audit, audit_task) = ChannelAuditSink::spawn(options.audit_buffer);

    let codec = JwtCodec::new(&options.signing_key, options.auth.namespace());
    let state = AuthState::new(
        options.auth,
        snapshot,
        AuthBackends {
            counters: store.clone(),
            sessions: store,
            codec: Arc::new(codec),
            credentials: Arc::new(PgCredentials::new(pool.clone())),
        },
    )
    .with_audit(Arc::new(audit));

    let app = router(Arc::new(state)).layer(Extension(pool));

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(rx))
    .await?;

    cancel.cancel();
    if let Err(err) = sync_task.await {
        warn!("Settings synchronizer ended abnormally: {err}");
    }
    if tokio::time::timeout(DRAIN_TIMEOUT, audit_task).await.is_err() {
        warn!("Audit writer did not drain in time");
    }

    Ok(())
}

async fn shutdown_signal(mut rx: mpsc::UnboundedReceiver<()>) {
    tokio::select! {
        _ = rx.recv() => warn!("Vault token renewal failed"),
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("Failed to listen for Ctrl-C: {err}");
            }
        }
    }
    info!("Gracefully shutdown");
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
