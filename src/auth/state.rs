//! Auth configuration and the shared state handed to handlers.

use std::sync::Arc;
use std::time::Duration;

use super::{
    AuditSink, ClaimsCodec, CredentialVerifier, Lockout, NoopAuditSink, Sessions,
};
use crate::settings::{Settings, Snapshot};
use crate::store::{CounterStore, SessionStore};

const DEFAULT_REFRESH_CODE_TTL_SECONDS: u64 = 60;

/// Process-level auth options. Policy values live in [`Settings`] instead.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    namespace: String,
    refresh_code_ttl: Duration,
    cookie_secure: bool,
    trust_forwarded_for: bool,
}

impl AuthConfig {
    #[must_use]
    pub fn new(namespace: String) -> Self {
        Self {
            namespace,
            refresh_code_ttl: Duration::from_secs(DEFAULT_REFRESH_CODE_TTL_SECONDS),
            cookie_secure: false,
            trust_forwarded_for: false,
        }
    }

    #[must_use]
    pub fn with_refresh_code_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_code_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    /// Take the client address from `x-forwarded-for` / `x-real-ip`. Only safe behind a
    /// proxy that overwrites those headers.
    #[must_use]
    pub fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn refresh_code_ttl(&self) -> Duration {
        self.refresh_code_ttl
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }

    #[must_use]
    pub fn trust_forwarded_for(&self) -> bool {
        self.trust_forwarded_for
    }
}

/// Backends the auth core talks to.
pub struct AuthBackends {
    pub counters: Arc<dyn CounterStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub codec: Arc<dyn ClaimsCodec>,
    pub credentials: Arc<dyn CredentialVerifier>,
}

pub struct AuthState {
    config: AuthConfig,
    snapshot: Snapshot,
    pub(super) lockout: Lockout,
    pub(super) sessions: Sessions,
    pub(super) credentials: Arc<dyn CredentialVerifier>,
    audit: Arc<dyn AuditSink>,
}

impl AuthState {
    #[must_use]
    pub fn new(config: AuthConfig, snapshot: Snapshot, backends: AuthBackends) -> Self {
        let lockout = Lockout::new(backends.counters, config.namespace());
        let sessions = Sessions::new(
            backends.sessions,
            backends.codec,
            config.namespace(),
            config.refresh_code_ttl(),
        );
        Self {
            config,
            snapshot,
            lockout,
            sessions,
            credentials: backends.credentials,
            audit: Arc::new(NoopAuditSink),
        }
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// The policy in effect right now. Hold on to the returned value for the whole
    /// request.
    #[must_use]
    pub fn settings(&self) -> Arc<Settings> {
        self.snapshot.current()
    }

    #[must_use]
    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    #[must_use]
    pub fn audit(&self) -> &dyn AuditSink {
        self.audit.as_ref()
    }
}
