//! Fire-and-forget audit events for login attempts and authenticated requests.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Login,
    PasswordChange,
    Request,
}

#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    /// `ok` or an error kind such as `account_locked`.
    pub outcome: &'static str,
    pub identity: Option<String>,
    pub address: String,
    pub elapsed: Duration,
}

pub trait AuditSink: Send + Sync {
    /// Must not block and must not fail the caller.
    fn emit(&self, event: AuditEvent);
}

#[derive(Clone, Debug)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn emit(&self, _event: AuditEvent) {}
}

/// Bounded queue drained by a background task that writes `audit` log events.
#[derive(Clone, Debug)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Start the writer task. It exits once every sender is dropped.
    #[must_use]
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(drain(rx));
        (Self { tx }, handle)
    }
}

impl AuditSink for ChannelAuditSink {
    fn emit(&self, event: AuditEvent) {
        if let Err(err) = self.tx.try_send(event) {
            warn!("Dropped audit event: {err}");
        }
    }
}

async fn drain(mut rx: mpsc::Receiver<AuditEvent>) {
    while let Some(event) = rx.recv().await {
        info!(
            target: "audit",
            action = ?event.action,
            outcome = event.outcome,
            identity = event.identity.as_deref().unwrap_or("-"),
            address = %event.address,
            elapsed_ms = u64::try_from(event.elapsed.as_millis()).unwrap_or(u64::MAX),
            "auth event"
        );
    }
}
