//! Mutation audit sink and login-audit queue

use crate::domain::{AuditEntity, AuditOp, AuditRecord, LoginAuditEvent};
use crate::repository::AuditRepository;
use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Appends one record per successful principal mutation. Failures are logged,
/// never surfaced to the caller.
pub struct AuditSink<A: AuditRepository> {
    repo: Arc<A>,
}

impl<A: AuditRepository> AuditSink<A> {
    pub fn new(repo: Arc<A>) -> Self {
        Self { repo }
    }

    pub async fn record(
        &self,
        entity_id: i64,
        entity_type: AuditEntity,
        op: AuditOp,
        permissions: serde_json::Value,
        actor_id: i64,
    ) {
        let record = AuditRecord {
            entity_id,
            entity_type,
            op,
            permissions,
            actor_id,
            created_at: Utc::now(),
        };
        if let Err(e) = self.repo.record_mutation(&record).await {
            warn!(
                entity_id,
                entity_type = entity_type.as_str(),
                op = op.as_str(),
                error = %e,
                "Failed to write audit record"
            );
        }
    }
}

/// Bounded fire-and-forget queue for login events.
#[derive(Clone)]
pub struct LoginAuditQueue {
    tx: mpsc::Sender<LoginAuditEvent>,
}

impl LoginAuditQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LoginAuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Never blocks. Returns false when the event was dropped.
    pub fn post(&self, event: LoginAuditEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                counter!("rbac_audit_events_dropped_total").increment(1);
                debug!(user_id = event.user_id, "Login audit queue full, event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                counter!("rbac_audit_events_dropped_total").increment(1);
                false
            }
        }
    }
}

/// Drain the queue into the store until every sender is gone.
pub fn spawn_login_audit_worker<A: AuditRepository + 'static>(
    mut rx: mpsc::Receiver<LoginAuditEvent>,
    repo: Arc<A>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = repo.record_login(&event).await {
                warn!(user_id = event.user_id, error = %e, "Failed to persist login audit");
            }
        }
        debug!("Login audit worker stopped");
    })
}
