//! Per-principal advisory lock for mutations

use crate::error::{AppError, Result};
use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub const CONCURRENT_REQUEST_MESSAGE: &str = "concurrent request in progress: there is an ongoing \
     request for this user, please try after some time";

/// Rejects a second mutation on an id while the first is in flight.
/// Read paths never acquire it.
#[derive(Clone, Default)]
pub struct RequestGate {
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl RequestGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`; the returned guard releases it on drop.
    pub fn acquire(&self, id: i64) -> Result<GateGuard> {
        if !self.in_flight.lock().insert(id) {
            counter!("rbac_gate_conflicts_total").increment(1);
            debug!(principal_id = id, "Mutation refused, principal busy");
            return Err(AppError::Conflict(CONCURRENT_REQUEST_MESSAGE.to_string()));
        }
        Ok(GateGuard {
            id,
            in_flight: self.in_flight.clone(),
        })
    }

    /// Claim every id or none of them.
    pub fn acquire_all(&self, ids: &[i64]) -> Result<Vec<GateGuard>> {
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            // Earlier guards drop on the error path.
            guards.push(self.acquire(*id)?);
        }
        Ok(guards)
    }

    pub fn is_held(&self, id: i64) -> bool {
        self.in_flight.lock().contains(&id)
    }
}

#[must_use = "the gate is released when the guard is dropped"]
pub struct GateGuard {
    id: i64,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.id);
    }
}
