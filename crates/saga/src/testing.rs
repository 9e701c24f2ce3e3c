//! Test doubles shared by this crate's tests and the API integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::provisioning::{ProvisionError, ProvisionRequest, Provisioner};

/// Scripted [`Provisioner`] that records every request.
pub struct StubProvisioner {
    /// Calls that fail before the stub starts succeeding. `u32::MAX` never succeeds.
    failures: u32,
    calls: AtomicU32,
    requests: Mutex<Vec<ProvisionRequest>>,
    /// Requests for these owners park until the gate is opened.
    gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl StubProvisioner {
    pub fn succeeding() -> Self {
        Self::failing_times(0)
    }

    pub fn failing() -> Self {
        Self::failing_times(u32::MAX)
    }

    /// Fail the first `n` calls, then succeed.
    pub fn failing_times(n: u32) -> Self {
        Self {
            failures: n,
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Hold requests for `owner_id` until [`release`](Self::release).
    pub fn gate(&self, owner_id: &str) {
        self.gates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(owner_id.to_string(), Arc::new(Notify::new()));
    }

    pub fn release(&self, owner_id: &str) {
        let gate = self
            .gates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(owner_id);
        if let Some(gate) = gate {
            gate.notify_waiters();
            gate.notify_one();
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ProvisionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Provisioner for StubProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> Result<(), ProvisionError> {
        let gate = self
            .gates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request.owner_id)
            .cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if call < self.failures {
            return Err(ProvisionError::HttpStatus(503));
        }
        Ok(())
    }
}
