//! Device transport seam
//!
//! `TwinTransport` is the boundary between a device session and the
//! service. Real transports (MQTT, WebSocket) plug in here; the crate
//! ships `InProcessTransport`, which binds a session directly to a
//! `TwinStore` and supports fault injection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Result, TwinError};
use crate::twin::{DesiredPush, Patch, Twin, TwinStore};

/// Inbound desired-property pushes for one connection.
///
/// The stream ending (`next` returning `None`) is a transport fault signal.
pub struct PushStream {
    pub id: Uuid,
    receiver: mpsc::Receiver<DesiredPush>,
}

impl PushStream {
    pub fn new(id: Uuid, receiver: mpsc::Receiver<DesiredPush>) -> Self {
        Self { id, receiver }
    }

    pub async fn next(&mut self) -> Option<DesiredPush> {
        self.receiver.recv().await
    }
}

/// Operations a device session needs from the service
#[async_trait]
pub trait TwinTransport: Send + Sync + 'static {
    /// Establish presence and open the push stream
    async fn connect(&self, device_id: &str, push_capacity: usize) -> Result<PushStream>;

    /// Full twin fetch
    async fn get_twin(&self, device_id: &str) -> Result<Twin>;

    /// Send a reported patch, returning the new reported version
    async fn patch_reported(&self, device_id: &str, patch: &Patch) -> Result<u64>;

    /// Tear down a push stream
    async fn disconnect(&self, device_id: &str, stream: Uuid);
}

/// Kind of injected transport fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Drop the connection: streams close, calls fail with `ConnectionLost`
    Tcp,
    /// Stall calls for the fault's duration
    Timeout,
}

/// Fault injection request
#[derive(Debug, Clone)]
pub struct Fault {
    pub kind: FaultKind,
    pub reason: String,
    pub duration: Duration,
}

impl Fault {
    pub fn tcp(reason: impl Into<String>, duration: Duration) -> Self {
        Self {
            kind: FaultKind::Tcp,
            reason: reason.into(),
            duration,
        }
    }

    pub fn timeout(reason: impl Into<String>, duration: Duration) -> Self {
        Self {
            kind: FaultKind::Timeout,
            reason: reason.into(),
            duration,
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveFault {
    kind: FaultKind,
    reason: String,
    until: Instant,
}

/// Transport that talks to a `TwinStore` in the same process
#[derive(Clone)]
pub struct InProcessTransport {
    store: TwinStore,
    faults: Arc<parking_lot::Mutex<HashMap<String, ActiveFault>>>,
}

impl InProcessTransport {
    pub fn new(store: TwinStore) -> Self {
        Self {
            store,
            faults: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &TwinStore {
        &self.store
    }

    /// Inject a fault for one device. A TCP fault also closes every open
    /// push stream of that device immediately.
    pub async fn inject_fault(&self, device_id: &str, fault: Fault) {
        tracing::warn!(
            device_id = %device_id,
            kind = ?fault.kind,
            reason = %fault.reason,
            duration_ms = fault.duration.as_millis() as u64,
            "Injecting transport fault"
        );

        self.faults.lock().insert(
            device_id.to_string(),
            ActiveFault {
                kind: fault.kind,
                reason: fault.reason,
                until: Instant::now() + fault.duration,
            },
        );

        if fault.kind == FaultKind::Tcp {
            let closed = self.store.disconnect_all(device_id).await;
            tracing::debug!(device_id = %device_id, closed, "Closed push streams");
        }
    }

    /// Lift any active fault for a device
    pub fn clear_fault(&self, device_id: &str) {
        self.faults.lock().remove(device_id);
    }

    pub fn is_faulted(&self, device_id: &str) -> bool {
        self.active_fault(device_id).is_some()
    }

    fn active_fault(&self, device_id: &str) -> Option<ActiveFault> {
        let mut faults = self.faults.lock();
        match faults.get(device_id) {
            Some(fault) if fault.until > Instant::now() => Some(fault.clone()),
            Some(_) => {
                faults.remove(device_id);
                None
            }
            None => None,
        }
    }

    async fn check(&self, device_id: &str) -> Result<()> {
        match self.active_fault(device_id) {
            None => Ok(()),
            Some(fault) => match fault.kind {
                FaultKind::Tcp => Err(TwinError::ConnectionLost(fault.reason)),
                FaultKind::Timeout => {
                    tokio::time::sleep_until(fault.until).await;
                    Ok(())
                }
            },
        }
    }
}

#[async_trait]
impl TwinTransport for InProcessTransport {
    async fn connect(&self, device_id: &str, push_capacity: usize) -> Result<PushStream> {
        self.check(device_id).await?;
        let subscription = self.store.subscribe(device_id, push_capacity).await?;
        Ok(PushStream::new(subscription.id, subscription.receiver))
    }

    async fn get_twin(&self, device_id: &str) -> Result<Twin> {
        self.check(device_id).await?;
        self.store.get_twin(device_id).await
    }

    async fn patch_reported(&self, device_id: &str, patch: &Patch) -> Result<u64> {
        self.check(device_id).await?;
        self.store.apply_reported_patch(device_id, patch).await
    }

    async fn disconnect(&self, device_id: &str, stream: Uuid) {
        self.store.unsubscribe(device_id, stream).await;
    }
}
