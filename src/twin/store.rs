//! Twin store
//!
//! Holds the authoritative twin for every registered device.
//! - One `Arc<DeviceEntry>` per device: a keyed single-writer lock.
//!   The map lock is only held long enough to clone the handle, so
//!   different devices merge in parallel.
//! - Desired changes are fanned out to subscribers while the device lock
//!   is held, which keeps pushes in version order.
//! - Nothing is buffered for offline or slow subscribers: a push that
//!   cannot be enqueued drops the subscriber.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use super::merge;
use super::types::{DesiredPush, ExpectedVersion, Patch, Section, Twin};
use crate::error::{Result, TwinError};

/// Shared, cloneable handle to the twin store
#[derive(Clone, Default)]
pub struct TwinStore {
    inner: Arc<TwinStoreInner>,
}

#[derive(Default)]
struct TwinStoreInner {
    devices: RwLock<HashMap<String, Arc<DeviceEntry>>>,
}

struct DeviceEntry {
    twin: Mutex<Twin>,
    subscribers: parking_lot::Mutex<Vec<Subscriber>>,
}

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<DesiredPush>,
}

/// Receiving end of a device's push stream
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<DesiredPush>,
}

impl DeviceEntry {
    fn new(device_id: &str) -> Self {
        Self {
            twin: Mutex::new(Twin::new(device_id)),
            subscribers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn fan_out(&self, device_id: &str, push: &DesiredPush) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| match sub.tx.try_send(push.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    device_id = %device_id,
                    subscription = %sub.id,
                    version = push.version,
                    "Push stream full, dropping subscriber"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(
                    device_id = %device_id,
                    subscription = %sub.id,
                    "Subscriber gone"
                );
                false
            }
        });
    }
}

impl TwinStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Device lifecycle
    // ========================================================================

    /// Create an empty twin. Registering an existing device is a no-op.
    pub async fn register_device(&self, device_id: &str) -> Result<()> {
        if device_id.trim().is_empty() {
            return Err(TwinError::BadRequest("device id must not be empty".into()));
        }

        let mut devices = self.inner.devices.write().await;
        if !devices.contains_key(device_id) {
            devices.insert(device_id.to_string(), Arc::new(DeviceEntry::new(device_id)));
            tracing::info!(device_id = %device_id, "Registered device twin");
        }
        Ok(())
    }

    /// Drop a twin and close all of its push streams
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        let entry = self
            .inner
            .devices
            .write()
            .await
            .remove(device_id)
            .ok_or_else(|| TwinError::NotFound(device_id.to_string()))?;

        entry.subscribers.lock().clear();
        tracing::info!(device_id = %device_id, "Removed device twin");
        Ok(())
    }

    async fn entry(&self, device_id: &str) -> Result<Arc<DeviceEntry>> {
        self.inner
            .devices
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| TwinError::NotFound(device_id.to_string()))
    }

    // ========================================================================
    // Twin operations
    // ========================================================================

    /// Apply a device-authored patch. Unconditional, notifies no one.
    pub async fn apply_reported_patch(&self, device_id: &str, patch: &Patch) -> Result<u64> {
        patch.expect_section(Section::Reported)?;
        let entry = self.entry(device_id).await?;

        let mut twin = entry.twin.lock().await;
        let version = merge::apply(&mut twin, patch);

        tracing::debug!(
            device_id = %device_id,
            version,
            keys = patch.entries.len(),
            "Applied reported patch"
        );
        Ok(version)
    }

    /// Apply a service-authored patch and push it to connected sessions
    pub async fn apply_desired_patch(
        &self,
        device_id: &str,
        patch: &Patch,
        expected: ExpectedVersion,
    ) -> Result<u64> {
        patch.expect_section(Section::Desired)?;
        let entry = self.entry(device_id).await?;

        let mut twin = entry.twin.lock().await;
        if let ExpectedVersion::Exact(expected) = expected {
            if expected != twin.desired_version {
                return Err(TwinError::VersionConflict {
                    expected,
                    actual: twin.desired_version,
                });
            }
        }

        let version = merge::apply(&mut twin, patch);
        entry.fan_out(
            device_id,
            &DesiredPush {
                version,
                patch: patch.entries.clone(),
            },
        );

        tracing::debug!(
            device_id = %device_id,
            version,
            expected = %expected,
            "Applied desired patch"
        );
        Ok(version)
    }

    /// Snapshot of the full twin
    pub async fn get_twin(&self, device_id: &str) -> Result<Twin> {
        let entry = self.entry(device_id).await?;
        let twin = entry.twin.lock().await;
        Ok(twin.clone())
    }

    // ========================================================================
    // Push subscriptions
    // ========================================================================

    /// Open a bounded push stream for a connected session
    pub async fn subscribe(&self, device_id: &str, capacity: usize) -> Result<Subscription> {
        let entry = self.entry(device_id).await?;
        let (tx, receiver) = mpsc::channel(capacity.max(1));
        let id = Uuid::new_v4();

        entry.subscribers.lock().push(Subscriber { id, tx });
        tracing::debug!(device_id = %device_id, subscription = %id, "Push stream opened");

        Ok(Subscription { id, receiver })
    }

    /// Close one push stream. Unknown ids are ignored.
    pub async fn unsubscribe(&self, device_id: &str, subscription: Uuid) {
        if let Ok(entry) = self.entry(device_id).await {
            entry.subscribers.lock().retain(|sub| sub.id != subscription);
        }
    }

    /// Close every push stream of a device, returning how many were open
    pub async fn disconnect_all(&self, device_id: &str) -> usize {
        match self.entry(device_id).await {
            Ok(entry) => {
                let mut subscribers = entry.subscribers.lock();
                let count = subscribers.len();
                subscribers.clear();
                count
            }
            Err(_) => 0,
        }
    }

    /// Number of open push streams for a device
    pub async fn connected_sessions(&self, device_id: &str) -> usize {
        match self.entry(device_id).await {
            Ok(entry) => entry
                .subscribers
                .lock()
                .iter()
                .filter(|sub| !sub.tx.is_closed())
                .count(),
            Err(_) => 0,
        }
    }
}
