//! Sync protocol state machine
//!
//! ```text
//! Disconnected -> Connecting -> Synced -> Disconnected (fault)
//!      ^                                      |
//!      |                                      v
//!      +------ (retries exhausted) ----- Reconnecting -> Synced
//!
//! any state -> Closed (terminal)
//! ```
//!
//! Entering `Synced` from `Reconnecting` requires a full twin fetch first;
//! the store keeps no backlog of pushes for offline devices. The helpers at
//! the bottom decide what a push or a fetched twin means for a session's
//! desired watermark.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Result, TwinError};
use crate::twin::{Properties, Twin};

/// Connection state of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Disconnected,
    Connecting,
    Synced,
    Reconnecting,
    Closed,
}

impl SyncState {
    pub fn can_transition_to(self, next: SyncState) -> bool {
        use SyncState::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting)
            | (Connecting, Synced)
            | (Connecting, Disconnected)
            | (Synced, Disconnected)
            | (Disconnected, Reconnecting)
            | (Reconnecting, Synced)
            | (Reconnecting, Disconnected) => true,
            _ => false,
        }
    }

    pub fn is_synced(self) -> bool {
        self == SyncState::Synced
    }
}

/// Observable protocol state with validated transitions
pub struct ProtocolState {
    tx: watch::Sender<SyncState>,
}

impl ProtocolState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncState::Disconnected);
        Self { tx }
    }

    pub fn current(&self) -> SyncState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.tx.subscribe()
    }

    /// Move to `next`, returning the previous state. The check and the
    /// update happen under the channel's lock.
    pub fn transition(&self, device_id: &str, next: SyncState) -> Result<SyncState> {
        let mut previous = None;
        let mut rejected_from = None;

        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                rejected_from = Some(*state);
                false
            }
        });

        match previous {
            Some(from) => {
                tracing::debug!(device_id = %device_id, from = ?from, to = ?next, "Sync state changed");
                Ok(from)
            }
            None => Err(TwinError::Internal(format!(
                "invalid sync transition {:?} -> {:?}",
                rejected_from.unwrap_or(next),
                next
            ))),
        }
    }

    /// Move to `next` only if the current state is `from`
    pub fn transition_from(&self, device_id: &str, from: SyncState, next: SyncState) -> bool {
        let moved = self.tx.send_if_modified(|state| {
            if *state == from && state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });

        if moved {
            tracing::debug!(device_id = %device_id, from = ?from, to = ?next, "Sync state changed");
        }
        moved
    }
}

impl Default for ProtocolState {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do with an inbound desired push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDisposition {
    /// Next version in sequence: apply it
    Apply,
    /// Already acknowledged: drop it
    Duplicate,
    /// One or more versions were missed: resync with a full fetch
    Gap,
}

pub fn classify_push(last_acked: u64, version: u64) -> PushDisposition {
    if version <= last_acked {
        PushDisposition::Duplicate
    } else if version == last_acked + 1 {
        PushDisposition::Apply
    } else {
        PushDisposition::Gap
    }
}

/// Outcome of comparing a fetched twin against the local watermark
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Nothing new on the desired side
    UpToDate,
    /// The twin moved ahead; deliver its full desired section once
    Advanced { version: u64, desired: Properties },
    /// The twin is behind the watermark; adopt the twin's version silently
    Regressed { version: u64 },
}

pub fn reconcile(last_acked: u64, twin: &Twin) -> Reconciliation {
    if twin.desired_version > last_acked {
        Reconciliation::Advanced {
            version: twin.desired_version,
            desired: twin.desired.clone(),
        }
    } else if twin.desired_version < last_acked {
        Reconciliation::Regressed {
            version: twin.desired_version,
        }
    } else {
        Reconciliation::UpToDate
    }
}
