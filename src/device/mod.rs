//! Device-side sync
//!
//! Provides:
//! - `DeviceClient`: report, fetch and desired-callback API for one device
//! - The sync protocol state machine and push/resync reconciliation
//! - Reconnect recovery with capped exponential backoff
//! - The `TwinTransport` seam and an in-process transport with fault injection

pub mod dispatch;
pub mod protocol;
pub mod recovery;
pub mod session;
pub mod transport;

pub use dispatch::{DesiredCallback, DesiredUpdate, UpdateOrigin};
pub use protocol::SyncState;
pub use recovery::{RecoveryController, RetryPolicy};
pub use session::{DeviceClient, DeviceClientBuilder, ReportAck};
pub use transport::{Fault, FaultKind, InProcessTransport, PushStream, TwinTransport};
