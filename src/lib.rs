//! Twin Sync
//!
//! Device twin synchronization: an authoritative per-device twin store on
//! the service side, and a device session that keeps a local copy in sync
//! across disconnects.
//!
//! ## Modules
//!
//! - `twin`: twin documents, the patch merge engine and the store
//! - `device`: device sessions, sync protocol and reconnect recovery
//! - `db`: durable session watermarks (SQLite)
//! - `routes`: HTTP surface of the service
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use twin_sync::{DeviceClient, InProcessTransport, Patch, SyncConfig, TwinStore};
//!
//! let store = TwinStore::new();
//! store.register_device("thermostat-1").await?;
//!
//! let transport = Arc::new(InProcessTransport::new(store.clone()));
//! let client = DeviceClient::builder("thermostat-1", transport)
//!     .config(SyncConfig::default())
//!     .on_desired_properties(|update| async move {
//!         println!("desired v{}: {:?}", update.version, update.properties);
//!     })
//!     .open()
//!     .await?;
//!
//! client.report_properties(Patch::reported().set("temp", "21")).await?;
//! client.close().await?;
//! ```

pub mod config;
pub mod db;
pub mod device;
pub mod error;
pub mod routes;
pub mod state;
pub mod twin;

pub use config::{Config, RetryConfig, SyncConfig};
pub use device::{
    DesiredUpdate, DeviceClient, Fault, InProcessTransport, ReportAck, SyncState, TwinTransport,
    UpdateOrigin,
};
pub use error::{Result, TwinError};
pub use twin::{DesiredPush, ExpectedVersion, Patch, Properties, Section, Twin, TwinStore};
