//! Desired-property callback dispatch
//!
//! Accepted desired changes are queued on a bounded channel in the order
//! the session acknowledged them. A consumer task drains the channel and
//! starts the registered handler for each update without waiting for the
//! previous invocation to finish, so a slow handler never stalls push
//! receipt.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, TwinError};
use crate::twin::Properties;

/// Where a desired update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateOrigin {
    /// A live push; `properties` is the patch
    Push,
    /// A full-fetch resync; `properties` is the whole desired section
    Resync,
}

/// Delivered to the desired-property callback, once per version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredUpdate {
    pub version: u64,
    pub properties: Properties,
    pub origin: UpdateOrigin,
}

/// Boxed desired-property handler
pub type DesiredCallback = Arc<dyn Fn(DesiredUpdate) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a `DesiredCallback`
pub fn callback<F, Fut>(f: F) -> DesiredCallback
where
    F: Fn(DesiredUpdate) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |update| Box::pin(f(update)))
}

type HandlerSlot = Arc<parking_lot::RwLock<Option<DesiredCallback>>>;

/// Per-session callback channel and its consumer task
pub struct CallbackDispatcher {
    tx: parking_lot::Mutex<Option<mpsc::Sender<DesiredUpdate>>>,
    handler: HandlerSlot,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CallbackDispatcher {
    pub fn spawn(device_id: &str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handler: HandlerSlot = Arc::new(parking_lot::RwLock::new(None));
        let task = tokio::spawn(consume(device_id.to_string(), rx, handler.clone()));

        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            handler,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Install or replace the handler. Updates queued before any handler
    /// is installed are dropped.
    pub fn set_handler(&self, handler: DesiredCallback) {
        *self.handler.write() = Some(handler);
    }

    /// Queue an update in acknowledgement order
    pub async fn enqueue(&self, update: DesiredUpdate) -> Result<()> {
        let tx = self.tx.lock().clone().ok_or(TwinError::Cancelled)?;
        tx.send(update).await.map_err(|_| TwinError::Cancelled)
    }

    /// Stop accepting updates; already queued ones are still delivered
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Close and wait for the consumer to drain
    pub async fn shutdown(&self) {
        self.close();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for CallbackDispatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn consume(device_id: String, mut rx: mpsc::Receiver<DesiredUpdate>, handler: HandlerSlot) {
    while let Some(update) = rx.recv().await {
        let current = handler.read().clone();
        match current {
            Some(handler) => {
                tracing::debug!(
                    device_id = %device_id,
                    version = update.version,
                    origin = ?update.origin,
                    "Dispatching desired update"
                );
                tokio::spawn(handler(update));
            }
            None => {
                tracing::debug!(
                    device_id = %device_id,
                    version = update.version,
                    "No desired callback registered, dropping update"
                );
            }
        }
    }
}
