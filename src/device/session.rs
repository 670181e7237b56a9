//! Device session
//!
//! The device-facing client. A session owns:
//! - a cached copy of the twin plus the last acknowledged desired version
//! - a FIFO of reported patches not yet accepted by the service
//! - the push pump for the current link and the recovery task
//!
//! Reported patches submitted while the link is down are queued and
//! replayed in submission order once the session is `Synced` again. Every
//! (re)connect subscribes to pushes first and then fetches the full twin,
//! so nothing changed in between is missed; duplicates are dropped by
//! version.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::dispatch::{self, CallbackDispatcher, DesiredCallback, DesiredUpdate, UpdateOrigin};
use super::protocol::{self, ProtocolState, PushDisposition, Reconciliation, SyncState};
use super::recovery::{bounded, RecoveryController, RetryPolicy};
use super::transport::{PushStream, TwinTransport};
use crate::config::SyncConfig;
use crate::db::{MemorySessionStore, SessionStateStore};
use crate::error::{Result, TwinError};
use crate::twin::{merge, DesiredPush, Patch, Properties, Section, Twin};

/// Acknowledgement for a reported patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum ReportAck {
    /// Accepted by the service at this reported version
    Delivered { version: u64 },
    /// Held for replay; `pending` counts queued patches including this one
    Queued { pending: usize },
}

struct PendingReport {
    seq: u64,
    patch: Patch,
}

#[derive(Default)]
struct LocalTwin {
    last_acked: u64,
    desired: Properties,
    reported: Properties,
    reported_version: u64,
}

struct Link {
    stream_id: Uuid,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct Drain {
    delivered: Vec<(u64, u64)>,
    rejected: Vec<(u64, TwinError)>,
    interrupted: Option<TwinError>,
}

// ============================================================================
// Builder
// ============================================================================

/// Configures and opens a `DeviceClient`
pub struct DeviceClientBuilder<T: TwinTransport> {
    device_id: String,
    transport: Arc<T>,
    config: SyncConfig,
    state_store: Option<Arc<dyn SessionStateStore>>,
    callback: Option<DesiredCallback>,
}

impl<T: TwinTransport> DeviceClientBuilder<T> {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Durable watermark storage. Defaults to process memory.
    pub fn state_store(mut self, store: Arc<dyn SessionStateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Handler installed before the first fetch, so a resumed session sees
    /// desired changes made while it was away.
    pub fn on_desired_properties<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(DesiredUpdate) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callback = Some(dispatch::callback(f));
        self
    }

    /// Connect, fetch the twin and start receiving pushes
    pub async fn open(self) -> Result<DeviceClient<T>> {
        let state_store = self
            .state_store
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));

        let resumed = state_store.load(&self.device_id).await?;
        let last_acked = resumed
            .as_ref()
            .map(|r| r.last_acked_desired_version)
            .unwrap_or(0);

        let dispatcher = CallbackDispatcher::spawn(&self.device_id, self.config.callback_capacity);
        if let Some(callback) = self.callback {
            dispatcher.set_handler(callback);
        }

        let session = Arc::new(Session {
            session_id: Uuid::new_v4(),
            policy: RetryPolicy::from(&self.config.retry),
            device_id: self.device_id,
            transport: self.transport,
            config: self.config,
            protocol: ProtocolState::new(),
            local: Mutex::new(LocalTwin {
                last_acked,
                ..Default::default()
            }),
            outbound: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            dispatcher,
            state_store,
            cancel: CancellationToken::new(),
            link: parking_lot::Mutex::new(None),
            fatal: parking_lot::Mutex::new(None),
        });

        tracing::info!(
            device_id = %session.device_id,
            session_id = %session.session_id,
            resumed = resumed.is_some(),
            last_acked,
            "Opening device session"
        );

        session.protocol.transition(&session.device_id, SyncState::Connecting)?;

        let controller = RecoveryController::new(
            &session.device_id,
            session.policy.clone(),
            session.cancel.clone(),
        );
        let established = controller.run(|_| session.establish()).await;

        let outcome = match established {
            Ok((stream, twin)) => session.complete_sync(stream, twin).await,
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            tracing::warn!(device_id = %session.device_id, error = %e, "Failed to open session");
            session.cancel.cancel();
            let _ = session.protocol.transition(&session.device_id, SyncState::Closed);
            session.stop_link().await;
            return Err(e);
        }

        if let Some(timeout) = session.config.session_timeout() {
            tokio::spawn(run_watchdog(
                Arc::downgrade(&session),
                session.protocol.subscribe(),
                session.cancel.clone(),
                timeout,
            ));
        }

        Ok(DeviceClient { inner: session })
    }
}

// ============================================================================
// Client
// ============================================================================

/// Device-side handle to a twin session. Dropping it without `close`
/// stops background work but skips the final flush.
pub struct DeviceClient<T: TwinTransport> {
    inner: Arc<Session<T>>,
}

impl<T: TwinTransport> DeviceClient<T> {
    pub fn builder(device_id: impl Into<String>, transport: Arc<T>) -> DeviceClientBuilder<T> {
        DeviceClientBuilder {
            device_id: device_id.into(),
            transport,
            config: SyncConfig::default(),
            state_store: None,
            callback: None,
        }
    }

    /// Open with default in-memory session state
    pub async fn open(
        device_id: impl Into<String>,
        transport: Arc<T>,
        config: SyncConfig,
    ) -> Result<Self> {
        Self::builder(device_id, transport).config(config).open().await
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    /// Send a reported patch, or queue it for replay if the link is down
    pub async fn report_properties(&self, patch: Patch) -> Result<ReportAck> {
        self.inner.report_properties(patch).await
    }

    /// Full twin fetch; waits a bounded time for an in-progress resync
    pub async fn get_twin(&self) -> Result<Twin> {
        self.inner.get_twin().await
    }

    /// Install or replace the desired-property handler
    pub fn register_desired_property_callback<F, Fut>(&self, f: F)
    where
        F: Fn(DesiredUpdate) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.dispatcher.set_handler(dispatch::callback(f));
    }

    /// Feed a desired push into the session, as the push pump does
    pub async fn on_desired_push(&self, push: DesiredPush) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.on_desired_push(push).await
    }

    pub fn status(&self) -> SyncState {
        self.inner.protocol.current()
    }

    /// Connection status notifications
    pub fn status_changes(&self) -> watch::Receiver<SyncState> {
        self.inner.protocol.subscribe()
    }

    pub async fn pending_reports(&self) -> usize {
        self.inner.outbound.lock().await.len()
    }

    pub async fn last_acked_desired_version(&self) -> u64 {
        self.inner.local.lock().await.last_acked
    }

    pub async fn cached_desired(&self) -> Properties {
        self.inner.local.lock().await.desired.clone()
    }

    pub async fn cached_reported(&self) -> Properties {
        self.inner.local.lock().await.reported.clone()
    }

    /// Flush queued reports best-effort and tear the session down.
    /// In-flight operations fail with `Cancelled`; a report interrupted
    /// this way is dropped, not flushed, and may or may not have landed.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl<T: TwinTransport> Drop for DeviceClient<T> {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        self.inner.dispatcher.close();
    }
}

// ============================================================================
// Session internals
// ============================================================================

struct Session<T: TwinTransport> {
    session_id: Uuid,
    device_id: String,
    transport: Arc<T>,
    config: SyncConfig,
    policy: RetryPolicy,
    protocol: ProtocolState,
    local: Mutex<LocalTwin>,
    outbound: Mutex<VecDeque<PendingReport>>,
    next_seq: AtomicU64,
    dispatcher: CallbackDispatcher,
    state_store: Arc<dyn SessionStateStore>,
    cancel: CancellationToken,
    link: parking_lot::Mutex<Option<Link>>,
    fatal: parking_lot::Mutex<Option<String>>,
}

impl<T: TwinTransport> Session<T> {
    async fn call<R, F>(&self, call: F) -> Result<R>
    where
        F: Future<Output = Result<R>>,
    {
        bounded(self.config.operation_timeout(), &self.cancel, call).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.cancel.is_cancelled() || self.protocol.current() == SyncState::Closed {
            return Err(TwinError::Cancelled);
        }
        if let Some(reason) = self.fatal.lock().clone() {
            return Err(TwinError::ConnectionLost(reason));
        }
        Ok(())
    }

    async fn persist_watermark(&self, version: u64) {
        if let Err(e) = self.state_store.save(&self.device_id, version).await {
            tracing::warn!(
                device_id = %self.device_id,
                version,
                error = %e,
                "Failed to persist desired watermark"
            );
        }
    }

    // ------------------------------------------------------------------------
    // Link management
    // ------------------------------------------------------------------------

    /// Subscribe to pushes, then fetch the full twin
    async fn establish(&self) -> Result<(PushStream, Twin)> {
        let stream = self
            .call(self.transport.connect(&self.device_id, self.config.push_capacity))
            .await?;

        match self.call(self.transport.get_twin(&self.device_id)).await {
            Ok(twin) => Ok((stream, twin)),
            Err(e) => {
                self.transport.disconnect(&self.device_id, stream.id).await;
                Err(e)
            }
        }
    }

    /// Reconcile against the fetched twin, enter `Synced`, start the pump
    /// and replay anything queued while the link was down. The pump starts
    /// after the transition so a stream that is already closed is seen as
    /// a fault of a synced session and recovered.
    async fn complete_sync(self: &Arc<Self>, stream: PushStream, twin: Twin) -> Result<()> {
        let stream_id = stream.id;
        if let Err(e) = self.reconcile(&twin, true).await {
            self.transport.disconnect(&self.device_id, stream_id).await;
            return Err(e);
        }

        let from = match self.protocol.current() {
            SyncState::Reconnecting => SyncState::Reconnecting,
            _ => SyncState::Connecting,
        };
        if !self
            .protocol
            .transition_from(&self.device_id, from, SyncState::Synced)
        {
            self.transport.disconnect(&self.device_id, stream_id).await;
            return Err(TwinError::Cancelled);
        }

        self.start_pump(stream).await;

        tracing::info!(
            device_id = %self.device_id,
            desired_version = twin.desired_version,
            reported_version = twin.reported_version,
            "Twin synced"
        );

        self.replay().await;
        Ok(())
    }

    async fn start_pump(self: &Arc<Self>, stream: PushStream) {
        let stream_id = stream.id;
        let pump = tokio::spawn(run_pump(
            Arc::downgrade(self),
            stream,
            self.cancel.clone(),
        ));

        let previous = self.link.lock().replace(Link { stream_id, pump });
        if let Some(previous) = previous {
            previous.pump.abort();
            self.transport.disconnect(&self.device_id, previous.stream_id).await;
        }
    }

    async fn stop_link(&self) {
        let link = self.link.lock().take();
        if let Some(link) = link {
            link.pump.abort();
            self.transport.disconnect(&self.device_id, link.stream_id).await;
        }
    }

    /// Start recovery if the session was synced; later faults while a
    /// recovery is already running are ignored.
    fn handle_fault(self: &Arc<Self>, reason: &str) {
        if self.cancel.is_cancelled() {
            return;
        }

        if self
            .protocol
            .transition_from(&self.device_id, SyncState::Synced, SyncState::Disconnected)
        {
            tracing::warn!(device_id = %self.device_id, reason = %reason, "Transport fault, starting recovery");
            let session = Arc::clone(self);
            tokio::spawn(async move { session.recover().await });
        } else {
            tracing::debug!(device_id = %self.device_id, reason = %reason, "Fault ignored, session not synced");
        }
    }

    async fn recover(self: Arc<Self>) {
        self.stop_link().await;

        if self
            .protocol
            .transition(&self.device_id, SyncState::Reconnecting)
            .is_err()
        {
            return;
        }

        let controller =
            RecoveryController::new(&self.device_id, self.policy.clone(), self.cancel.clone());
        let outcome = match controller.run(|_| self.establish()).await {
            Ok((stream, twin)) => self.complete_sync(stream, twin).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                tracing::info!(device_id = %self.device_id, "Session recovered");
            }
            Err(TwinError::Cancelled) => {
                tracing::debug!(device_id = %self.device_id, "Recovery cancelled");
            }
            Err(e) => {
                tracing::error!(device_id = %self.device_id, error = %e, "Session recovery failed");
                *self.fatal.lock() = Some(e.to_string());
                let _ = self
                    .protocol
                    .transition(&self.device_id, SyncState::Disconnected);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Desired side
    // ------------------------------------------------------------------------

    /// Fold a fetched twin into the local copy. `adopt_regression` is only
    /// set on (re)connect; a live resync treats a twin behind the watermark
    /// as a stale read, since a push may have landed while it was in flight.
    async fn reconcile(&self, twin: &Twin, adopt_regression: bool) -> Result<()> {
        let mut local = self.local.lock().await;
        if adopt_regression || twin.reported_version >= local.reported_version {
            local.reported = twin.reported.clone();
            local.reported_version = twin.reported_version;
        }

        match protocol::reconcile(local.last_acked, twin) {
            Reconciliation::UpToDate => {
                local.desired = twin.desired.clone();
                Ok(())
            }
            Reconciliation::Advanced { version, desired } => {
                tracing::info!(
                    device_id = %self.device_id,
                    from = local.last_acked,
                    to = version,
                    "Desired state advanced while away"
                );
                local.desired = desired.clone();
                local.last_acked = version;
                self.persist_watermark(version).await;
                self.dispatcher
                    .enqueue(DesiredUpdate {
                        version,
                        properties: desired,
                        origin: UpdateOrigin::Resync,
                    })
                    .await
            }
            Reconciliation::Regressed { version } if !adopt_regression => {
                tracing::debug!(
                    device_id = %self.device_id,
                    watermark = local.last_acked,
                    twin_version = version,
                    "Fetched twin older than watermark, keeping local state"
                );
                Ok(())
            }
            Reconciliation::Regressed { version } => {
                tracing::warn!(
                    device_id = %self.device_id,
                    watermark = local.last_acked,
                    twin_version = version,
                    "Twin desired version behind watermark, adopting twin"
                );
                local.desired = twin.desired.clone();
                local.last_acked = version;
                self.persist_watermark(version).await;
                Ok(())
            }
        }
    }

    async fn on_desired_push(&self, push: DesiredPush) -> Result<()> {
        let mut local = self.local.lock().await;

        match protocol::classify_push(local.last_acked, push.version) {
            PushDisposition::Duplicate => {
                tracing::debug!(
                    device_id = %self.device_id,
                    version = push.version,
                    last_acked = local.last_acked,
                    "Dropping duplicate desired push"
                );
                Ok(())
            }
            PushDisposition::Apply => {
                merge::merge_into(&mut local.desired, &push.patch);
                local.last_acked = push.version;
                self.persist_watermark(push.version).await;
                self.dispatcher
                    .enqueue(DesiredUpdate {
                        version: push.version,
                        properties: push.patch,
                        origin: UpdateOrigin::Push,
                    })
                    .await
            }
            PushDisposition::Gap => {
                tracing::warn!(
                    device_id = %self.device_id,
                    version = push.version,
                    last_acked = local.last_acked,
                    "Gap in desired pushes, resyncing"
                );
                drop(local);
                let twin = self.call(self.transport.get_twin(&self.device_id)).await?;
                self.reconcile(&twin, false).await
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reported side
    // ------------------------------------------------------------------------

    async fn report_properties(self: &Arc<Self>, patch: Patch) -> Result<ReportAck> {
        patch.expect_section(Section::Reported)?;
        self.ensure_open()?;

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut outbound = self.outbound.lock().await;
        outbound.push_back(PendingReport { seq, patch });

        if !self.protocol.current().is_synced() {
            tracing::debug!(
                device_id = %self.device_id,
                pending = outbound.len(),
                "Link down, queued reported patch"
            );
            return Ok(ReportAck::Queued {
                pending: outbound.len(),
            });
        }

        let drain = self.drain(&mut outbound).await;

        if let Some((_, version)) = drain.delivered.iter().find(|(s, _)| *s == seq) {
            return Ok(ReportAck::Delivered { version: *version });
        }
        if let Some((_, e)) = drain.rejected.into_iter().find(|(s, _)| *s == seq) {
            return Err(e);
        }
        match drain.interrupted {
            Some(TwinError::Cancelled) => Err(TwinError::Cancelled),
            _ => Ok(ReportAck::Queued {
                pending: outbound.len(),
            }),
        }
    }

    /// Deliver queued patches front to back until the queue is empty or a
    /// transport fault stops delivery. Callers hold the outbound lock.
    async fn drain(self: &Arc<Self>, queue: &mut VecDeque<PendingReport>) -> Drain {
        let mut drain = Drain::default();

        while let Some(front) = queue.front() {
            let result = self
                .call(self.transport.patch_reported(&self.device_id, &front.patch))
                .await;

            match result {
                Ok(version) => {
                    if let Some(report) = queue.pop_front() {
                        self.record_delivery(&report.patch, version).await;
                        drain.delivered.push((report.seq, version));
                    }
                }
                Err(TwinError::Cancelled) => {
                    // Outcome unknown; not flushed again on close
                    if let Some(report) = queue.pop_front() {
                        tracing::warn!(
                            device_id = %self.device_id,
                            seq = report.seq,
                            "Reported patch abandoned by close"
                        );
                    }
                    drain.interrupted = Some(TwinError::Cancelled);
                    break;
                }
                Err(e) if e.is_retryable() => {
                    self.handle_fault(&e.to_string());
                    drain.interrupted = Some(e);
                    break;
                }
                Err(e) => {
                    if let Some(report) = queue.pop_front() {
                        tracing::error!(
                            device_id = %self.device_id,
                            error = %e,
                            "Reported patch rejected, discarding"
                        );
                        drain.rejected.push((report.seq, e));
                    }
                }
            }
        }

        drain
    }

    async fn record_delivery(&self, patch: &Patch, version: u64) {
        let mut local = self.local.lock().await;
        merge::merge_into(&mut local.reported, &patch.entries);
        local.reported_version = local.reported_version.max(version);
    }

    async fn replay(self: &Arc<Self>) {
        let mut outbound = self.outbound.lock().await;
        if outbound.is_empty() {
            return;
        }

        tracing::info!(
            device_id = %self.device_id,
            pending = outbound.len(),
            "Replaying queued reported patches"
        );

        let drain = self.drain(&mut outbound).await;
        for (_, e) in drain.rejected {
            tracing::warn!(device_id = %self.device_id, error = %e, "Queued patch rejected on replay");
        }
        tracing::debug!(
            device_id = %self.device_id,
            delivered = drain.delivered.len(),
            remaining = outbound.len(),
            "Replay finished"
        );
    }

    // ------------------------------------------------------------------------
    // Fetch and close
    // ------------------------------------------------------------------------

    async fn get_twin(self: &Arc<Self>) -> Result<Twin> {
        self.ensure_open()?;
        let mut last_error = None;

        for _ in 0..=self.policy.max_retries {
            self.wait_until_synced().await?;

            match self.call(self.transport.get_twin(&self.device_id)).await {
                Ok(twin) => {
                    let mut local = self.local.lock().await;
                    if twin.reported_version >= local.reported_version {
                        local.reported = twin.reported.clone();
                        local.reported_version = twin.reported_version;
                    }
                    return Ok(twin);
                }
                Err(e) if e.is_retryable() => {
                    self.handle_fault(&e.to_string());
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| TwinError::ConnectionLost("twin fetch failed".into())))
    }

    async fn wait_until_synced(&self) -> Result<()> {
        let mut rx = self.protocol.subscribe();
        let timeout = self.config.operation_timeout();
        let fatal = &self.fatal;

        let waited = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TwinError::Cancelled),
            waited = tokio::time::timeout(timeout, async {
                rx.wait_for(|state| {
                    matches!(state, SyncState::Synced | SyncState::Closed) || fatal.lock().is_some()
                })
                .await
                .map(|state| *state)
            }) => waited,
        };

        match waited {
            Err(_) => Err(TwinError::Timeout(timeout.as_millis() as u64)),
            Ok(Err(_)) | Ok(Ok(SyncState::Closed)) => Err(TwinError::Cancelled),
            Ok(Ok(SyncState::Synced)) => Ok(()),
            Ok(Ok(_)) => {
                let reason = self
                    .fatal
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "session not synced".to_string());
                Err(TwinError::ConnectionLost(reason))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let previous = match self.protocol.transition(&self.device_id, SyncState::Closed) {
            Ok(previous) => previous,
            Err(_) => return Ok(()),
        };

        tracing::info!(
            device_id = %self.device_id,
            session_id = %self.session_id,
            "Closing device session"
        );
        self.cancel.cancel();

        if previous.is_synced() {
            self.flush_on_close().await;
        } else {
            self.discard_queue("Closing while disconnected").await;
        }

        self.release().await;
        self.dispatcher.shutdown().await;

        tracing::info!(device_id = %self.device_id, "Device session closed");
        Ok(())
    }

    /// Tear down a session that stayed off `Synced` past the session timeout
    async fn expire(&self) {
        if self
            .protocol
            .transition(&self.device_id, SyncState::Closed)
            .is_err()
        {
            return;
        }

        tracing::warn!(
            device_id = %self.device_id,
            session_id = %self.session_id,
            timeout_ms = self.config.session_timeout_ms,
            "Session timed out while disconnected"
        );
        self.cancel.cancel();
        self.discard_queue("Session timed out").await;
        self.release().await;
        self.dispatcher.close();
    }

    async fn discard_queue(&self, reason: &str) {
        let mut outbound = self.outbound.lock().await;
        if !outbound.is_empty() {
            tracing::warn!(
                device_id = %self.device_id,
                dropped = outbound.len(),
                reason = %reason,
                "Discarding queued reported patches"
            );
            outbound.clear();
        }
    }

    async fn release(&self) {
        self.stop_link().await;
        let watermark = self.local.lock().await.last_acked;
        self.persist_watermark(watermark).await;
    }

    /// Best-effort delivery of queued patches, each bounded by the
    /// operation timeout and no longer tied to the cancelled session.
    async fn flush_on_close(&self) {
        let mut outbound = self.outbound.lock().await;
        let timeout = self.config.operation_timeout();

        while let Some(front) = outbound.front() {
            let result = tokio::time::timeout(
                timeout,
                self.transport.patch_reported(&self.device_id, &front.patch),
            )
            .await;

            match result {
                Ok(Ok(version)) => {
                    tracing::debug!(device_id = %self.device_id, version, "Flushed reported patch");
                    outbound.pop_front();
                }
                Ok(Err(e)) => {
                    tracing::warn!(device_id = %self.device_id, error = %e, "Flush on close failed");
                    break;
                }
                Err(_) => {
                    tracing::warn!(device_id = %self.device_id, "Flush on close timed out");
                    break;
                }
            }
        }

        if !outbound.is_empty() {
            tracing::warn!(
                device_id = %self.device_id,
                dropped = outbound.len(),
                "Discarding undelivered reported patches"
            );
            outbound.clear();
        }
    }
}

/// Close the session once it has been off `Synced` for `timeout`.
/// Each return to `Synced` restarts the clock.
async fn run_watchdog<T: TwinTransport>(
    session: Weak<Session<T>>,
    mut status: watch::Receiver<SyncState>,
    cancel: CancellationToken,
    timeout: Duration,
) {
    loop {
        let lost = tokio::select! {
            _ = cancel.cancelled() => return,
            lost = async {
                status
                    .wait_for(|s| !s.is_synced())
                    .await
                    .map(|s| *s)
            } => lost,
        };
        if !matches!(lost, Ok(SyncState::Disconnected | SyncState::Reconnecting)) {
            return;
        }

        let restored = tokio::select! {
            _ = cancel.cancelled() => return,
            restored = tokio::time::timeout(timeout, async {
                status
                    .wait_for(|s| matches!(s, SyncState::Synced | SyncState::Closed))
                    .await
                    .map(|s| *s)
            }) => restored,
        };

        match restored {
            Ok(Ok(SyncState::Synced)) => continue,
            Ok(_) => return,
            Err(_) => {
                if let Some(session) = session.upgrade() {
                    session.expire().await;
                }
                return;
            }
        }
    }
}

/// Feed pushes from one link into the session until the stream ends or
/// the session goes away. A closed stream is a transport fault.
async fn run_pump<T: TwinTransport>(
    session: Weak<Session<T>>,
    mut stream: PushStream,
    cancel: CancellationToken,
) {
    loop {
        let push = tokio::select! {
            _ = cancel.cancelled() => return,
            push = stream.next() => push,
        };

        let Some(session) = session.upgrade() else {
            return;
        };

        match push {
            Some(push) => match session.on_desired_push(push).await {
                Ok(()) => {}
                Err(TwinError::Cancelled) => return,
                Err(e) => {
                    session.handle_fault(&e.to_string());
                    return;
                }
            },
            None => {
                session.handle_fault("push stream closed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::device::transport::{Fault, InProcessTransport};
    use crate::twin::{ExpectedVersion, TwinStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    fn fast_config() -> SyncConfig {
        SyncConfig {
            push_capacity: 16,
            callback_capacity: 16,
            operation_timeout_ms: 500,
            session_timeout_ms: 60_000,
            retry: RetryConfig {
                initial_delay_ms: 5,
                max_delay_ms: 20,
                multiplier: 2,
                max_retries: 50,
            },
        }
    }

    async fn setup(device: &str) -> (TwinStore, Arc<InProcessTransport>) {
        let store = TwinStore::new();
        store.register_device(device).await.unwrap();
        let transport = Arc::new(InProcessTransport::new(store.clone()));
        (store, transport)
    }

    /// Hands out an already-closed push stream on the first connect
    struct ClosedFirstStream {
        inner: Arc<InProcessTransport>,
        handed_out: AtomicBool,
    }

    #[async_trait]
    impl TwinTransport for ClosedFirstStream {
        async fn connect(&self, device_id: &str, push_capacity: usize) -> Result<PushStream> {
            if !self.handed_out.swap(true, Ordering::SeqCst) {
                let (_tx, rx) = mpsc::channel(1);
                return Ok(PushStream::new(Uuid::new_v4(), rx));
            }
            self.inner.connect(device_id, push_capacity).await
        }

        async fn get_twin(&self, device_id: &str) -> Result<Twin> {
            self.inner.get_twin(device_id).await
        }

        async fn patch_reported(&self, device_id: &str, patch: &Patch) -> Result<u64> {
            self.inner.patch_reported(device_id, patch).await
        }

        async fn disconnect(&self, device_id: &str, stream: Uuid) {
            self.inner.disconnect(device_id, stream).await
        }
    }

    /// Snapshots the twin when asked but answers only after `delay`
    struct SlowFetch {
        inner: Arc<InProcessTransport>,
        delay: Duration,
    }

    #[async_trait]
    impl TwinTransport for SlowFetch {
        async fn connect(&self, device_id: &str, push_capacity: usize) -> Result<PushStream> {
            self.inner.connect(device_id, push_capacity).await
        }

        async fn get_twin(&self, device_id: &str) -> Result<Twin> {
            let twin = self.inner.get_twin(device_id).await;
            tokio::time::sleep(self.delay).await;
            twin
        }

        async fn patch_reported(&self, device_id: &str, patch: &Patch) -> Result<u64> {
            self.inner.patch_reported(device_id, patch).await
        }

        async fn disconnect(&self, device_id: &str, stream: Uuid) {
            self.inner.disconnect(device_id, stream).await
        }
    }

    fn push(version: u64, key: &str, value: &str) -> DesiredPush {
        let mut patch = Properties::new();
        patch.insert(key.into(), json!(value));
        DesiredPush { version, patch }
    }

    async fn wait_for_state(client: &DeviceClient<InProcessTransport>, target: SyncState) {
        let mut rx = client.status_changes();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == target))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_unknown_device_fails() {
        let store = TwinStore::new();
        let transport = Arc::new(InProcessTransport::new(store));
        let err = DeviceClient::open("ghost", transport, fast_config())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TwinError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_report_and_get_back() {
        let (_store, transport) = setup("dev").await;
        let client = DeviceClient::open("dev", transport, fast_config()).await.unwrap();
        assert_eq!(client.status(), SyncState::Synced);

        let ack = client
            .report_properties(Patch::reported().set("temp", "21"))
            .await
            .unwrap();
        assert_eq!(ack, ReportAck::Delivered { version: 1 });

        let twin = client.get_twin().await.unwrap();
        assert_eq!(twin.reported["temp"], json!("21"));
        assert_eq!(client.cached_reported().await["temp"], json!("21"));

        client.close().await.unwrap();
        assert_eq!(client.status(), SyncState::Closed);
    }

    #[tokio::test]
    async fn test_desired_patch_rejected_on_report() {
        let (_store, transport) = setup("dev").await;
        let client = DeviceClient::open("dev", transport, fast_config()).await.unwrap();

        let err = client
            .report_properties(Patch::desired().set("x", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TwinError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_duplicate_push_fires_callback_once() {
        let (store, transport) = setup("dev").await;
        let client = DeviceClient::open("dev", transport, fast_config()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.register_desired_property_callback(move |update| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(update);
            }
        });

        store
            .apply_desired_patch("dev", &Patch::desired().set("target", "on"), ExpectedVersion::Any)
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.origin, UpdateOrigin::Push);

        let mut replay = Properties::new();
        replay.insert("target".into(), json!("on"));
        client
            .on_desired_push(DesiredPush {
                version: 1,
                patch: replay,
            })
            .await
            .unwrap();

        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());
        assert_eq!(client.last_acked_desired_version().await, 1);
    }

    #[tokio::test]
    async fn test_push_gap_triggers_resync() {
        let (store, transport) = setup("dev").await;
        let client = DeviceClient::open("dev", transport, fast_config()).await.unwrap();

        for value in ["a", "b", "c"] {
            store
                .apply_desired_patch("dev", &Patch::desired().set("mode", value), ExpectedVersion::Any)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.last_acked_desired_version().await, 3);

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.register_desired_property_callback(move |update| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(update);
            }
        });

        store
            .apply_desired_patch("dev", &Patch::desired().set("mode", "d"), ExpectedVersion::Any)
            .await
            .unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;

        // Version 9 while the session is at 4
        let mut patch = Properties::new();
        patch.insert("mode".into(), json!("zzz"));
        client
            .on_desired_push(DesiredPush { version: 9, patch })
            .await
            .unwrap();

        // The gap resolved through a full fetch, not the pushed content
        assert_eq!(client.last_acked_desired_version().await, 4);
        assert_eq!(client.cached_desired().await["mode"], json!("d"));
    }

    #[tokio::test]
    async fn test_reports_queue_during_fault_and_replay_in_order() {
        let (store, transport) = setup("dev").await;
        let client = DeviceClient::open("dev", transport.clone(), fast_config())
            .await
            .unwrap();

        transport
            .inject_fault("dev", Fault::tcp("boom", Duration::from_millis(150)))
            .await;

        for n in 1..=3 {
            let ack = client
                .report_properties(Patch::reported().set("seq", n).set(format!("k{}", n), n))
                .await
                .unwrap();
            assert!(matches!(ack, ReportAck::Queued { .. }));
        }
        assert_eq!(client.pending_reports().await, 3);

        wait_for_state(&client, SyncState::Synced).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(client.pending_reports().await, 0);
        let twin = store.get_twin("dev").await.unwrap();
        assert_eq!(twin.reported_version, 3);
        assert_eq!(twin.reported["seq"], json!(3));
        assert_eq!(twin.reported["k1"], json!(1));
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_connection_lost() {
        let (_store, transport) = setup("dev").await;
        let mut config = fast_config();
        config.retry.max_retries = 2;
        let client = DeviceClient::open("dev", transport.clone(), config).await.unwrap();

        transport
            .inject_fault("dev", Fault::tcp("cable cut", Duration::from_secs(60)))
            .await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            match client.report_properties(Patch::reported().set("x", 1)).await {
                Err(TwinError::ConnectionLost(_)) => break,
                Ok(_) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
            assert!(tokio::time::Instant::now() < deadline, "never gave up");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(client.status(), SyncState::Disconnected);
        assert!(matches!(
            client.get_twin().await.unwrap_err(),
            TwinError::ConnectionLost(_)
        ));
    }

    #[tokio::test]
    async fn test_close_aborts_backoff() {
        let (_store, transport) = setup("dev").await;
        let mut config = fast_config();
        config.retry.initial_delay_ms = 3_600_000;
        config.retry.max_delay_ms = 3_600_000;
        let client = DeviceClient::open("dev", transport.clone(), config).await.unwrap();

        transport
            .inject_fault("dev", Fault::tcp("boom", Duration::from_secs(60)))
            .await;
        wait_for_state(&client, SyncState::Reconnecting).await;

        tokio::time::timeout(Duration::from_secs(1), client.close())
            .await
            .expect("close should not wait for backoff")
            .unwrap();

        assert!(matches!(
            client.report_properties(Patch::reported().set("x", 1)).await.unwrap_err(),
            TwinError::Cancelled
        ));
    }

    #[tokio::test]
    async fn test_close_cancels_in_flight_report() {
        let (store, transport) = setup("dev").await;
        let mut config = fast_config();
        config.operation_timeout_ms = 300;
        let client = Arc::new(
            DeviceClient::open("dev", transport.clone(), config).await.unwrap(),
        );

        // Short enough that a flush on close would get through
        transport
            .inject_fault("dev", Fault::timeout("stall", Duration::from_millis(100)))
            .await;

        let reporter = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .report_properties(Patch::reported().set("x", 1))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        client.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), reporter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result.unwrap_err(), TwinError::Cancelled));

        // The cancelled patch was dropped, not flushed behind the caller's back
        tokio::time::sleep(Duration::from_millis(150)).await;
        let twin = store.get_twin("dev").await.unwrap();
        assert_eq!(twin.reported_version, 0);
        assert!(twin.reported.is_empty());
        assert_eq!(client.pending_reports().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_closed_stream_during_open_recovers() {
        for _ in 0..20 {
            let (store, inner) = setup("dev").await;
            let transport = Arc::new(ClosedFirstStream {
                inner,
                handed_out: AtomicBool::new(false),
            });
            let client = DeviceClient::open("dev", transport, fast_config())
                .await
                .unwrap();

            tokio::time::timeout(Duration::from_secs(2), async {
                while !(client.status() == SyncState::Synced
                    && store.connected_sessions("dev").await == 1)
                {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("session stayed without a push stream");

            store
                .apply_desired_patch("dev", &Patch::desired().set("target", "on"), ExpectedVersion::Any)
                .await
                .unwrap();
            tokio::time::timeout(Duration::from_secs(2), async {
                while client.last_acked_desired_version().await < 1 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("desired push never arrived");

            client.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_stale_gap_fetch_keeps_newer_watermark() {
        let (store, inner) = setup("dev").await;
        let transport = Arc::new(SlowFetch {
            inner,
            delay: Duration::from_millis(100),
        });
        let client = Arc::new(
            DeviceClient::open("dev", transport, fast_config())
                .await
                .unwrap(),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.register_desired_property_callback(move |update| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(update.version);
            }
        });

        store
            .apply_desired_patch("dev", &Patch::desired().set("m", "a"), ExpectedVersion::Any)
            .await
            .unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(1));

        // Gap fetch snapshots version 1, then version 2 lands while it is in flight
        let gap = {
            let client = client.clone();
            tokio::spawn(async move { client.on_desired_push(push(9, "m", "zzz")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .apply_desired_patch("dev", &Patch::desired().set("m", "b"), ExpectedVersion::Any)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), gap)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(client.last_acked_desired_version().await, 2);
        assert_eq!(client.cached_desired().await["m"], json!("b"));

        client.on_desired_push(push(2, "m", "b")).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(Some(version)) =
            tokio::time::timeout(Duration::from_millis(150), rx.recv()).await
        {
            seen.push(version);
        }
        assert_eq!(seen, vec![2]);
    }

    #[tokio::test]
    async fn test_session_times_out_while_disconnected() {
        let (_store, transport) = setup("dev").await;
        let mut config = fast_config();
        config.session_timeout_ms = 150;
        config.retry.initial_delay_ms = 60_000;
        config.retry.max_delay_ms = 60_000;
        let client = DeviceClient::open("dev", transport.clone(), config).await.unwrap();

        transport
            .inject_fault("dev", Fault::tcp("gone", Duration::from_secs(60)))
            .await;
        let ack = client
            .report_properties(Patch::reported().set("x", 1))
            .await
            .unwrap();
        assert!(matches!(ack, ReportAck::Queued { .. }));

        wait_for_state(&client, SyncState::Closed).await;

        assert_eq!(client.pending_reports().await, 0);
        assert!(matches!(
            client.report_properties(Patch::reported().set("x", 2)).await.unwrap_err(),
            TwinError::Cancelled
        ));
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_timeout_resets_on_resync() {
        let (_store, transport) = setup("dev").await;
        let mut config = fast_config();
        config.session_timeout_ms = 300;
        let client = DeviceClient::open("dev", transport.clone(), config).await.unwrap();

        for _ in 0..3 {
            transport
                .inject_fault("dev", Fault::tcp("blip", Duration::from_millis(100)))
                .await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            wait_for_state(&client, SyncState::Synced).await;
        }

        assert_eq!(client.status(), SyncState::Synced);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_watermark_persisted_across_sessions() {
        let (store, transport) = setup("dev").await;
        let state: Arc<dyn SessionStateStore> = Arc::new(MemorySessionStore::new());

        let client = DeviceClient::builder("dev", transport.clone())
            .config(fast_config())
            .state_store(state.clone())
            .open()
            .await
            .unwrap();
        store
            .apply_desired_patch("dev", &Patch::desired().set("target", "on"), ExpectedVersion::Any)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.close().await.unwrap();

        assert_eq!(
            state.load("dev").await.unwrap().unwrap().last_acked_desired_version,
            1
        );

        store
            .apply_desired_patch("dev", &Patch::desired().set("target", "off"), ExpectedVersion::Any)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let resumed = DeviceClient::builder("dev", transport)
            .config(fast_config())
            .state_store(state.clone())
            .on_desired_properties(move |update| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(update);
                }
            })
            .open()
            .await
            .unwrap();

        let update = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.version, 2);
        assert_eq!(update.origin, UpdateOrigin::Resync);
        assert_eq!(update.properties["target"], json!("off"));
        assert_eq!(resumed.last_acked_desired_version().await, 2);

        resumed.close().await.unwrap();
    }
}
