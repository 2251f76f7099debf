//! Engine facade tying transports, frequency control, reconciliation and the
//! store together.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, NotificationFetcher};
use crate::config::{EngineConfig, TransportKind, create_client};
use crate::error::Result;
use crate::frequency::AdaptiveFrequencyController;
use crate::reconcile::ReconciliationEngine;
use crate::store::LocalNotificationStore;
use crate::transport::foreground::{ForegroundPollTransport, HostSignal};
use crate::transport::stream::StreamTransport;
use crate::transport::worker::WorkerPollTransport;
use crate::transport::{NotificationChannel, TransportEvent, TransportFault};
use crate::types::{ConnectionState, Notification};

const EVENT_CAPACITY: usize = 256;
const FAULT_CAPACITY: usize = 16;

/// The currently active transport strategy.
enum ActiveTransport {
    Worker(WorkerPollTransport),
    Stream(StreamTransport),
    Foreground(ForegroundPollTransport),
}

impl ActiveTransport {
    async fn start(&self, token: &str) -> Result<()> {
        match self {
            Self::Worker(t) => t.start(token).await,
            Self::Stream(t) => t.start(token).await,
            Self::Foreground(t) => t.start(token).await,
        }
    }

    async fn stop(&self) {
        match self {
            Self::Worker(t) => t.stop().await,
            Self::Stream(t) => t.stop().await,
            Self::Foreground(t) => t.stop().await,
        }
    }

    fn update_token(&self, token: &str) {
        match self {
            Self::Worker(t) => t.update_token(token),
            Self::Stream(t) => t.update_token(token),
            Self::Foreground(t) => t.update_token(token),
        }
    }

    async fn update_frequency(&self, interval: Duration) {
        match self {
            Self::Worker(t) => t.update_frequency(interval).await,
            Self::Stream(t) => t.update_frequency(interval).await,
            Self::Foreground(t) => t.update_frequency(interval).await,
        }
    }

    /// Returns whether the signal was consumed by the transport.
    fn host_signal(&self, signal: HostSignal) -> bool {
        match self {
            Self::Foreground(t) => {
                t.host_signal(signal);
                true
            }
            _ => false,
        }
    }
}

struct Active {
    transport: Arc<AsyncMutex<ActiveTransport>>,
    reconciler: Arc<ReconciliationEngine>,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

/// Notification synchronization engine.
///
/// One instance per session. `start(token)` activates a transport (with
/// fallback), routes its signals through the adaptive frequency controller
/// and the reconciliation engine, and keeps [`LocalNotificationStore`]
/// consistent. Consumers subscribe to the store's read-only views and to
/// [`NotificationEngine::faults`].
pub struct NotificationEngine {
    config: EngineConfig,
    api: Arc<ApiClient>,
    store: Arc<LocalNotificationStore>,
    controller: Arc<Mutex<AdaptiveFrequencyController>>,
    faults: broadcast::Sender<TransportFault>,
    active: AsyncMutex<Option<Active>>,
}

impl NotificationEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let client = create_client(&config)?;
        let api = Arc::new(ApiClient::new(client, &config.api_url)?);
        let controller = AdaptiveFrequencyController::new(
            config.baseline_interval,
            config.background_interval,
            config.max_interval,
            config.max_errors,
        );
        let (faults, _) = broadcast::channel(FAULT_CAPACITY);
        Ok(Self {
            config,
            api,
            store: Arc::new(LocalNotificationStore::new()),
            controller: Arc::new(Mutex::new(controller)),
            faults,
            active: AsyncMutex::new(None),
        })
    }

    // --- observable surface ---

    pub fn watch_notifications(&self) -> watch::Receiver<Vec<Notification>> {
        self.store.watch_notifications()
    }

    pub fn watch_unread_count(&self) -> watch::Receiver<u64> {
        self.store.watch_unread_count()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.store.watch_connection_state()
    }

    pub fn subscribe_new(&self) -> broadcast::Receiver<Notification> {
        self.store.subscribe_new()
    }

    /// Faults requiring a host decision: auth rejection, worker death,
    /// reconnect exhaustion.
    pub fn faults(&self) -> broadcast::Receiver<TransportFault> {
        self.faults.subscribe()
    }

    pub fn store(&self) -> &Arc<LocalNotificationStore> {
        &self.store
    }

    // --- lifecycle ---

    /// Activate the configured transport and begin synchronizing. A second
    /// call while running is a logged no-op.
    pub async fn start(&self, token: &str) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            info!("notification engine already started");
            return Ok(());
        }

        self.api.update_token(token);
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        let reconciler = Arc::new(ReconciliationEngine::new(
            Arc::clone(&self.api) as Arc<dyn NotificationFetcher>,
            Arc::clone(&self.store),
            self.config.page_size,
            self.config.recent_window,
            cancel.child_token(),
        ));

        self.store.set_connection_state(ConnectionState::Connecting);

        let transport = self.build_transport(self.config.transport, &events_tx);
        let transport = match transport.start(token).await {
            Ok(()) => transport,
            Err(e) if self.config.transport == TransportKind::WorkerPoll => {
                warn!(error = %e, "worker transport failed to start, falling back to foreground polling");
                let fallback = self.build_transport(TransportKind::ForegroundPoll, &events_tx);
                fallback.start(token).await?;
                fallback
            }
            Err(e) => {
                self.store.set_connection_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let transport = Arc::new(AsyncMutex::new(transport));
        let pump = tokio::spawn(Self::pump(
            events_rx,
            Arc::clone(&transport),
            Arc::clone(&reconciler),
            Arc::clone(&self.store),
            Arc::clone(&self.controller),
            self.faults.clone(),
            cancel.clone(),
            PumpContext {
                api: Arc::clone(&self.api),
                events_tx,
                max_errors: self.config.max_errors,
            },
        ));

        *active = Some(Active {
            transport,
            reconciler,
            cancel,
            pump,
        });
        Ok(())
    }

    /// Tear everything down. Pending timers are cancelled, in-flight requests
    /// aborted, and late responses discarded; no event is observed afterward.
    pub async fn stop(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        active.cancel.cancel();
        active.transport.lock().await.stop().await;
        let _ = active.pump.await;
        self.store.set_connection_state(ConnectionState::Disconnected);
        info!("notification engine stopped");
    }

    /// Rotate credentials without restarting the transport.
    pub async fn update_token(&self, token: &str) {
        self.api.update_token(token);
        if let Some(active) = self.active.lock().await.as_ref() {
            active.transport.lock().await.update_token(token);
        }
    }

    // --- host adjustments ---

    /// Optimistically mark one notification read locally, then confirm
    /// against the backend. Reverting on backend failure is the caller's
    /// decision.
    pub async fn mark_read(&self, id: i64) -> Result<()> {
        if self.store.mark_read(id)
            && let Some(active) = self.active.lock().await.as_ref()
        {
            active.reconciler.note_local_decrement();
        }
        self.api.mark_read(id).await
    }

    /// Optimistically mark everything read locally, then confirm.
    pub async fn mark_all_read(&self) -> Result<()> {
        self.store.mark_all_read();
        if let Some(active) = self.active.lock().await.as_ref() {
            active.reconciler.note_local_reset();
        }
        self.api.mark_all_read().await
    }

    /// Delete one notification locally and on the backend.
    pub async fn delete(&self, id: i64) -> Result<()> {
        if self.store.remove(id)
            && let Some(active) = self.active.lock().await.as_ref()
        {
            active.reconciler.note_local_decrement();
        }
        self.api.delete(id).await
    }

    /// One-shot count refresh that seeds the reconciliation baseline without
    /// announcing anything.
    pub async fn load_unread_count(&self) -> Result<u64> {
        let count = self.api.fetch_unread_count().await?;
        match self.active.lock().await.as_ref() {
            Some(active) => active.reconciler.seed_count(count),
            None => self.store.set_unread_count(count),
        }
        Ok(count)
    }

    /// Report a host visibility transition. Hidden hosts poll at the
    /// background rate; returning to visible restores the baseline and fires
    /// an immediate check.
    pub async fn report_visibility(&self, hidden: bool) {
        let update = self.controller.lock().report_visibility(hidden);
        let Some((transport, reconciler)) = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|a| (Arc::clone(&a.transport), Arc::clone(&a.reconciler)))
        else {
            return;
        };

        if let Some(interval) = update.new_interval {
            transport.lock().await.update_frequency(interval).await;
        }
        let consumed = transport
            .lock()
            .await
            .host_signal(HostSignal::VisibilityChanged { hidden });
        if update.immediate_check && !consumed {
            match self.api.fetch_unread_count().await {
                Ok(count) => reconciler.handle_unread_count(count),
                Err(e) => debug!(error = %e, "visibility check failed"),
            }
        }
    }

    /// Report that network connectivity returned.
    pub async fn report_network_regained(&self) {
        self.forward_signal(HostSignal::NetworkRegained).await;
    }

    /// Report that the host window regained focus.
    pub async fn report_focus_regained(&self) {
        self.forward_signal(HostSignal::FocusRegained).await;
    }

    fn build_transport(
        &self,
        kind: TransportKind,
        events_tx: &mpsc::Sender<TransportEvent>,
    ) -> ActiveTransport {
        match kind {
            TransportKind::WorkerPoll => {
                ActiveTransport::Worker(WorkerPollTransport::new(&self.config, events_tx.clone()))
            }
            TransportKind::Stream => ActiveTransport::Stream(StreamTransport::new(
                Arc::clone(&self.api),
                events_tx.clone(),
                self.config.reconnect_delay,
                self.config.max_reconnect_attempts,
            )),
            TransportKind::ForegroundPoll => {
                ActiveTransport::Foreground(ForegroundPollTransport::new(
                    Arc::clone(&self.api) as Arc<dyn NotificationFetcher>,
                    events_tx.clone(),
                    self.controller.lock().current_interval(),
                    self.config.max_errors,
                ))
            }
        }
    }

    async fn forward_signal(&self, signal: HostSignal) {
        let Some((transport, reconciler)) = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|a| (Arc::clone(&a.transport), Arc::clone(&a.reconciler)))
        else {
            return;
        };
        let consumed = transport.lock().await.host_signal(signal);
        if !consumed {
            // Worker and stream transports have no out-of-band check path;
            // run one directly.
            match self.api.fetch_unread_count().await {
                Ok(count) => reconciler.handle_unread_count(count),
                Err(e) => debug!(error = %e, "out-of-band check failed"),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn pump(
        mut events: mpsc::Receiver<TransportEvent>,
        transport: Arc<AsyncMutex<ActiveTransport>>,
        reconciler: Arc<ReconciliationEngine>,
        store: Arc<LocalNotificationStore>,
        controller: Arc<Mutex<AdaptiveFrequencyController>>,
        faults: broadcast::Sender<TransportFault>,
        cancel: CancellationToken,
        ctx: PumpContext,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            match event {
                TransportEvent::UnreadCount { count, at } => {
                    debug!(count, %at, "unread count signal");
                    let update = controller.lock().report_success();
                    if let Some(interval) = update.new_interval {
                        transport.lock().await.update_frequency(interval).await;
                    }
                    reconciler.handle_unread_count(count);
                }
                TransportEvent::Status(state) => {
                    store.set_connection_state(state);
                }
                TransportEvent::Pushed(notification) => {
                    reconciler.handle_pushed(notification);
                }
                TransportEvent::Fault(TransportFault::Transient {
                    message,
                    error_count,
                    max_errors,
                }) => {
                    debug!(error = %message, error_count, max_errors, "transient transport error");
                    let update = controller.lock().report_error();
                    if let Some(interval) = update.new_interval {
                        info!(
                            interval_ms = interval.as_millis() as u64,
                            "slowing down after repeated errors"
                        );
                        transport.lock().await.update_frequency(interval).await;
                    }
                }
                TransportEvent::Fault(TransportFault::Unauthorized) => {
                    warn!("authentication rejected, stopping transport");
                    transport.lock().await.stop().await;
                    store.set_connection_state(ConnectionState::Disconnected);
                    let _ = faults.send(TransportFault::Unauthorized);
                }
                TransportEvent::Fault(TransportFault::WorkerFailed { message }) => {
                    warn!(error = %message, "poll worker failed, falling back to foreground polling");
                    {
                        let mut guard = transport.lock().await;
                        guard.stop().await;
                        let fallback =
                            ActiveTransport::Foreground(ForegroundPollTransport::new(
                                Arc::clone(&ctx.api) as Arc<dyn NotificationFetcher>,
                                ctx.events_tx.clone(),
                                controller.lock().current_interval(),
                                ctx.max_errors,
                            ));
                        if let Err(e) = fallback.start("").await {
                            warn!(error = %e, "foreground fallback failed to start");
                            store.set_connection_state(ConnectionState::Disconnected);
                        }
                        *guard = fallback;
                    }
                    let _ = faults.send(TransportFault::WorkerFailed { message });
                }
                TransportEvent::Fault(TransportFault::ReconnectExhausted { attempts }) => {
                    store.set_connection_state(ConnectionState::Disconnected);
                    let _ = faults.send(TransportFault::ReconnectExhausted { attempts });
                }
            }
        }
    }
}

struct PumpContext {
    api: Arc<ApiClient>,
    events_tx: mpsc::Sender<TransportEvent>,
    max_errors: u32,
}
