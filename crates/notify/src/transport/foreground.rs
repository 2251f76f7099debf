//! Foreground polling transport.
//!
//! Fallback used when the isolated worker is unavailable. Runs the same poll
//! loop inside the host's own context, where background throttling can
//! stretch timers, and compensates by firing an immediate out-of-band check
//! whenever the host becomes visible again, regains network, or regains
//! focus. The scheduled interval keeps running alongside those checks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::NotificationFetcher;
use crate::error::Result;
use crate::transport::{NotificationChannel, TransportEvent, TransportFault};
use crate::types::ConnectionState;

const SIGNAL_CAPACITY: usize = 16;

/// Host environment transition relevant to polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    VisibilityChanged { hidden: bool },
    NetworkRegained,
    FocusRegained,
}

impl HostSignal {
    fn wants_immediate_check(self) -> bool {
        match self {
            Self::VisibilityChanged { hidden } => !hidden,
            Self::NetworkRegained | Self::FocusRegained => true,
        }
    }
}

enum LoopInput {
    Signal(HostSignal),
    Frequency(Duration),
}

struct Running {
    cancel: CancellationToken,
    inputs: mpsc::Sender<LoopInput>,
    task: JoinHandle<()>,
}

pub struct ForegroundPollTransport {
    fetcher: Arc<dyn NotificationFetcher>,
    events: mpsc::Sender<TransportEvent>,
    baseline_interval: Duration,
    max_errors: u32,
    running: Mutex<Option<Running>>,
}

impl ForegroundPollTransport {
    pub fn new(
        fetcher: Arc<dyn NotificationFetcher>,
        events: mpsc::Sender<TransportEvent>,
        baseline_interval: Duration,
        max_errors: u32,
    ) -> Self {
        Self {
            fetcher,
            events,
            baseline_interval,
            max_errors,
            running: Mutex::new(None),
        }
    }

    /// Deliver a host environment transition to the running loop.
    pub fn host_signal(&self, signal: HostSignal) {
        if let Some(running) = self.running.lock().as_ref() {
            let _ = running.inputs.try_send(LoopInput::Signal(signal));
        }
    }

    async fn check(
        fetcher: &Arc<dyn NotificationFetcher>,
        events: &mpsc::Sender<TransportEvent>,
        cancel: &CancellationToken,
        error_count: &mut u32,
        max_errors: u32,
    ) {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = fetcher.unread_count() => result,
        };
        if cancel.is_cancelled() {
            return;
        }
        let event = match result {
            Ok(count) => {
                *error_count = 0;
                TransportEvent::UnreadCount {
                    count,
                    at: chrono::Utc::now(),
                }
            }
            Err(e) if e.is_auth_failure() => {
                TransportEvent::Fault(TransportFault::Unauthorized)
            }
            Err(e) => {
                *error_count += 1;
                TransportEvent::Fault(TransportFault::Transient {
                    message: e.to_string(),
                    error_count: *error_count,
                    max_errors,
                })
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = events.send(event) => {}
        }
    }

    async fn run(
        fetcher: Arc<dyn NotificationFetcher>,
        events: mpsc::Sender<TransportEvent>,
        cancel: CancellationToken,
        mut inputs: mpsc::Receiver<LoopInput>,
        mut interval: Duration,
        max_errors: u32,
    ) {
        let mut error_count: u32 = 0;

        let _ = events
            .send(TransportEvent::Status(ConnectionState::Polling))
            .await;
        // Initial check immediately, then on the interval.
        Self::check(&fetcher, &events, &cancel, &mut error_count, max_errors).await;
        let mut next_check = tokio::time::Instant::now() + interval;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(next_check) => {
                    Self::check(&fetcher, &events, &cancel, &mut error_count, max_errors).await;
                    next_check = tokio::time::Instant::now() + interval;
                }
                input = inputs.recv() => match input {
                    None => return,
                    Some(LoopInput::Frequency(new_interval)) => {
                        if new_interval != interval {
                            debug!(
                                interval_ms = new_interval.as_millis() as u64,
                                "foreground poll interval updated"
                            );
                            interval = new_interval;
                            // Reschedule; no immediate re-check.
                            next_check = tokio::time::Instant::now() + interval;
                        }
                    }
                    Some(LoopInput::Signal(signal)) => {
                        if signal.wants_immediate_check() {
                            debug!(?signal, "out-of-band check");
                            Self::check(&fetcher, &events, &cancel, &mut error_count, max_errors)
                                .await;
                            // The scheduled interval keeps running; this
                            // check is in addition to it.
                        }
                    }
                },
            }
        }
    }
}

#[async_trait::async_trait]
impl NotificationChannel for ForegroundPollTransport {
    async fn start(&self, _token: &str) -> Result<()> {
        // The lock is held across the check and the insert so concurrent
        // starts cannot both spawn a loop.
        let mut running = self.running.lock();
        if running.is_some() {
            info!("foreground poll transport already started");
            return Ok(());
        }
        // The fetcher owns the credentials; the token argument is applied by
        // the engine before transports are started.
        let cancel = CancellationToken::new();
        let (input_tx, input_rx) = mpsc::channel(SIGNAL_CAPACITY);
        let task = tokio::spawn(Self::run(
            Arc::clone(&self.fetcher),
            self.events.clone(),
            cancel.clone(),
            input_rx,
            self.baseline_interval,
            self.max_errors,
        ));
        *running = Some(Running {
            cancel,
            inputs: input_tx,
            task,
        });
        Ok(())
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        let _ = running.task.await;
        debug!("foreground poll transport stopped");
    }

    fn update_token(&self, _token: &str) {
        // Credentials live in the shared API client; nothing transport-local
        // to rotate.
    }

    async fn update_frequency(&self, interval: Duration) {
        let inputs = self
            .running
            .lock()
            .as_ref()
            .map(|running| running.inputs.clone());
        if let Some(inputs) = inputs {
            let _ = inputs.send(LoopInput::Frequency(interval)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as EngineResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingFetcher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl NotificationFetcher for CountingFetcher {
        async fn unread_count(&self) -> EngineResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        }

        async fn recent(&self, _page_size: u32) -> EngineResult<Vec<crate::types::Notification>> {
            Ok(Vec::new())
        }
    }

    fn transport(
        interval: Duration,
    ) -> (
        Arc<CountingFetcher>,
        ForegroundPollTransport,
        mpsc::Receiver<TransportEvent>,
    ) {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicU32::new(0),
        });
        let (events_tx, events_rx) = mpsc::channel(64);
        let t = ForegroundPollTransport::new(
            Arc::clone(&fetcher) as Arc<dyn NotificationFetcher>,
            events_tx,
            interval,
            5,
        );
        (fetcher, t, events_rx)
    }

    #[tokio::test]
    async fn starts_with_an_immediate_check() {
        let (fetcher, transport, _events) = transport(Duration::from_secs(60));
        transport.start("tok").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        transport.stop().await;
    }

    #[tokio::test]
    async fn visibility_return_triggers_out_of_band_check() {
        let (fetcher, transport, _events) = transport(Duration::from_secs(60));
        transport.start("tok").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        transport.host_signal(HostSignal::VisibilityChanged { hidden: true });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1, "hidden: no check");

        transport.host_signal(HostSignal::VisibilityChanged { hidden: false });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        transport.host_signal(HostSignal::NetworkRegained);
        transport.host_signal(HostSignal::FocusRegained);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 4);

        transport.stop().await;
    }

    #[tokio::test]
    async fn stop_silences_the_transport() {
        let (fetcher, transport, mut events) = transport(Duration::from_millis(30));
        transport.start("tok").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.stop().await;

        while events.try_recv().is_ok() {}
        let calls = fetcher.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), calls);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_starts_spawn_a_single_loop() {
        let (fetcher, transport, _events) = transport(Duration::from_secs(60));
        let (a, b) = tokio::join!(transport.start("tok"), transport.start("tok"));
        a.unwrap();
        b.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // One immediate check from one loop, not two.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        transport.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (_fetcher, transport, _events) = transport(Duration::from_secs(60));
        transport.stop().await;
        transport.start("tok").await.unwrap();
        transport.stop().await;
        transport.stop().await;
    }
}
