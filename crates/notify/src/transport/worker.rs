//! Worker-isolated polling transport.
//!
//! The poll loop runs as an actor on its own task with no shared mutable
//! memory; the host talks to it exclusively through typed, serializable
//! messages. This keeps the interval steady even when the host's own context
//! is being throttled, and a dead worker is detected by its channel closing
//! so the host can fall back to foreground polling.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::transport::{NotificationChannel, TransportEvent, TransportFault};
use crate::types::ConnectionState;

const COMMAND_CAPACITY: usize = 16;
const REPLY_CAPACITY: usize = 64;

/// Inbound message to the poll worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum WorkerCommand {
    Start { api_url: String, token: String },
    Stop,
    UpdateToken { token: String },
    UpdateFrequency { frequency_ms: u64 },
}

/// Outbound message from the poll worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum WorkerReply {
    Started,
    Stopped,
    UnreadCount {
        count: u64,
        timestamp: DateTime<Utc>,
    },
    Error {
        error: String,
        error_count: u32,
        max_errors: u32,
    },
    Slowdown {
        new_frequency_ms: u64,
    },
    FrequencyUpdated {
        frequency_ms: u64,
    },
    AuthFailed {
        error: String,
    },
    WorkerError {
        error: String,
    },
}

/// Plain values handed to the worker at spawn time.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub frequency: Duration,
    pub max_errors: u32,
    pub max_interval: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub user_agent: String,
}

impl WorkerSettings {
    fn from_config(config: &EngineConfig) -> Self {
        Self {
            frequency: config.baseline_interval,
            max_errors: config.max_errors,
            max_interval: config.max_interval,
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            user_agent: config.user_agent.clone(),
        }
    }
}

struct WorkerState {
    settings: WorkerSettings,
    api: Option<ApiClient>,
    polling: bool,
    error_count: u32,
}

impl WorkerState {
    fn build_api(&self, api_url: &str, token: &str) -> Result<ApiClient> {
        let client = reqwest::Client::builder()
            .user_agent(self.settings.user_agent.clone())
            .default_headers(EngineConfig::default_headers())
            .connect_timeout(self.settings.connect_timeout)
            .read_timeout(self.settings.read_timeout)
            .build()
            .map_err(EngineError::from)?;
        let api = ApiClient::new(client, api_url)?;
        api.update_token(token);
        Ok(api)
    }

    /// One count check, reporting the outcome on the reply channel.
    async fn check(&mut self, replies: &mpsc::Sender<WorkerReply>) {
        let Some(api) = &self.api else {
            let _ = replies
                .send(WorkerReply::Error {
                    error: "missing API URL or auth token".into(),
                    error_count: self.error_count,
                    max_errors: self.settings.max_errors,
                })
                .await;
            return;
        };

        match api.fetch_unread_count().await {
            Ok(count) => {
                self.error_count = 0;
                let _ = replies
                    .send(WorkerReply::UnreadCount {
                        count,
                        timestamp: Utc::now(),
                    })
                    .await;
            }
            Err(e) if e.is_auth_failure() => {
                let _ = replies
                    .send(WorkerReply::AuthFailed {
                        error: e.to_string(),
                    })
                    .await;
            }
            Err(e) => {
                self.error_count += 1;
                let _ = replies
                    .send(WorkerReply::Error {
                        error: e.to_string(),
                        error_count: self.error_count,
                        max_errors: self.settings.max_errors,
                    })
                    .await;

                if self.error_count >= self.settings.max_errors {
                    // Too many consecutive failures: slow down but never
                    // stop polling outright. The counter resets so the next
                    // doubling needs a whole new burst.
                    self.error_count = 0;
                    let doubled = self
                        .settings
                        .frequency
                        .checked_mul(2)
                        .unwrap_or(self.settings.max_interval)
                        .min(self.settings.max_interval);
                    if doubled != self.settings.frequency {
                        self.settings.frequency = doubled;
                        let _ = replies
                            .send(WorkerReply::Slowdown {
                                new_frequency_ms: doubled.as_millis() as u64,
                            })
                            .await;
                    }
                }
            }
        }
    }
}

/// The worker actor loop. Runs until the command channel closes.
pub(crate) async fn run_poll_worker(
    mut commands: mpsc::Receiver<WorkerCommand>,
    replies: mpsc::Sender<WorkerReply>,
    settings: WorkerSettings,
) {
    let mut state = WorkerState {
        settings,
        api: None,
        polling: false,
        error_count: 0,
    };
    let mut next_check: Option<tokio::time::Instant> = None;

    loop {
        // A disabled select branch still evaluates its expression, so the
        // deadline must exist even when polling is off.
        let deadline = next_check
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(86_400));
        let armed = state.polling && next_check.is_some();

        tokio::select! {
            command = commands.recv() => match command {
                None => break,
                Some(WorkerCommand::Start { api_url, token }) => {
                    if state.polling {
                        debug!("poll worker already active");
                        continue;
                    }
                    match state.build_api(&api_url, &token) {
                        Ok(api) => state.api = Some(api),
                        Err(e) => {
                            let _ = replies
                                .send(WorkerReply::WorkerError { error: e.to_string() })
                                .await;
                            continue;
                        }
                    }
                    state.polling = true;
                    state.error_count = 0;
                    let _ = replies.send(WorkerReply::Started).await;
                    // Initial check immediately, then on the interval.
                    state.check(&replies).await;
                    next_check =
                        Some(tokio::time::Instant::now() + state.settings.frequency);
                }
                Some(WorkerCommand::Stop) => {
                    state.polling = false;
                    next_check = None;
                    let _ = replies.send(WorkerReply::Stopped).await;
                }
                Some(WorkerCommand::UpdateToken { token }) => {
                    if let Some(api) = &state.api {
                        api.update_token(&token);
                    }
                }
                Some(WorkerCommand::UpdateFrequency { frequency_ms }) => {
                    let frequency = Duration::from_millis(frequency_ms);
                    if frequency == state.settings.frequency {
                        continue;
                    }
                    state.settings.frequency = frequency;
                    if state.polling {
                        // Reschedule without re-issuing an immediate check.
                        next_check = Some(tokio::time::Instant::now() + frequency);
                        let _ = replies
                            .send(WorkerReply::FrequencyUpdated { frequency_ms })
                            .await;
                    }
                }
            },
            _ = tokio::time::sleep_until(deadline), if armed => {
                state.check(&replies).await;
                next_check = Some(tokio::time::Instant::now() + state.settings.frequency);
            }
        }
    }
    debug!("poll worker exited");
}

struct Running {
    commands: mpsc::Sender<WorkerCommand>,
    cancel: CancellationToken,
    forwarder: JoinHandle<()>,
    worker: JoinHandle<()>,
}

/// Host-side handle for the worker-isolated polling transport.
pub struct WorkerPollTransport {
    api_url: String,
    settings: WorkerSettings,
    events: mpsc::Sender<TransportEvent>,
    running: Mutex<Option<Running>>,
}

impl WorkerPollTransport {
    pub fn new(config: &EngineConfig, events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            api_url: config.api_url.clone(),
            settings: WorkerSettings::from_config(config),
            events,
            running: Mutex::new(None),
        }
    }

    async fn forward_replies(
        mut replies: mpsc::Receiver<WorkerReply>,
        events: mpsc::Sender<TransportEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let reply = tokio::select! {
                _ = cancel.cancelled() => break,
                reply = replies.recv() => reply,
            };
            let event = match reply {
                None => {
                    // Worker died (panic or channel loss) without a Stopped
                    // handshake: surface it so the owner can fall back.
                    if !cancel.is_cancelled() {
                        let _ = events
                            .send(TransportEvent::Fault(TransportFault::WorkerFailed {
                                message: "poll worker terminated unexpectedly".into(),
                            }))
                            .await;
                    }
                    break;
                }
                Some(WorkerReply::Started) => {
                    TransportEvent::Status(ConnectionState::Polling)
                }
                Some(WorkerReply::Stopped) => break,
                Some(WorkerReply::UnreadCount { count, timestamp }) => {
                    TransportEvent::UnreadCount {
                        count,
                        at: timestamp,
                    }
                }
                Some(WorkerReply::Error {
                    error,
                    error_count,
                    max_errors,
                }) => TransportEvent::Fault(TransportFault::Transient {
                    message: error,
                    error_count,
                    max_errors,
                }),
                Some(WorkerReply::Slowdown { new_frequency_ms }) => {
                    info!(new_frequency_ms, "poll worker slowed down after errors");
                    continue;
                }
                Some(WorkerReply::FrequencyUpdated { frequency_ms }) => {
                    debug!(frequency_ms, "poll worker frequency updated");
                    continue;
                }
                Some(WorkerReply::AuthFailed { error }) => {
                    warn!(error = %error, "poll worker authentication rejected");
                    TransportEvent::Fault(TransportFault::Unauthorized)
                }
                Some(WorkerReply::WorkerError { error }) => {
                    TransportEvent::Fault(TransportFault::WorkerFailed { message: error })
                }
            };
            let delivered = tokio::select! {
                _ = cancel.cancelled() => false,
                sent = events.send(event) => sent.is_ok(),
            };
            if !delivered {
                break;
            }
        }
    }
}

#[async_trait::async_trait]
impl NotificationChannel for WorkerPollTransport {
    async fn start(&self, token: &str) -> Result<()> {
        // The lock is held across the check and the insert so concurrent
        // starts cannot both spawn a loop.
        let mut running = self.running.lock();
        if running.is_some() {
            info!("worker poll transport already started");
            return Ok(());
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_CAPACITY);
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_poll_worker(
            command_rx,
            reply_tx,
            self.settings.clone(),
        ));
        let forwarder = tokio::spawn(Self::forward_replies(
            reply_rx,
            self.events.clone(),
            cancel.clone(),
        ));

        // The channel is fresh and sized above one, so this cannot be full.
        if let Err(e) = command_tx.try_send(WorkerCommand::Start {
            api_url: self.api_url.clone(),
            token: token.to_owned(),
        }) {
            cancel.cancel();
            worker.abort();
            forwarder.abort();
            return Err(EngineError::transport(format!(
                "poll worker rejected start command: {e}"
            )));
        }

        *running = Some(Running {
            commands: command_tx,
            cancel,
            forwarder,
            worker,
        });
        Ok(())
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        // Gate emissions first so nothing surfaces after we return, then let
        // the worker wind down; aborting it also drops any in-flight fetch.
        running.cancel.cancel();
        let _ = running.commands.try_send(WorkerCommand::Stop);
        let _ = running.forwarder.await;
        running.worker.abort();
        debug!("worker poll transport stopped");
    }

    fn update_token(&self, token: &str) {
        if let Some(running) = self.running.lock().as_ref() {
            let _ = running.commands.try_send(WorkerCommand::UpdateToken {
                token: token.to_owned(),
            });
        }
    }

    async fn update_frequency(&self, interval: Duration) {
        let commands = self
            .running
            .lock()
            .as_ref()
            .map(|running| running.commands.clone());
        if let Some(commands) = commands {
            let _ = commands
                .send(WorkerCommand::UpdateFrequency {
                    frequency_ms: interval.as_millis() as u64,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_serialize_with_the_wire_protocol_shape() {
        let cmd = WorkerCommand::Start {
            api_url: "https://example.org/api".into(),
            token: "tok".into(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "start");
        assert_eq!(json["data"]["apiUrl"], "https://example.org/api");
        assert_eq!(json["data"]["token"], "tok");

        let stop = serde_json::to_value(WorkerCommand::Stop).unwrap();
        assert_eq!(stop["type"], "stop");
    }

    #[test]
    fn replies_serialize_with_the_wire_protocol_shape() {
        let reply = WorkerReply::Slowdown {
            new_frequency_ms: 60_000,
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "slowdown");
        assert_eq!(json["newFrequencyMs"], 60_000);

        let reply = WorkerReply::Error {
            error: "boom".into(),
            error_count: 2,
            max_errors: 5,
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["errorCount"], 2);
        assert_eq!(json["maxErrors"], 5);
    }

    #[tokio::test]
    async fn update_frequency_reschedules_without_immediate_check() {
        // No API configured: a check would produce an Error reply, so the
        // absence of replies after UpdateFrequency shows no check fired.
        let (command_tx, command_rx) = mpsc::channel(4);
        let (reply_tx, mut reply_rx) = mpsc::channel(16);
        let settings = WorkerSettings {
            frequency: Duration::from_secs(30),
            max_errors: 5,
            max_interval: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            user_agent: "test".into(),
        };
        let handle = tokio::spawn(run_poll_worker(command_rx, reply_tx, settings));

        command_tx
            .send(WorkerCommand::UpdateFrequency { frequency_ms: 10 })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reply_rx.try_recv().is_err(), "no reply expected while idle");

        drop(command_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stop_reply_is_sent_and_loop_survives() {
        let (command_tx, command_rx) = mpsc::channel(4);
        let (reply_tx, mut reply_rx) = mpsc::channel(16);
        let settings = WorkerSettings {
            frequency: Duration::from_secs(30),
            max_errors: 5,
            max_interval: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            user_agent: "test".into(),
        };
        let handle = tokio::spawn(run_poll_worker(command_rx, reply_tx, settings));

        command_tx.send(WorkerCommand::Stop).await.unwrap();
        let reply = reply_rx.recv().await.unwrap();
        assert!(matches!(reply, WorkerReply::Stopped));

        drop(command_tx);
        handle.await.unwrap();
    }
}
