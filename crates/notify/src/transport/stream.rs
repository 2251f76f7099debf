//! Server-push stream transport.
//!
//! Maintains one long-lived authenticated HTTP stream and parses it as
//! newline-delimited `data: <json>` frames. Malformed frames are skipped;
//! stream termination triggers linear-backoff reconnects up to a bounded
//! attempt budget, after which the transport is terminal until an explicit
//! `start()`.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::api::ApiClient;
use crate::error::Result;
use crate::transport::{NotificationChannel, TransportEvent, TransportFault};
use crate::types::{ConnectionState, Notification, UnreadCountData};

/// One decoded frame from the event stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamFrame {
    Connected,
    Notification(Notification),
    UnreadCount(UnreadCountData),
    Heartbeat,
}

/// Parse a single line of the stream. Returns `None` for comments, empty
/// lines, non-data fields, and malformed payloads (logged, not fatal).
fn parse_line(line: &str) -> Option<StreamFrame> {
    let line = line.trim_end_matches('\r');
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let payload = line
        .strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))?;
    match serde_json::from_str::<StreamFrame>(payload) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(error = %e, "skipping malformed stream frame");
            None
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct StreamTransport {
    api: Arc<ApiClient>,
    events: mpsc::Sender<TransportEvent>,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
    running: Mutex<Option<Running>>,
}

impl StreamTransport {
    pub fn new(
        api: Arc<ApiClient>,
        events: mpsc::Sender<TransportEvent>,
        reconnect_delay: Duration,
        max_reconnect_attempts: u32,
    ) -> Self {
        Self {
            api,
            events,
            reconnect_delay,
            max_reconnect_attempts,
            running: Mutex::new(None),
        }
    }

    async fn emit(
        events: &mpsc::Sender<TransportEvent>,
        cancel: &CancellationToken,
        event: TransportEvent,
    ) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = events.send(event) => sent.is_ok(),
        }
    }

    /// Read frames from one open stream until it ends or errors.
    async fn read_stream(
        response: reqwest::Response,
        events: &mpsc::Sender<TransportEvent>,
        cancel: &CancellationToken,
    ) {
        let mut body = response.bytes_stream();
        let mut buffer = String::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return,
                chunk = body.next() => chunk,
            };
            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    warn!(error = %e, "stream read error");
                    return;
                }
                None => {
                    debug!("stream ended");
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let Some(frame) = parse_line(line.trim_end_matches('\n')) else {
                    continue;
                };
                let event = match frame {
                    StreamFrame::Connected => {
                        debug!("stream handshake acknowledged");
                        continue;
                    }
                    StreamFrame::Heartbeat => {
                        trace!("stream heartbeat");
                        continue;
                    }
                    StreamFrame::Notification(notification) => {
                        TransportEvent::Pushed(notification)
                    }
                    StreamFrame::UnreadCount(data) => TransportEvent::UnreadCount {
                        count: data.count,
                        at: chrono::Utc::now(),
                    },
                };
                if !Self::emit(events, cancel, event).await {
                    return;
                }
            }
        }
    }

    async fn run(
        api: Arc<ApiClient>,
        events: mpsc::Sender<TransportEvent>,
        cancel: CancellationToken,
        reconnect_delay: Duration,
        max_reconnect_attempts: u32,
    ) {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            Self::emit(
                &events,
                &cancel,
                TransportEvent::Status(ConnectionState::Connecting),
            )
            .await;

            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                opened = api.open_stream() => opened,
            };
            match opened {
                Ok(response) => {
                    info!("notification stream connected");
                    attempt = 0;
                    Self::emit(
                        &events,
                        &cancel,
                        TransportEvent::Status(ConnectionState::Connected),
                    )
                    .await;
                    Self::read_stream(response, &events, &cancel).await;
                    if cancel.is_cancelled() {
                        return;
                    }
                }
                Err(e) if e.is_auth_failure() => {
                    warn!(error = %e, "stream authentication rejected");
                    Self::emit(
                        &events,
                        &cancel,
                        TransportEvent::Fault(TransportFault::Unauthorized),
                    )
                    .await;
                    Self::emit(
                        &events,
                        &cancel,
                        TransportEvent::Status(ConnectionState::Disconnected),
                    )
                    .await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "stream connect failed");
                }
            }

            attempt += 1;
            if attempt > max_reconnect_attempts {
                warn!(
                    attempts = max_reconnect_attempts,
                    "reconnect budget exhausted, stream transport going terminal"
                );
                Self::emit(
                    &events,
                    &cancel,
                    TransportEvent::Fault(TransportFault::ReconnectExhausted {
                        attempts: max_reconnect_attempts,
                    }),
                )
                .await;
                Self::emit(
                    &events,
                    &cancel,
                    TransportEvent::Status(ConnectionState::Disconnected),
                )
                .await;
                return;
            }

            let delay = reconnect_delay.saturating_mul(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "stream backoff");
            if !Self::emit(
                &events,
                &cancel,
                TransportEvent::Status(ConnectionState::Backoff),
            )
            .await
            {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait::async_trait]
impl NotificationChannel for StreamTransport {
    async fn start(&self, token: &str) -> Result<()> {
        // The lock is held across the check and the insert so concurrent
        // starts cannot both spawn a loop.
        let mut running = self.running.lock();
        if running.is_some() {
            info!("stream transport already started");
            return Ok(());
        }
        self.api.update_token(token);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::run(
            Arc::clone(&self.api),
            self.events.clone(),
            cancel.clone(),
            self.reconnect_delay,
            self.max_reconnect_attempts,
        ));
        *running = Some(Running { cancel, task });
        Ok(())
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        // Cancelling drops the in-flight request and any pending reconnect
        // timer; awaiting the task guarantees no emission after we return.
        running.cancel.cancel();
        let _ = running.task.await;
        debug!("stream transport stopped");
    }

    fn update_token(&self, token: &str) {
        self.api.update_token(token);
    }

    async fn update_frequency(&self, _interval: Duration) {
        // Push transport; there is no poll interval to adjust.
        debug!("update_frequency ignored by stream transport");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unread_count_frame() {
        let frame = parse_line(r#"data: {"type":"unread_count","data":{"count":4}}"#);
        match frame {
            Some(StreamFrame::UnreadCount(data)) => assert_eq!(data.count, 4),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parses_notification_frame() {
        let payload = r#"data: {"type":"notification","data":{"id":9,"title":"t","message":"m","targetRoute":"/x","referenceId":1,"type":"community","isRead":false,"createdAt":"2026-08-24T09:00:00Z"}}"#;
        match parse_line(payload) {
            Some(StreamFrame::Notification(n)) => assert_eq!(n.id, 9),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_and_connected_frames_parse() {
        assert!(matches!(
            parse_line(r#"data: {"type":"heartbeat"}"#),
            Some(StreamFrame::Heartbeat)
        ));
        assert!(matches!(
            parse_line(r#"data: {"type":"connected"}"#),
            Some(StreamFrame::Connected)
        ));
    }

    #[test]
    fn malformed_frames_are_skipped_not_fatal() {
        assert!(parse_line("data: {not json").is_none());
        assert!(parse_line(r#"data: {"type":"unknown"}"#).is_none());
    }

    #[test]
    fn non_data_lines_are_ignored() {
        assert!(parse_line("").is_none());
        assert!(parse_line(": comment").is_none());
        assert!(parse_line("event: message").is_none());
        assert!(parse_line("\r").is_none());
    }
}
