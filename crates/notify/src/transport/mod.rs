//! Transport strategies for obtaining unread-count and notification updates.
//!
//! One transport is active at a time. Each implements [`NotificationChannel`]
//! and reports back to its owner through a single event channel; after
//! `stop()` returns, a transport emits nothing further, including results of
//! requests already in flight.

pub mod foreground;
pub mod stream;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{ConnectionState, Notification};

/// Event emitted by a transport to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A fresh unread count was observed.
    UnreadCount { count: u64, at: DateTime<Utc> },
    /// Connection status changed.
    Status(ConnectionState),
    /// A server-pushed notification frame (stream transport only); still
    /// subject to reconciliation de-duplication.
    Pushed(Notification),
    /// A fault the owner must react to.
    Fault(TransportFault),
}

/// Faults surfaced to the owner. Transient failures are absorbed by the
/// transport's own backoff and only reported for frequency accounting; the
/// rest require an owner decision.
#[derive(Debug, Clone)]
pub enum TransportFault {
    /// A single check failed; the transport keeps going.
    Transient {
        message: String,
        error_count: u32,
        max_errors: u32,
    },
    /// The backend rejected our credentials; the transport has stopped.
    Unauthorized,
    /// The isolated poll worker died; the owner should fall back.
    WorkerFailed { message: String },
    /// The stream transport ran out of reconnect attempts; terminal until an
    /// explicit restart.
    ReconnectExhausted { attempts: u32 },
}

/// Contract shared by all transport strategies.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Begin yielding updates. Calling `start` on an already-started channel
    /// is a no-op that logs instead of creating a duplicate loop.
    async fn start(&self, token: &str) -> Result<()>;

    /// Tear down. Idempotent; never errors when already stopped. No events
    /// are observed after this returns.
    async fn stop(&self);

    /// Swap credentials without restarting; takes effect on the next request.
    fn update_token(&self, token: &str);

    /// Change the poll interval. The next scheduled check moves to
    /// `now + interval`; no immediate check is issued.
    async fn update_frequency(&self, interval: Duration);
}
