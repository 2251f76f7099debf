//! Notification synchronization engine.
//!
//! Keeps a client-side view of unread alerts consistent with a remote
//! authoritative store across several unreliable transports: worker-isolated
//! polling (immune to host background throttling), a long-lived server-push
//! stream, and foreground polling as the universal fallback.
//!
//! ## Core Types
//!
//! - [`NotificationEngine`] - engine facade: lifecycle, adjustments, views
//! - [`Notification`] / [`NotificationKind`] - the data model
//! - [`LocalNotificationStore`] - canonical list, unread count, status
//! - [`ConnectionState`] - transport-owned connection status
//!
//! ## Transports
//!
//! - [`NotificationChannel`] - the pluggable transport contract
//! - [`WorkerPollTransport`] - actor-isolated polling (primary)
//! - [`StreamTransport`] - server-push event stream
//! - [`ForegroundPollTransport`] - in-context polling fallback
//!
//! ## Policy
//!
//! - [`AdaptiveFrequencyController`] - poll interval escalation rules
//! - [`ReconciliationEngine`] - count deltas into de-duplicated events

pub mod api;
pub mod config;
pub mod error;
pub mod frequency;
pub mod reconcile;
pub mod service;
pub mod store;
pub mod transport;
pub mod types;

pub use api::{ApiClient, NotificationFetcher};
pub use config::{EngineConfig, TransportKind};
pub use error::{EngineError, Result};
pub use frequency::{AdaptiveFrequencyController, FrequencyState, FrequencyUpdate};
pub use reconcile::ReconciliationEngine;
pub use service::NotificationEngine;
pub use store::LocalNotificationStore;
pub use transport::foreground::{ForegroundPollTransport, HostSignal};
pub use transport::stream::{StreamFrame, StreamTransport};
pub use transport::worker::{WorkerCommand, WorkerPollTransport, WorkerReply};
pub use transport::{NotificationChannel, TransportEvent, TransportFault};
pub use types::{ConnectionState, Notification, NotificationKind};
