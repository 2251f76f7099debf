use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::error::{EngineError, Result};

pub const DEFAULT_USER_AGENT: &str = concat!("notify-engine/", env!("CARGO_PKG_VERSION"));

/// Which transport the engine activates first. Worker-isolated polling is the
/// production default; the stream and foreground transports are alternatives,
/// and foreground polling is always the runtime fallback when the worker
/// fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    WorkerPoll,
    Stream,
    ForegroundPoll,
}

/// Configurable options for the notification engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base API URL, e.g. `https://example.org/api`.
    pub api_url: String,

    /// Preferred transport to start with.
    pub transport: TransportKind,

    /// Poll interval while the host is visible.
    pub baseline_interval: Duration,

    /// Poll interval while the host is hidden.
    pub background_interval: Duration,

    /// Hard ceiling for error-escalated intervals.
    pub max_interval: Duration,

    /// Consecutive failures before the interval is doubled.
    pub max_errors: u32,

    /// Page size for reconciliation list fetches.
    pub page_size: u32,

    /// Only items created within this window are announced as new.
    pub recent_window: Duration,

    /// Base delay between stream reconnect attempts; the actual delay is
    /// `reconnect_delay * attempt`.
    pub reconnect_delay: Duration,

    /// Reconnect attempts before the stream transport goes terminal.
    pub max_reconnect_attempts: u32,

    /// Connection timeout for the HTTP client.
    pub connect_timeout: Duration,

    /// Maximum time between received chunks on a request.
    pub read_timeout: Duration,

    /// User agent string.
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            transport: TransportKind::default(),
            baseline_interval: Duration::from_secs(30),
            background_interval: Duration::from_secs(120),
            max_interval: Duration::from_secs(300),
            max_errors: 5,
            page_size: 10,
            recent_window: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl EngineConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ..Self::default()
        }
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub(crate) fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        headers
    }
}

/// Build the shared HTTP client from config.
pub(crate) fn create_client(config: &EngineConfig) -> Result<reqwest::Client> {
    if config.api_url.is_empty() {
        return Err(EngineError::configuration("api_url is empty"));
    }

    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .default_headers(EngineConfig::default_headers())
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .build()
        .map_err(EngineError::from)
}
