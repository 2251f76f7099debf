use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation}")]
    HttpStatus {
        status: StatusCode,
        operation: &'static str,
    },

    #[error("authentication rejected during {operation}")]
    Unauthorized { operation: &'static str },

    #[error("backend reported failure: {message}")]
    Api { message: String },

    #[error("malformed payload: {reason}")]
    Parse { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("reconnect budget exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("poll worker failed: {reason}")]
    WorkerFailed { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl EngineError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Map a non-success HTTP status to the right variant. 401/403 are
    /// terminal for the active transport; everything else is handled by the
    /// normal polling/backoff machinery.
    pub fn from_status(status: StatusCode, operation: &'static str) -> Self {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Self::Unauthorized { operation }
        } else {
            Self::HttpStatus { status, operation }
        }
    }

    /// Whether the polling/backoff machinery should absorb this error and
    /// keep going.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::Unauthorized { .. }
            | Self::Configuration { .. }
            | Self::ReconnectExhausted { .. }
            | Self::WorkerFailed { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Network { .. }
            | Self::Api { .. }
            | Self::Parse { .. }
            | Self::Transport { .. }
            | Self::Internal { .. } => true,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
