//! # Adapter Error Taxonomy
//!
//! Every adapter failure carries an [`ErrorKind`] classifier so the router
//! can pick the right policy (auth-block, retry, advance the fallback
//! chain) by switching on a discriminant instead of sniffing message
//! strings. HTTP-level failures from `reqwest` convert into the taxonomy
//! automatically.

use thiserror::Error;

/// Machine-readable classifier attached to every adapter error.
///
/// The router never inspects error text; this tag alone decides whether a
/// failure is retried on the same provider, advances the chain, or
/// soft-disables the provider entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credential rejected (HTTP 401/403). Retries cannot recover this.
    Auth,
    /// The attempt exceeded its time budget.
    Timeout,
    /// Upstream asked us to back off (HTTP 429).
    RateLimited,
    /// Upstream server failure (HTTP 5xx).
    Server5xx,
    /// The request itself was rejected (4xx other than auth/429).
    BadRequest,
    /// Connection-level failure before a response arrived.
    Transport,
    /// The caller canceled the request.
    Canceled,
    /// Anything the adapter could not classify.
    Other,
}

impl ErrorKind {
    /// Transient kinds where a second attempt against the same provider
    /// can plausibly succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Server5xx | Self::Transport)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limit",
            Self::Server5xx => "server_5xx",
            Self::BadRequest => "bad_request",
            Self::Transport => "transport",
            Self::Canceled => "canceled",
            Self::Other => "other",
        }
    }
}

/// Errors produced by provider adapters.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Credential rejected by the upstream
    #[error("authentication rejected: {message}")]
    Auth { message: String },

    /// The attempt ran out of time
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Upstream rate limit hit
    #[error("upstream rate limit exceeded")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Upstream 5xx failure
    #[error("upstream server error: {status} - {message}")]
    Upstream { status: u16, message: String },

    /// Request rejected by the upstream (non-auth 4xx)
    #[error("upstream rejected request: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Connection-level failure
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Caller canceled
    #[error("request canceled by caller")]
    Canceled,

    /// Response body did not match the expected shape
    #[error("invalid response format: {0}")]
    InvalidResponse(#[from] serde_json::Error),

    /// Adapter misconfiguration (bad endpoint, missing credential)
    #[error("adapter configuration error: {message}")]
    Configuration { message: String },
}

impl AdapterError {
    /// The classifier tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Upstream { .. } => ErrorKind::Server5xx,
            Self::Rejected { .. } => ErrorKind::BadRequest,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Canceled => ErrorKind::Canceled,
            Self::InvalidResponse(_) | Self::Configuration { .. } => ErrorKind::Other,
        }
    }

    /// Classify an HTTP status returned by an upstream into an error.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => Self::Auth { message },
            429 => Self::RateLimited {
                retry_after_secs: None,
            },
            500..=599 => Self::Upstream { status, message },
            _ => Self::Rejected { status, message },
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { timeout_ms: 0 }
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), err.to_string())
        } else {
            Self::Transport {
                message: err.to_string(),
            }
        }
    }
}
