//! # Router Boundary Errors
//!
//! Every failure surfaced to the layer above the router is one of these
//! kinds, each mapping to an HTTP-ish status and rendering as an RFC 7807
//! problem document: `type`, `title`, `status`, `detail`, optional
//! field errors, optional machine code, optional `retry_after`, plus the
//! request correlation id and a timestamp.
//!
//! Circuit-open, bulkhead-full and transient upstream errors are handled
//! inside the dispatcher (they advance the fallback chain) and never
//! appear here.

use crate::policy::RejectedProvider;
use crate::ratelimit::LimitWindow;
use crate::validation::ValidationError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use switchboard_models_sdk::error::ErrorKind;
use thiserror::Error;

/// One provider's failure inside an exhausted fallback chain.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderFailure {
    pub provider_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Errors surfaced at the router boundary.
#[derive(Error, Debug)]
pub enum RouterError {
    /// The validator rejected the input
    #[error("validation failed: {0}")]
    Validation(ValidationError),

    /// The gateway's risk heuristic denied the request
    #[error("request denied by gateway (risk score {risk_score:.2})")]
    GatewayDenied { risk_score: f32 },

    /// Identity missing or invalid
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// The rate limiter denied admission
    #[error("rate limit exceeded for {scope} ({} window)", .window.as_str())]
    RateLimited {
        scope: &'static str,
        window: LimitWindow,
        retry_after: Duration,
    },

    /// The filter step left no provider to try
    #[error("no provider available")]
    NoProviderAvailable { rejected: Vec<RejectedProvider> },

    /// Every provider in the chain was tried and failed
    #[error("all providers failed ({})", .failures.len())]
    AllProvidersFailed { failures: Vec<ProviderFailure> },

    /// The final attempt timed out against its provider
    #[error("provider {provider_id} timed out")]
    ProviderTimeout { provider_id: String },

    /// The overall request deadline passed before the chain completed
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// The caller canceled the request
    #[error("request canceled by caller")]
    Canceled,

    /// A bug; last resort
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RouterError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::GatewayDenied { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NoProviderAvailable { .. } | Self::AllProvidersFailed { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::ProviderTimeout { .. } | Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            // Canceled requests get no meaningful response; 499 is the
            // conventional closed-connection status.
            Self::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn problem_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "https://switchboard.dev/problems/validation",
            Self::GatewayDenied { .. } => "https://switchboard.dev/problems/gateway-denied",
            Self::Unauthorized { .. } => "https://switchboard.dev/problems/unauthorized",
            Self::RateLimited { .. } => "https://switchboard.dev/problems/rate-limited",
            Self::NoProviderAvailable { .. } => {
                "https://switchboard.dev/problems/no-provider-available"
            }
            Self::AllProvidersFailed { .. } => {
                "https://switchboard.dev/problems/all-providers-failed"
            }
            Self::ProviderTimeout { .. } => "https://switchboard.dev/problems/provider-timeout",
            Self::DeadlineExceeded => "https://switchboard.dev/problems/deadline-exceeded",
            Self::Canceled => "https://switchboard.dev/problems/canceled",
            Self::Internal { .. } => "about:blank",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Validation(_) => "Invalid request",
            Self::GatewayDenied { .. } => "Request denied",
            Self::Unauthorized { .. } => "Unauthorized",
            Self::RateLimited { .. } => "Rate limit exceeded",
            Self::NoProviderAvailable { .. } => "No provider available",
            Self::AllProvidersFailed { .. } => "All providers failed",
            Self::ProviderTimeout { .. } => "Provider timeout",
            Self::DeadlineExceeded => "Deadline exceeded",
            Self::Canceled => "Request canceled",
            Self::Internal { .. } => "Internal error",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "INVALID_REQUEST",
            Self::GatewayDenied { .. } => "GATEWAY_DENIED",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Self::NoProviderAvailable { .. } => "NO_PROVIDER_AVAILABLE",
            Self::AllProvidersFailed { .. } => "ALL_PROVIDERS_FAILED",
            Self::ProviderTimeout { .. } => "PROVIDER_TIMEOUT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Canceled => "CANCELED",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Render to an RFC 7807 problem document.
    pub fn problem(&self, request_id: &str) -> ProblemDetail {
        let errors = match self {
            Self::Validation(validation) => Some(validation.fields.clone()),
            _ => None,
        };
        let code = match self {
            Self::Validation(validation) => validation.code.unwrap_or(self.code()),
            _ => self.code(),
        };
        ProblemDetail {
            problem_type: self.problem_type().to_string(),
            title: self.title().to_string(),
            status: self.status_code().as_u16(),
            detail: Some(self.to_string()),
            errors,
            code: Some(code.to_string()),
            retry_after_secs: self.retry_after().map(|d| d.as_secs().max(1)),
            request_id: request_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// RFC 7807 problem document.
#[derive(Debug, Clone, Serialize)]
pub struct ProblemDetail {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Field-specific validation errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<BTreeMap<String, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    pub request_id: String,
    pub timestamp: String,
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        // The HTTP layer normally renders via `problem()` with the
        // request's correlation id; direct conversions mint one.
        let problem = self.problem(&uuid::Uuid::new_v4().to_string());
        (self.status_code(), Json(problem)).into_response()
    }
}
