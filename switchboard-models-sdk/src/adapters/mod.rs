//! # Provider Adapter Contract
//!
//! Every upstream inference backend is reached through a [`ChatAdapter`].
//! The router holds adapters as trait objects behind stable provider ids
//! and consumes exactly three capabilities from them:
//!
//! - `capabilities()` — what the backend can do (models, tags, context
//!   windows), used for request filtering.
//! - `health_probe(ctx)` — a cheap, time-bounded liveness check (a model
//!   listing or ping), used by the registry's cached health sampling. A
//!   probe failure marks the provider unhealthy but never trips its
//!   circuit breaker; only real request failures do.
//! - `chat(ctx, request)` — one completion attempt. Failures MUST carry an
//!   [`ErrorKind`](crate::error::ErrorKind) classifier so the router can
//!   apply the right policy without inspecting strings.
//!
//! Wire-format translation lives entirely inside adapter implementations;
//! nothing above this trait knows vendor payload shapes.

use crate::context::RequestContext;
use crate::error::AdapterError;
use crate::models::{ChatRequest, ChatResponse};
use std::collections::{HashMap, HashSet};

pub mod openai_compat;
pub mod stub;

/// What a backend advertises to the router.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Capabilities {
    /// Model ids this backend serves
    pub models: HashSet<String>,
    /// Capability tags, e.g. "chat", "vision", "long-context"
    pub tags: HashSet<String>,
    /// Whether the backend can stream responses
    pub supports_streaming: bool,
    /// Per-model context window sizes, where known
    pub max_context: HashMap<String, u32>,
}

/// Result of a health probe.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub latency_ms: u64,
    /// Present when unhealthy, explaining why
    pub reason: Option<String>,
}

impl HealthReport {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms,
            reason: None,
        }
    }

    pub fn unhealthy(latency_ms: u64, reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms,
            reason: Some(reason.into()),
        }
    }
}

/// Uniform interface over one upstream inference backend.
#[async_trait::async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Stable adapter kind name, e.g. "openai_compat".
    fn name(&self) -> &str;

    /// What the backend advertises.
    fn capabilities(&self) -> Capabilities;

    /// Cheap, time-bounded liveness check.
    async fn health_probe(&self, ctx: &RequestContext) -> Result<HealthReport, AdapterError>;

    /// One completion attempt. The adapter must observe the context's
    /// deadline and cancellation token.
    async fn chat(
        &self,
        ctx: &RequestContext,
        request: ChatRequest,
    ) -> Result<ChatResponse, AdapterError>;
}
