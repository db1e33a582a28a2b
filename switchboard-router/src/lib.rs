//! # Switchboard Router
//!
//! A policy-driven dispatcher for multi-provider LLM inference: every
//! incoming chat request is validated, rate-limited, matched against the
//! healthy provider set, and executed down a scored fallback chain with
//! per-provider fault isolation (circuit breaker, bulkhead, timeouts).
//! Per-call telemetry feeds back into the next routing decision.
//!
//! ## Request path
//!
//! ```text
//! validate → gateway risk check → rate limit → policy (filter/score)
//!     → for each candidate: breaker → bulkhead → adapter call
//!     → classify / retry / advance → telemetry → response + trace
//! ```
//!
//! The crate is transport-agnostic: the HTTP surface above it calls
//! [`Router::route`] and renders [`RouterError`] values, which already
//! map to HTTP statuses and RFC 7807 problem documents.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use switchboard_router::{Router, RouterConfig, RouteRequest};
//! use switchboard_models_sdk::context::RequestContext;
//! use switchboard_models_sdk::models::Message;
//!
//! let config = RouterConfig::load("switchboard.toml")?;
//! let router = Router::new(config)?;
//!
//! let request = RouteRequest::new("session-1", vec![Message::user("hi")]);
//! let result = router.route(&RequestContext::new(), request).await?;
//! println!("{} via {}", result.response.content, result.outcome.provider_id);
//! ```

pub mod config;
pub mod dispatcher;
pub mod policy;
pub mod ratelimit;
pub mod registry;
pub mod request;
pub mod router_error;
pub mod telemetry;
pub mod validation;

pub use config::{ProviderStatus, RouterConfig};
pub use dispatcher::{
    DecisionTrace, MetricsSnapshot, RequestOutcome, RouteResult, Router, RouterStatus,
    TraceDisposition, TraceEntry,
};
pub use policy::{PolicyEngine, RoutingPolicy, SkipReason};
pub use ratelimit::{LimitWindow, RateLimiter};
pub use registry::{ProviderDescriptor, ProviderFilter, Registry};
pub use request::{Identity, Intent, LatencyPriority, RouteRequest};
pub use router_error::{ProblemDetail, ProviderFailure, RouterError};
pub use validation::{RequestValidator, ValidationError};
