//! # Switchboard Models SDK
//!
//! The provider-facing layer of the Switchboard router: a wire-agnostic
//! chat data model, the [`ChatAdapter`](adapters::ChatAdapter) capability
//! contract every backend integration implements, a classified error
//! taxonomy, and the per-provider resilience primitives the router
//! composes (circuit breaker, bulkhead, backoff policy).
//!
//! Two adapters ship with the SDK:
//!
//! - [`adapters::openai_compat`] — a generic HTTP adapter for any backend
//!   speaking the OpenAI chat-completions dialect.
//! - [`adapters::stub`] — a scripted in-process adapter for local
//!   development and tests.
//!
//! Everything here is consumed by the `switchboard-router` crate; nothing
//! in this crate routes or keeps cross-provider state.

pub mod adapters;
pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod context;
pub mod error;
pub mod models;

pub use adapters::{Capabilities, ChatAdapter, HealthReport};
pub use backoff::BackoffPolicy;
pub use bulkhead::{Bulkhead, BulkheadExceeded, BulkheadPermit};
pub use circuit_breaker::{
    BreakerRejection, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use context::RequestContext;
pub use error::{AdapterError, ErrorKind};
pub use models::{ChatRequest, ChatResponse, FinishReason, Message, Role, Usage};
