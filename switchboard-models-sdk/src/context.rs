//! # Request Context
//!
//! A single context value carried through every layer of a request:
//! correlation id for tracing, an absolute deadline, and a cancellation
//! token. Every I/O call observes the context instead of threading
//! callbacks or per-layer timeouts.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-request context: correlation id, deadline, cancellation.
///
/// The context is cheap to clone; clones share the same cancellation
/// token, so canceling the caller's handle cancels every in-flight
/// operation that observes it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id propagated into logs and error payloads
    pub request_id: String,
    /// Absolute deadline for the whole request, if any
    pub deadline: Option<Instant>,
    /// Cooperative cancellation signal
    pub cancel: CancellationToken,
    started_at: Instant,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            deadline: None,
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    /// Context with an absolute deadline `budget` from now.
    pub fn with_deadline(budget: Duration) -> Self {
        let mut ctx = Self::new();
        ctx.deadline = Some(ctx.started_at + budget);
        ctx
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Time left before the deadline, `None` when no deadline is set.
    /// Returns `Some(ZERO)` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// True once the deadline has passed.
    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Elapsed wall time since the context was created.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_expiry() {
        let ctx = RequestContext::with_deadline(Duration::from_secs(10));
        assert!(!ctx.expired());
        assert!(ctx.remaining().unwrap() <= Duration::from_secs(10));

        let expired = RequestContext::with_deadline(Duration::ZERO);
        assert!(expired.expired());
    }

    #[test]
    fn no_deadline_never_expires() {
        let ctx = RequestContext::new();
        assert!(ctx.remaining().is_none());
        assert!(!ctx.expired());
    }

    #[test]
    fn cancellation_is_shared_across_clones() {
        let ctx = RequestContext::new();
        let clone = ctx.clone();
        ctx.cancel.cancel();
        assert!(clone.is_cancelled());
    }
}
