//! Scripted in-process adapter for local development and tests.
//!
//! Keyless. Behavior is driven by a script of steps consumed one per
//! call: succeed after a delay, fail with a chosen error, or sleep past
//! any reasonable timeout. With an empty script every call succeeds
//! immediately with a canned reply.

use crate::adapters::{Capabilities, ChatAdapter, HealthReport};
use crate::context::RequestContext;
use crate::error::AdapterError;
use crate::models::{ChatRequest, ChatResponse, FinishReason, Usage};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One scripted behavior, consumed per chat call.
#[derive(Debug)]
pub enum StubStep {
    /// Respond with this content after the given delay
    Reply { content: String, delay: Duration },
    /// Fail with the given error after the given delay
    Fail {
        error: fn() -> AdapterError,
        delay: Duration,
    },
    /// Sleep this long, then reply (used to trigger attempt timeouts)
    Hang { delay: Duration },
}

/// Scripted adapter; call behaviors pop from the front of the script.
pub struct StubAdapter {
    model: String,
    tags: HashSet<String>,
    script: Mutex<VecDeque<StubStep>>,
    calls: AtomicUsize,
    probe_healthy: bool,
}

impl StubAdapter {
    pub fn new(model: impl Into<String>) -> Self {
        let mut tags = HashSet::new();
        tags.insert("chat".to_string());
        Self {
            model: model.into(),
            tags,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            probe_healthy: true,
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn with_script(self, steps: impl IntoIterator<Item = StubStep>) -> Self {
        self.script.lock().unwrap().extend(steps);
        self
    }

    pub fn with_probe_healthy(mut self, healthy: bool) -> Self {
        self.probe_healthy = healthy;
        self
    }

    /// Number of chat calls that reached this adapter.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn canned_reply(&self, request: &ChatRequest) -> ChatResponse {
        let input = crate::models::estimate_tokens(&request.messages);
        ChatResponse {
            content: "ok".to_string(),
            model: self.model.clone(),
            usage: Usage::new(input, 1),
            finish_reason: FinishReason::Stop,
        }
    }
}

#[async_trait::async_trait]
impl ChatAdapter for StubAdapter {
    fn name(&self) -> &str {
        "stub"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            models: HashSet::from([self.model.clone()]),
            tags: self.tags.clone(),
            supports_streaming: false,
            max_context: HashMap::from([(self.model.clone(), 8192)]),
        }
    }

    async fn health_probe(&self, _ctx: &RequestContext) -> Result<HealthReport, AdapterError> {
        if self.probe_healthy {
            Ok(HealthReport::healthy(1))
        } else {
            Ok(HealthReport::unhealthy(1, "scripted unhealthy"))
        }
    }

    async fn chat(
        &self,
        ctx: &RequestContext,
        request: ChatRequest,
    ) -> Result<ChatResponse, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front();

        let (delay, outcome) = match step {
            None => (Duration::ZERO, Ok(self.canned_reply(&request))),
            Some(StubStep::Reply { content, delay }) => {
                let mut reply = self.canned_reply(&request);
                reply.content = content;
                (delay, Ok(reply))
            }
            Some(StubStep::Fail { error, delay }) => (delay, Err(error())),
            Some(StubStep::Hang { delay }) => (delay, Ok(self.canned_reply(&request))),
        };

        if !delay.is_zero() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(AdapterError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        outcome
    }
}
