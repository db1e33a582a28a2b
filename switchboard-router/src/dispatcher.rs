//! # Router / Dispatcher
//!
//! The request path from admission to response: validate → gateway risk
//! check → rate limit → build the fallback chain → walk it. Per
//! candidate the dispatcher consults the circuit breaker, takes a
//! bulkhead permit, and runs the adapter call under the tighter of the
//! provider timeout and the remaining request deadline. Failures are
//! classified by their [`ErrorKind`] tag: auth failures soft-disable the
//! provider, transient kinds may retry in place with capped backoff,
//! everything else advances the chain.
//!
//! This module is the only writer of circuit-breaker and metrics state;
//! every other component observes.

use crate::config::{LimitsConfig, RouterConfig};
use crate::policy::{PolicyEngine, RejectedProvider, SkipReason};
use crate::ratelimit::RateLimiter;
use crate::registry::{ProviderRuntime, ProviderStatusReport, Registry};
use crate::request::RouteRequest;
use crate::router_error::{ProviderFailure, RouterError};
use crate::telemetry::{CallOutcome, WindowStats};
use crate::validation::RequestValidator;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_models_sdk::adapters::ChatAdapter;
use switchboard_models_sdk::backoff::BackoffPolicy;
use switchboard_models_sdk::context::RequestContext;
use switchboard_models_sdk::error::{AdapterError, ErrorKind};
use switchboard_models_sdk::models::{estimate_tokens, ChatRequest, ChatResponse};

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// Requests under these sizes take the shorter fast-path deadline.
const SIMPLE_PROMPT_BYTES: usize = 2048;
const SIMPLE_MAX_TOKENS: u32 = 1024;

/// What happened at one provider, in consult order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum TraceDisposition {
    /// Dropped by the policy filter before dispatch
    FilteredOut { reason: SkipReason },
    /// Breaker rejected the call
    SkippedCircuitOpen,
    /// Provider is inside its auth-block cooldown
    SkippedAuthBlocked,
    /// No bulkhead permit available
    SkippedBulkheadFull,
    /// Dispatched and failed after `attempts` tries
    Failed { kind: ErrorKind, attempts: u32 },
    /// Canceled while this provider's attempt was in flight
    Canceled { attempts: u32 },
    /// Served the request
    Chosen {
        score: f64,
        latency_ms: u64,
        attempts: u32,
    },
}

/// One consulted provider in the decision trace.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub provider_id: String,
    #[serde(flatten)]
    pub disposition: TraceDisposition,
}

/// Ordered record of every provider considered for a request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DecisionTrace {
    pub entries: Vec<TraceEntry>,
}

impl DecisionTrace {
    fn push(&mut self, provider_id: &str, disposition: TraceDisposition) {
        self.entries.push(TraceEntry {
            provider_id: provider_id.to_string(),
            disposition,
        });
    }
}

/// Telemetry summary of the winning attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub provider_id: String,
    pub model: String,
    pub latency_ms: u64,
    pub ok: bool,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// 0-based index of the attempt that produced the response
    pub attempt_index: u32,
    /// 0-based position of the serving provider in the fallback chain
    pub fallback_level: usize,
}

/// A routed response plus its routing metadata.
#[derive(Debug)]
pub struct RouteResult {
    pub response: ChatResponse,
    pub trace: DecisionTrace,
    pub outcome: RequestOutcome,
}

/// Operational status surface for the layer above.
#[derive(Debug, Serialize)]
pub struct RouterStatus {
    pub providers: Vec<ProviderStatusReport>,
}

/// Per-provider window aggregates, keyed by provider id.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub providers: BTreeMap<String, WindowStats>,
}

/// How one candidate's attempt loop ended.
enum CandidateOutcome {
    Success {
        response: ChatResponse,
        latency_ms: u64,
        attempt: u32,
    },
    Failed {
        error: AdapterError,
        attempts: u32,
    },
    Canceled {
        latency_ms: u64,
        attempts: u32,
        /// Whether the cancellation interrupted an in-flight adapter
        /// call (false: it landed between attempts, during backoff)
        in_flight: bool,
    },
    DeadlineExhausted,
}

/// The policy-driven multi-provider dispatcher.
pub struct Router {
    registry: Arc<Registry>,
    policy: PolicyEngine,
    ratelimit: Arc<RateLimiter>,
    validator: RequestValidator,
    backoff: BackoffPolicy,
    limits: LimitsConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> anyhow::Result<Self> {
        Self::with_adapters(config, HashMap::new())
    }

    /// Construct with injected adapter instances (tests, embedders with
    /// custom backends); injected ids take precedence over kind-based
    /// adapter construction.
    pub fn with_adapters(
        config: RouterConfig,
        adapters: HashMap<String, Arc<dyn ChatAdapter>>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let policy = PolicyEngine::from_config(&config.policy)?;
        let registry = Arc::new(Registry::load_with(&config, adapters));
        let ratelimit = Arc::new(RateLimiter::new(config.ratelimit));

        // Background bucket sweep; skipped when constructed outside a
        // runtime (unit tests of non-async surfaces).
        if tokio::runtime::Handle::try_current().is_ok() {
            ratelimit.spawn_sweeper(SWEEP_INTERVAL);
        }

        Ok(Self {
            registry,
            policy,
            ratelimit,
            validator: RequestValidator::new(config.limits),
            backoff: config.retry.to_backoff_policy(),
            limits: config.limits,
        })
    }

    /// Atomically swap provider config; in-flight requests finish
    /// against the snapshot they captured.
    pub async fn reload(&self, config: &RouterConfig) -> anyhow::Result<()> {
        config.validate()?;
        self.registry.reload(config).await;
        Ok(())
    }

    pub async fn status(&self) -> RouterStatus {
        RouterStatus {
            providers: self.registry.status_report().await,
        }
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        let providers = self
            .registry
            .all()
            .await
            .iter()
            .map(|runtime| (runtime.id().to_string(), runtime.metrics.stats()))
            .collect();
        MetricsSnapshot { providers }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Admission, selection, execution and fallback for one request.
    pub async fn route(
        &self,
        ctx: &RequestContext,
        mut request: RouteRequest,
    ) -> Result<RouteResult, RouterError> {
        if ctx.is_cancelled() {
            return Err(RouterError::Canceled);
        }

        if request.identity.session_id.is_empty() {
            return Err(RouterError::Unauthorized {
                message: "session id is required".to_string(),
            });
        }

        self.validator
            .validate(&request)
            .map_err(RouterError::Validation)?;

        let assessment = self.validator.assess(&request.messages);
        if assessment.risk_score >= self.validator.risk_threshold() {
            tracing::warn!(
                request_id = %ctx.request_id,
                risk_score = assessment.risk_score,
                "gateway denied request"
            );
            return Err(RouterError::GatewayDenied {
                risk_score: assessment.risk_score,
            });
        }
        // Classified intent becomes part of the normalized request; it
        // is a routing hint, never a gate.
        if request.intent.is_none() {
            request.intent = Some(assessment.intent);
        }

        // Rate limiting runs before any provider work; a denial never
        // reaches an adapter.
        self.ratelimit
            .check(&request.identity)
            .map_err(|denied| RouterError::RateLimited {
                scope: denied.scope,
                window: denied.window,
                retry_after: denied.retry_after,
            })?;

        let deadline = self.compute_deadline(ctx, &request);

        self.registry.maybe_warm_up().await;
        self.registry.refresh_health().await;
        let providers = self.registry.all().await;

        let prompt_tokens = estimate_tokens(&request.messages);
        let decision = self.policy.plan(&request, &providers, prompt_tokens);

        let mut trace = DecisionTrace::default();
        for rejected in &decision.rejected {
            trace.push(
                &rejected.provider_id,
                TraceDisposition::FilteredOut {
                    reason: rejected.reason,
                },
            );
        }

        if decision.candidates.is_empty() {
            return Err(RouterError::NoProviderAvailable {
                rejected: decision.rejected,
            });
        }

        let mut failures: Vec<ProviderFailure> = Vec::new();

        for (fallback_level, candidate) in decision.candidates.iter().enumerate() {
            let runtime = &candidate.runtime;

            if Instant::now() >= deadline {
                tracing::debug!(
                    request_id = %ctx.request_id,
                    "deadline exceeded before trying {}",
                    runtime.id()
                );
                return Err(RouterError::DeadlineExceeded);
            }
            if ctx.is_cancelled() {
                return Err(RouterError::Canceled);
            }

            match runtime.breaker.before_call() {
                Err(rejection) => {
                    use switchboard_models_sdk::circuit_breaker::BreakerRejection;
                    let disposition = match rejection {
                        BreakerRejection::Open { .. } => TraceDisposition::SkippedCircuitOpen,
                        BreakerRejection::AuthBlocked { .. } => TraceDisposition::SkippedAuthBlocked,
                    };
                    trace.push(runtime.id(), disposition);
                    continue;
                }
                Ok(()) => {}
            }

            // A full bulkhead is a routing signal, not a provider
            // failure; the breaker is untouched.
            let _permit = match runtime.bulkhead.try_acquire() {
                Ok(permit) => permit,
                Err(_) => {
                    trace.push(runtime.id(), TraceDisposition::SkippedBulkheadFull);
                    continue;
                }
            };

            let wire_request = self.build_wire_request(&request, runtime);

            match self
                .attempt_candidate(ctx, runtime, &wire_request, deadline, request.idempotent)
                .await
            {
                CandidateOutcome::Success {
                    response,
                    latency_ms,
                    attempt,
                } => {
                    let cost_usd = runtime
                        .descriptor
                        .expected_cost(response.usage.input_tokens, response.usage.output_tokens);
                    runtime.breaker.record_success();
                    runtime.metrics.record(CallOutcome::success(
                        latency_ms,
                        response.usage.input_tokens,
                        response.usage.output_tokens,
                        cost_usd,
                    ));
                    trace.push(
                        runtime.id(),
                        TraceDisposition::Chosen {
                            score: candidate.score,
                            latency_ms,
                            attempts: attempt + 1,
                        },
                    );
                    let outcome = RequestOutcome {
                        provider_id: runtime.id().to_string(),
                        model: response.model.clone(),
                        latency_ms,
                        ok: true,
                        tokens_in: response.usage.input_tokens,
                        tokens_out: response.usage.output_tokens,
                        cost_usd,
                        error_kind: None,
                        attempt_index: attempt,
                        fallback_level,
                    };
                    return Ok(RouteResult {
                        response,
                        trace,
                        outcome,
                    });
                }
                CandidateOutcome::Failed { error, attempts } => {
                    let kind = error.kind();
                    trace.push(runtime.id(), TraceDisposition::Failed { kind, attempts });
                    failures.push(ProviderFailure {
                        provider_id: runtime.id().to_string(),
                        kind,
                        message: error.to_string(),
                    });
                }
                CandidateOutcome::Canceled {
                    latency_ms,
                    attempts,
                    in_flight,
                } => {
                    // Only an interrupted attempt counts as a dispatched
                    // call; cancellation during backoff already has its
                    // failure on the books.
                    if in_flight {
                        runtime.metrics.record(CallOutcome::canceled(latency_ms));
                    }
                    trace.push(runtime.id(), TraceDisposition::Canceled { attempts });
                    return Err(RouterError::Canceled);
                }
                CandidateOutcome::DeadlineExhausted => {
                    return Err(RouterError::DeadlineExceeded);
                }
            }
        }

        // Chain exhausted. Every candidate skipped without a dispatch
        // means "no provider", a trailing timeout surfaces as such, and
        // anything else keeps the full per-provider detail.
        if failures.is_empty() {
            return Err(RouterError::NoProviderAvailable {
                rejected: trace
                    .entries
                    .iter()
                    .filter_map(|entry| {
                        let reason = match entry.disposition {
                            TraceDisposition::FilteredOut { reason } => reason,
                            TraceDisposition::SkippedCircuitOpen => SkipReason::CircuitOpen,
                            TraceDisposition::SkippedAuthBlocked => SkipReason::AuthBlocked,
                            TraceDisposition::SkippedBulkheadFull => SkipReason::BulkheadFull,
                            _ => return None,
                        };
                        Some(RejectedProvider {
                            provider_id: entry.provider_id.clone(),
                            reason,
                        })
                    })
                    .collect(),
            });
        }

        let last = &failures[failures.len() - 1];
        if last.kind == ErrorKind::Timeout {
            return Err(RouterError::ProviderTimeout {
                provider_id: last.provider_id.clone(),
            });
        }
        Err(RouterError::AllProvidersFailed { failures })
    }

    /// Run up to `1 + max_retries` attempts against one provider. The
    /// bulkhead permit is held by the caller for the whole loop; breaker
    /// and metrics records happen here, once per attempt.
    async fn attempt_candidate(
        &self,
        ctx: &RequestContext,
        runtime: &Arc<ProviderRuntime>,
        wire_request: &ChatRequest,
        deadline: Instant,
        idempotent: bool,
    ) -> CandidateOutcome {
        let adapter = match runtime.adapter() {
            Some(adapter) => adapter,
            None => {
                return CandidateOutcome::Failed {
                    error: AdapterError::Configuration {
                        message: "provider has no adapter".to_string(),
                    },
                    attempts: 0,
                }
            }
        };

        let mut attempt: u32 = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return CandidateOutcome::DeadlineExhausted;
            }
            let attempt_timeout = std::cmp::min(runtime.descriptor.default_timeout(), remaining);

            let started = Instant::now();
            let result = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return CandidateOutcome::Canceled {
                        latency_ms: started.elapsed().as_millis() as u64,
                        attempts: attempt + 1,
                        in_flight: true,
                    };
                }
                result = tokio::time::timeout(
                    attempt_timeout,
                    adapter.chat(ctx, wire_request.clone()),
                ) => result,
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            let error = match result {
                Ok(Ok(response)) => {
                    return CandidateOutcome::Success {
                        response,
                        latency_ms,
                        attempt,
                    };
                }
                Ok(Err(error)) if error.kind() == ErrorKind::Canceled => {
                    return CandidateOutcome::Canceled {
                        latency_ms,
                        attempts: attempt + 1,
                        in_flight: true,
                    };
                }
                Ok(Err(error)) => error,
                Err(_elapsed) => AdapterError::Timeout {
                    timeout_ms: attempt_timeout.as_millis() as u64,
                },
            };

            let kind = error.kind();
            tracing::debug!(
                request_id = %ctx.request_id,
                provider = runtime.id(),
                kind = kind.as_str(),
                attempt,
                "attempt failed"
            );

            if kind == ErrorKind::Auth {
                // Retries cannot fix a rejected credential: block the
                // provider for the long cooldown, leave the failure
                // counter alone.
                runtime.breaker.record_auth_failure();
                runtime.metrics.record(CallOutcome::failure(latency_ms, kind));
                return CandidateOutcome::Failed {
                    error,
                    attempts: attempt + 1,
                };
            }

            runtime.breaker.record_failure();
            runtime.metrics.record(CallOutcome::failure(latency_ms, kind));

            let remaining = deadline.saturating_duration_since(Instant::now());
            let may_retry = kind.is_retryable()
                && idempotent
                && attempt < self.backoff.max_retries
                && self.backoff.fits_within(attempt, remaining);
            if !may_retry {
                return CandidateOutcome::Failed {
                    error,
                    attempts: attempt + 1,
                };
            }

            let delay = self.backoff.delay_for(attempt);
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return CandidateOutcome::Canceled {
                        latency_ms,
                        attempts: attempt + 1,
                        in_flight: false,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    fn compute_deadline(&self, ctx: &RequestContext, request: &RouteRequest) -> Instant {
        let ceiling = if self.is_simple_prompt(request) {
            Duration::from_millis(self.limits.fast_path_deadline_ms)
        } else {
            Duration::from_millis(self.limits.max_deadline_ms)
        };
        let budget = request
            .deadline_budget
            .map(|requested| requested.min(ceiling))
            .unwrap_or(ceiling);
        let deadline = Instant::now() + budget;
        match ctx.deadline {
            Some(caller_deadline) => caller_deadline.min(deadline),
            None => deadline,
        }
    }

    fn is_simple_prompt(&self, request: &RouteRequest) -> bool {
        let total_bytes: usize = request.messages.iter().map(|m| m.content.len()).sum();
        total_bytes <= SIMPLE_PROMPT_BYTES
            && request.max_tokens.unwrap_or(SIMPLE_MAX_TOKENS) <= SIMPLE_MAX_TOKENS
    }

    fn build_wire_request(&self, request: &RouteRequest, runtime: &ProviderRuntime) -> ChatRequest {
        let model = request
            .model
            .clone()
            .or_else(|| runtime.descriptor.models.iter().next().cloned())
            .unwrap_or_default();
        ChatRequest {
            model,
            messages: request.messages.clone(),
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            stop: None,
            user: request.identity.user_id.clone(),
        }
    }
}
