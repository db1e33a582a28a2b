//! # Policy Engine
//!
//! Turns a request plus the current provider snapshot into a ranked
//! fallback chain. Three steps: filter out providers that cannot serve
//! the request (each with a typed reason kept for the decision trace),
//! score the survivors on normalized latency/cost/reliability axes, then
//! sort and truncate to the configured chain depth.

use crate::config::{PolicyConfig, ProviderStatus};
use crate::registry::ProviderRuntime;
use crate::request::RouteRequest;
use serde::Serialize;
use std::sync::Arc;

/// Named weight presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingPolicy {
    LatencyFirst,
    CostFirst,
    Balanced,
}

impl RoutingPolicy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "latency_first" => Some(Self::LatencyFirst),
            "cost_first" => Some(Self::CostFirst),
            "balanced" => Some(Self::Balanced),
            _ => None,
        }
    }

    pub fn weights(self) -> PolicyWeights {
        match self {
            Self::LatencyFirst => PolicyWeights {
                latency: 0.6,
                cost: 0.1,
                reliability: 0.3,
            },
            Self::CostFirst => PolicyWeights {
                latency: 0.1,
                cost: 0.6,
                reliability: 0.3,
            },
            Self::Balanced => PolicyWeights {
                latency: 0.3,
                cost: 0.4,
                reliability: 0.3,
            },
        }
    }
}

/// Scoring weights over the three axes; expected to sum to 1.0.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PolicyWeights {
    pub latency: f64,
    pub cost: f64,
    pub reliability: f64,
}

/// Why a provider was not dispatched: filter-step reasons plus
/// `BulkheadFull`, which the dispatcher emits for candidates skipped at
/// dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingCapability,
    ModelUnavailable,
    NotActive,
    Unhealthy,
    CircuitOpen,
    AuthBlocked,
    BulkheadFull,
}

/// A provider dropped by the filter step, with its reason.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedProvider {
    pub provider_id: String,
    pub reason: SkipReason,
}

/// One ranked fallback candidate.
pub struct Candidate {
    pub runtime: Arc<ProviderRuntime>,
    pub score: f64,
    pub latency_score: f64,
    pub cost_score: f64,
    pub reliability_score: f64,
    pub expected_cost_usd: f64,
}

/// The engine's output: a ranked chain plus rejection reasons.
pub struct RoutingDecision {
    pub candidates: Vec<Candidate>,
    pub rejected: Vec<RejectedProvider>,
}

/// Filter → score → sort → truncate.
pub struct PolicyEngine {
    weights: PolicyWeights,
    chain_depth: usize,
    default_cost_budget: f64,
}

impl PolicyEngine {
    pub fn from_config(config: &PolicyConfig) -> anyhow::Result<Self> {
        let preset = RoutingPolicy::from_name(&config.default)
            .ok_or_else(|| anyhow::anyhow!("unknown routing policy: {}", config.default))?;
        let weights = match config.weights {
            Some(explicit) => PolicyWeights {
                latency: explicit.latency,
                cost: explicit.cost,
                reliability: explicit.reliability,
            },
            None => preset.weights(),
        };
        Ok(Self {
            weights,
            chain_depth: config.chain_depth,
            default_cost_budget: config.default_cost_budget,
        })
    }

    pub fn weights(&self) -> PolicyWeights {
        self.weights
    }

    /// Build the ranked chain for one request. `prompt_tokens` is the
    /// validator's estimate, reused for expected-cost computation.
    pub fn plan(
        &self,
        request: &RouteRequest,
        providers: &[Arc<ProviderRuntime>],
        prompt_tokens: u32,
    ) -> RoutingDecision {
        let mut rejected = Vec::new();
        let mut candidates = Vec::new();

        for runtime in providers {
            if let Some(reason) = self.filter(request, runtime) {
                rejected.push(RejectedProvider {
                    provider_id: runtime.id().to_string(),
                    reason,
                });
                continue;
            }
            candidates.push(self.score(request, runtime, prompt_tokens));
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.expected_cost_usd
                        .partial_cmp(&b.expected_cost_usd)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.runtime.id().cmp(b.runtime.id()))
        });
        candidates.truncate(self.chain_depth);

        RoutingDecision {
            candidates,
            rejected,
        }
    }

    fn filter(&self, request: &RouteRequest, runtime: &ProviderRuntime) -> Option<SkipReason> {
        let descriptor = &runtime.descriptor;

        if descriptor.status != ProviderStatus::Active || runtime.adapter().is_none() {
            return Some(SkipReason::NotActive);
        }

        if !request
            .required_capabilities
            .iter()
            .all(|capability| descriptor.capabilities.contains(capability))
        {
            return Some(SkipReason::MissingCapability);
        }

        if let Some(model) = &request.model {
            if !descriptor.models.contains(model) {
                return Some(SkipReason::ModelUnavailable);
            }
        }

        if runtime.breaker.is_auth_blocked() {
            return Some(SkipReason::AuthBlocked);
        }

        if runtime.breaker.is_open() {
            return Some(SkipReason::CircuitOpen);
        }

        // Only an explicit unhealthy sample rejects; a provider that has
        // never been probed is given the benefit of the doubt.
        if let Some(sample) = runtime.health.last() {
            if !sample.healthy {
                return Some(SkipReason::Unhealthy);
            }
        }

        None
    }

    fn score(
        &self,
        request: &RouteRequest,
        runtime: &Arc<ProviderRuntime>,
        prompt_tokens: u32,
    ) -> Candidate {
        let stats = runtime.metrics.stats();
        let target_ms = request.latency_priority.target_ms() as f64;

        let latency_score = clamp01(1.0 - stats.p95_latency_ms as f64 / target_ms);

        let completion_tokens = request.max_tokens.unwrap_or(256);
        let expected_cost_usd = runtime
            .descriptor
            .expected_cost(prompt_tokens, completion_tokens);
        let budget = request.cost_budget.unwrap_or(self.default_cost_budget);
        let cost_score = if budget > 0.0 {
            clamp01(1.0 - expected_cost_usd / budget)
        } else {
            0.0
        };

        let reliability_score = 1.0 - stats.error_rate_recent;

        let score = self.weights.latency * latency_score
            + self.weights.cost * cost_score
            + self.weights.reliability * reliability_score;

        Candidate {
            runtime: Arc::clone(runtime),
            score,
            latency_score,
            cost_score,
            reliability_score,
            expected_cost_usd,
        }
    }
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::registry::Registry;
    use crate::request::{LatencyPriority, RouteRequest};
    use crate::telemetry::CallOutcome;
    use switchboard_models_sdk::error::ErrorKind;
    use switchboard_models_sdk::models::Message;

    async fn providers_from(toml: &str) -> Vec<Arc<ProviderRuntime>> {
        Registry::load(&RouterConfig::from_toml(toml).unwrap()).all().await
    }

    fn engine() -> PolicyEngine {
        PolicyEngine::from_config(&Default::default()).unwrap()
    }

    fn request() -> RouteRequest {
        RouteRequest::new("s1", vec![Message::user("hi")])
    }

    #[test]
    fn preset_weights_match_policies() {
        let latency = RoutingPolicy::LatencyFirst.weights();
        assert_eq!(
            (latency.latency, latency.cost, latency.reliability),
            (0.6, 0.1, 0.3)
        );
        let cost = RoutingPolicy::CostFirst.weights();
        assert_eq!((cost.latency, cost.cost, cost.reliability), (0.1, 0.6, 0.3));
        let balanced = RoutingPolicy::Balanced.weights();
        assert_eq!(
            (balanced.latency, balanced.cost, balanced.reliability),
            (0.3, 0.4, 0.3)
        );
    }

    #[tokio::test]
    async fn filters_carry_typed_reasons() {
        let providers = providers_from(
            r#"
            [providers.serving]
            kind = "stub"
            models = ["m-wanted"]

            [providers.other_model]
            kind = "stub"
            models = ["m-other"]

            [providers.parked]
            kind = "stub"
            models = ["m-wanted"]
            status = "maintenance"
            "#,
        )
        .await;

        let decision = engine().plan(&request().with_model("m-wanted"), &providers, 10);

        assert_eq!(decision.candidates.len(), 1);
        assert_eq!(decision.candidates[0].runtime.id(), "serving");

        let reasons: Vec<(&str, SkipReason)> = decision
            .rejected
            .iter()
            .map(|r| (r.provider_id.as_str(), r.reason))
            .collect();
        assert!(reasons.contains(&("other_model", SkipReason::ModelUnavailable)));
        assert!(reasons.contains(&("parked", SkipReason::NotActive)));
    }

    #[tokio::test]
    async fn open_circuit_is_filtered() {
        let providers = providers_from(
            "[providers.flaky]\nkind = \"stub\"\nmodels = [\"m\"]\n",
        )
        .await;
        for _ in 0..5 {
            providers[0].breaker.record_failure();
        }

        let decision = engine().plan(&request(), &providers, 10);
        assert!(decision.candidates.is_empty());
        assert_eq!(decision.rejected[0].reason, SkipReason::CircuitOpen);
    }

    #[tokio::test]
    async fn reliability_axis_prefers_cleaner_history() {
        let providers = providers_from(
            r#"
            [providers.clean]
            kind = "stub"
            models = ["m"]

            [providers.dirty]
            kind = "stub"
            models = ["m"]
            "#,
        )
        .await;

        let dirty = providers.iter().find(|p| p.id() == "dirty").unwrap();
        for _ in 0..10 {
            dirty.metrics.record(CallOutcome::failure(50, ErrorKind::Server5xx));
        }

        let decision = engine().plan(&request(), &providers, 10);
        assert_eq!(decision.candidates[0].runtime.id(), "clean");
        assert!(decision.candidates[0].score > decision.candidates[1].score);
    }

    #[tokio::test]
    async fn latency_axis_uses_priority_target() {
        let providers = providers_from(
            "[providers.slow]\nkind = \"stub\"\nmodels = [\"m\"]\n",
        )
        .await;
        // p95 around 900ms.
        for _ in 0..20 {
            providers[0].metrics.record(CallOutcome::success(900, 1, 1, 0.0));
        }

        let strict = engine().plan(
            &request().with_latency_priority(LatencyPriority::UltraLow),
            &providers,
            10,
        );
        let relaxed = engine().plan(
            &request().with_latency_priority(LatencyPriority::High),
            &providers,
            10,
        );

        // 900ms blows a 500ms target entirely but barely dents a 5s one.
        assert_eq!(strict.candidates[0].latency_score, 0.0);
        assert!(relaxed.candidates[0].latency_score > 0.8);
    }

    #[tokio::test]
    async fn ties_break_by_cost_then_id() {
        let providers = providers_from(
            r#"
            [providers.beta]
            kind = "stub"
            models = ["m"]

            [providers.alpha]
            kind = "stub"
            models = ["m"]
            "#,
        )
        .await;

        let decision = engine().plan(&request(), &providers, 10);
        assert_eq!(decision.candidates.len(), 2);
        // Identical scores and costs: deterministic id order wins.
        assert_eq!(decision.candidates[0].runtime.id(), "alpha");
    }

    #[tokio::test]
    async fn chain_truncates_to_configured_depth() {
        let providers = providers_from(
            r#"
            [providers.a]
            kind = "stub"
            models = ["m"]
            [providers.b]
            kind = "stub"
            models = ["m"]
            [providers.c]
            kind = "stub"
            models = ["m"]
            "#,
        )
        .await;

        let config = PolicyConfig {
            chain_depth: 2,
            ..Default::default()
        };
        let engine = PolicyEngine::from_config(&config).unwrap();
        let decision = engine.plan(&request(), &providers, 10);
        assert_eq!(decision.candidates.len(), 2);
    }
}
