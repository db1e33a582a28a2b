//! # Provider Registry
//!
//! Owns the set of provider runtimes: the adapter instance plus the
//! per-provider circuit breaker, bulkhead, metrics window and cached
//! health state. The registry hands out immutable snapshots; `reload`
//! swaps the snapshot atomically while in-flight requests continue
//! against the one they captured.
//!
//! Loading is partial by design: a provider whose adapter cannot be
//! constructed (missing credential, malformed endpoint) is registered as
//! disabled with a reason instead of failing the whole registry.
//!
//! Health is sampled lazily with a TTL: the first reader after expiry
//! probes the adapter (time-bounded), concurrent readers share the
//! in-flight probe, and a failed probe marks the provider unhealthy
//! without touching its circuit breaker.

use crate::config::{AdapterKind, HealthConfig, ProviderEntry, ProviderStatus, RouterConfig};
use crate::telemetry::{MetricsWindow, WindowStats};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use switchboard_models_sdk::adapters::openai_compat::{OpenAiCompatAdapter, OpenAiCompatConfig};
use switchboard_models_sdk::adapters::stub::StubAdapter;
use switchboard_models_sdk::adapters::ChatAdapter;
use switchboard_models_sdk::bulkhead::Bulkhead;
use switchboard_models_sdk::circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
};
use switchboard_models_sdk::context::RequestContext;

/// Immutable provider configuration, resolved from one config entry.
/// The credential itself is never stored here, only the env handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub kind: AdapterKind,
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
    pub models: BTreeSet<String>,
    pub capabilities: BTreeSet<String>,
    pub cost_input_per_1k: f64,
    pub cost_output_per_1k: f64,
    pub default_timeout_ms: u64,
    pub max_concurrent: usize,
    pub latency_threshold_ms: u64,
    pub status: ProviderStatus,
}

impl ProviderDescriptor {
    pub fn from_entry(id: &str, entry: &ProviderEntry) -> Self {
        Self {
            id: id.to_string(),
            kind: entry.kind,
            endpoint: entry.endpoint.clone(),
            api_key_env: entry.api_key_env.clone(),
            models: entry.models.iter().cloned().collect(),
            capabilities: entry.capabilities.iter().cloned().collect(),
            cost_input_per_1k: entry.cost_input_per_1k,
            cost_output_per_1k: entry.cost_output_per_1k,
            default_timeout_ms: entry.default_timeout_ms,
            max_concurrent: entry.max_concurrent,
            latency_threshold_ms: entry.latency_threshold_ms,
            status: entry.status,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Expected USD cost of a request against this provider.
    pub fn expected_cost(&self, tokens_in: u32, tokens_out: u32) -> f64 {
        (tokens_in as f64 / 1000.0) * self.cost_input_per_1k
            + (tokens_out as f64 / 1000.0) * self.cost_output_per_1k
    }
}

/// Most recent health probe result, cached with a TTL.
#[derive(Debug, Clone)]
pub struct HealthSample {
    pub healthy: bool,
    pub latency_ms: u64,
    pub reason: Option<String>,
    pub taken_at: Instant,
}

/// TTL'd, single-flight health cache for one provider.
pub struct HealthCache {
    ttl: Duration,
    probe_timeout: Duration,
    state: Mutex<Option<HealthSample>>,
    probe_gate: tokio::sync::Mutex<()>,
}

impl HealthCache {
    fn new(ttl: Duration, probe_timeout: Duration) -> Self {
        Self {
            ttl,
            probe_timeout,
            state: Mutex::new(None),
            probe_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn fresh(&self) -> Option<HealthSample> {
        self.state
            .lock()
            .expect("health lock poisoned")
            .clone()
            .filter(|s| s.taken_at.elapsed() < self.ttl)
    }

    /// Most recent sample regardless of freshness.
    pub fn last(&self) -> Option<HealthSample> {
        self.state.lock().expect("health lock poisoned").clone()
    }

    /// Return a fresh sample, probing at most once across concurrent
    /// callers. A probe error or timeout yields an unhealthy sample.
    pub async fn ensure_fresh(&self, adapter: &Arc<dyn ChatAdapter>) -> HealthSample {
        if let Some(sample) = self.fresh() {
            return sample;
        }

        let _gate = self.probe_gate.lock().await;
        // Another caller may have probed while we waited for the gate.
        if let Some(sample) = self.fresh() {
            return sample;
        }

        let ctx = RequestContext::with_deadline(self.probe_timeout);
        let sample = match tokio::time::timeout(self.probe_timeout, adapter.health_probe(&ctx)).await
        {
            Ok(Ok(report)) => HealthSample {
                healthy: report.healthy,
                latency_ms: report.latency_ms,
                reason: report.reason,
                taken_at: Instant::now(),
            },
            Ok(Err(error)) => HealthSample {
                healthy: false,
                latency_ms: self.probe_timeout.as_millis() as u64,
                reason: Some(error.to_string()),
                taken_at: Instant::now(),
            },
            Err(_) => HealthSample {
                healthy: false,
                latency_ms: self.probe_timeout.as_millis() as u64,
                reason: Some("health probe timed out".to_string()),
                taken_at: Instant::now(),
            },
        };

        *self.state.lock().expect("health lock poisoned") = Some(sample.clone());
        sample
    }
}

/// One provider's live state: adapter plus fault-isolation primitives.
pub struct ProviderRuntime {
    pub descriptor: ProviderDescriptor,
    adapter: Option<Arc<dyn ChatAdapter>>,
    pub breaker: CircuitBreaker,
    pub bulkhead: Bulkhead,
    pub metrics: MetricsWindow,
    pub health: HealthCache,
    pub disabled_reason: Option<String>,
}

impl ProviderRuntime {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// `None` only for providers disabled at load time.
    pub fn adapter(&self) -> Option<&Arc<dyn ChatAdapter>> {
        self.adapter.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.descriptor.status == ProviderStatus::Active && self.adapter.is_some()
    }
}

/// Filter for [`Registry::list`].
#[derive(Debug, Clone, Default)]
pub struct ProviderFilter {
    pub capability: Option<String>,
    pub model: Option<String>,
    pub status: Option<ProviderStatus>,
}

impl ProviderFilter {
    fn matches(&self, runtime: &ProviderRuntime) -> bool {
        if let Some(capability) = &self.capability {
            if !runtime.descriptor.capabilities.contains(capability) {
                return false;
            }
        }
        if let Some(model) = &self.model {
            if !runtime.descriptor.models.contains(model) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if runtime.descriptor.status != status {
                return false;
            }
        }
        true
    }
}

/// Per-provider line in a status report.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatusReport {
    pub id: String,
    pub status: ProviderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    pub circuit: BreakerSnapshot,
    pub healthy: Option<bool>,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub window: WindowStats,
}

struct Snapshot {
    providers: BTreeMap<String, Arc<ProviderRuntime>>,
}

/// The registry: a swappable snapshot of provider runtimes.
pub struct Registry {
    snapshot: tokio::sync::RwLock<Arc<Snapshot>>,
    breaker_config: CircuitBreakerConfig,
    health_config: HealthConfig,
    /// Adapter instances injected by the embedder (tests, custom
    /// backends); they take precedence over kind-based construction.
    overrides: HashMap<String, Arc<dyn ChatAdapter>>,
    warmup_last: Mutex<Option<Instant>>,
}

impl Registry {
    pub fn load(config: &RouterConfig) -> Self {
        Self::load_with(config, HashMap::new())
    }

    /// Load with injected adapter instances for specific provider ids.
    pub fn load_with(
        config: &RouterConfig,
        overrides: HashMap<String, Arc<dyn ChatAdapter>>,
    ) -> Self {
        let breaker_config = config.breaker.to_breaker_config();
        let snapshot = build_snapshot(config, &breaker_config, &config.health, &overrides);
        Self {
            snapshot: tokio::sync::RwLock::new(Arc::new(snapshot)),
            breaker_config,
            health_config: config.health,
            overrides,
            warmup_last: Mutex::new(None),
        }
    }

    /// Atomically swap in a new snapshot built from `config`. Providers
    /// whose descriptor is unchanged keep their runtime (circuit state,
    /// metrics, cached health); changed or new ones start fresh.
    pub async fn reload(&self, config: &RouterConfig) {
        let fresh = build_snapshot(
            config,
            &self.breaker_config,
            &self.health_config,
            &self.overrides,
        );

        let current = self.snapshot.read().await.clone();
        let mut merged = BTreeMap::new();
        for (id, runtime) in fresh.providers {
            match current.providers.get(&id) {
                Some(existing) if existing.descriptor == runtime.descriptor => {
                    merged.insert(id, Arc::clone(existing));
                }
                _ => {
                    merged.insert(id, runtime);
                }
            }
        }

        *self.snapshot.write().await = Arc::new(Snapshot { providers: merged });
        tracing::info!("registry reloaded");
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ProviderRuntime>> {
        self.snapshot.read().await.providers.get(id).cloned()
    }

    pub async fn list(&self, filter: &ProviderFilter) -> Vec<Arc<ProviderRuntime>> {
        self.snapshot
            .read()
            .await
            .providers
            .values()
            .filter(|runtime| filter.matches(runtime))
            .cloned()
            .collect()
    }

    /// Every runtime in the current snapshot, in id order.
    pub async fn all(&self) -> Vec<Arc<ProviderRuntime>> {
        self.snapshot.read().await.providers.values().cloned().collect()
    }

    /// Refresh (TTL-gated, single-flight) health for all active
    /// providers, concurrently.
    pub async fn refresh_health(&self) {
        let runtimes = self.all().await;
        let probes = runtimes.iter().filter_map(|runtime| {
            let adapter = runtime.adapter()?;
            if runtime.descriptor.status == ProviderStatus::Disabled {
                return None;
            }
            Some(runtime.health.ensure_fresh(adapter))
        });
        futures::future::join_all(probes).await;
    }

    /// Providers whose latest health sample is healthy and whose circuit
    /// admits traffic.
    pub async fn healthy_providers(&self) -> Vec<Arc<ProviderRuntime>> {
        self.refresh_health().await;
        self.all()
            .await
            .into_iter()
            .filter(|runtime| {
                runtime.is_active()
                    && runtime.health.last().map(|s| s.healthy).unwrap_or(false)
                    && !runtime.breaker.is_open()
                    && !runtime.breaker.is_auth_blocked()
            })
            .collect()
    }

    /// Probe cold self-hosted backends in the background, at most once
    /// per warm-up interval.
    pub async fn maybe_warm_up(&self) {
        let interval = Duration::from_secs(self.health_config.warmup_interval_seconds);
        {
            let mut last = self.warmup_last.lock().expect("warmup lock poisoned");
            match *last {
                Some(at) if at.elapsed() < interval => return,
                _ => *last = Some(Instant::now()),
            }
        }

        let targets: Vec<Arc<ProviderRuntime>> = self
            .all()
            .await
            .into_iter()
            .filter(|r| r.is_active() && r.descriptor.capabilities.contains("self-hosted"))
            .collect();
        if targets.is_empty() {
            return;
        }

        tokio::spawn(async move {
            for runtime in targets {
                if let Some(adapter) = runtime.adapter() {
                    let sample = runtime.health.ensure_fresh(adapter).await;
                    tracing::debug!(
                        "warm-up probe for {}: healthy={}",
                        runtime.id(),
                        sample.healthy
                    );
                }
            }
        });
    }

    pub async fn status_report(&self) -> Vec<ProviderStatusReport> {
        self.all()
            .await
            .iter()
            .map(|runtime| ProviderStatusReport {
                id: runtime.id().to_string(),
                status: runtime.descriptor.status,
                disabled_reason: runtime.disabled_reason.clone(),
                circuit: runtime.breaker.snapshot(),
                healthy: runtime.health.last().map(|s| s.healthy),
                in_flight: runtime.bulkhead.in_flight(),
                max_concurrent: runtime.bulkhead.max_permits(),
                window: runtime.metrics.stats(),
            })
            .collect()
    }
}

fn build_snapshot(
    config: &RouterConfig,
    breaker_config: &CircuitBreakerConfig,
    health_config: &HealthConfig,
    overrides: &HashMap<String, Arc<dyn ChatAdapter>>,
) -> Snapshot {
    let mut providers = BTreeMap::new();
    for (id, entry) in &config.providers {
        let runtime = build_runtime(id, entry, breaker_config, health_config, overrides);
        providers.insert(id.clone(), Arc::new(runtime));
    }
    Snapshot { providers }
}

fn build_runtime(
    id: &str,
    entry: &ProviderEntry,
    breaker_config: &CircuitBreakerConfig,
    health_config: &HealthConfig,
    overrides: &HashMap<String, Arc<dyn ChatAdapter>>,
) -> ProviderRuntime {
    let mut descriptor = ProviderDescriptor::from_entry(id, entry);
    let (adapter, disabled_reason) = if descriptor.status == ProviderStatus::Disabled {
        (None, Some("disabled by configuration".to_string()))
    } else if let Some(adapter) = overrides.get(id) {
        (Some(Arc::clone(adapter)), None)
    } else {
        match construct_adapter(&descriptor) {
            Ok(adapter) => (Some(adapter), None),
            Err(reason) => {
                tracing::warn!("provider {} disabled at load: {}", id, reason);
                descriptor.status = ProviderStatus::Disabled;
                (None, Some(reason))
            }
        }
    };

    ProviderRuntime {
        breaker: CircuitBreaker::new(id, breaker_config.clone()),
        bulkhead: Bulkhead::new(descriptor.max_concurrent),
        metrics: MetricsWindow::new(),
        health: HealthCache::new(
            Duration::from_secs(health_config.ttl_seconds),
            Duration::from_millis(health_config.probe_timeout_ms),
        ),
        descriptor,
        adapter,
        disabled_reason,
    }
}

fn construct_adapter(descriptor: &ProviderDescriptor) -> Result<Arc<dyn ChatAdapter>, String> {
    match descriptor.kind {
        AdapterKind::Stub => {
            let model = descriptor
                .models
                .iter()
                .next()
                .cloned()
                .unwrap_or_else(|| "stub-model".to_string());
            Ok(Arc::new(
                StubAdapter::new(model).with_tags(descriptor.capabilities.iter().cloned()),
            ))
        }
        AdapterKind::OpenaiCompat => {
            let endpoint = descriptor
                .endpoint
                .clone()
                .ok_or_else(|| "missing endpoint".to_string())?;
            let api_key = match &descriptor.api_key_env {
                Some(env_name) => Some(std::env::var(env_name).map_err(|_| {
                    format!("credential environment variable {env_name} is unset")
                })?),
                None => None,
            };
            let adapter = OpenAiCompatAdapter::new(OpenAiCompatConfig {
                endpoint,
                api_key,
                timeout: descriptor.default_timeout(),
                models: descriptor.models.iter().cloned().collect(),
                tags: descriptor.capabilities.iter().cloned().collect(),
                max_context: HashMap::new(),
            })
            .map_err(|e| e.to_string())?;
            Ok(Arc::new(adapter))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;

    fn stub_config(ids: &[&str]) -> RouterConfig {
        let mut toml = String::new();
        for id in ids {
            toml.push_str(&format!(
                "[providers.{id}]\nkind = \"stub\"\nmodels = [\"m-{id}\"]\n\n"
            ));
        }
        RouterConfig::from_toml(&toml).unwrap()
    }

    #[test]
    fn descriptor_round_trips_through_serde() {
        let config = stub_config(&["alpha"]);
        let descriptor = ProviderDescriptor::from_entry("alpha", &config.providers["alpha"]);

        let json = serde_json::to_string(&descriptor).unwrap();
        let parsed: ProviderDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(descriptor, parsed);
    }

    #[tokio::test]
    async fn partial_load_disables_broken_providers() {
        let toml = r#"
            [providers.good]
            kind = "stub"
            models = ["m"]

            [providers.broken]
            kind = "openai_compat"
            endpoint = "https://api.example.com/v1"
            api_key_env = "SWITCHBOARD_TEST_UNSET_KEY"
            models = ["m"]
        "#;
        let config = RouterConfig::from_toml(toml).unwrap();
        let registry = Registry::load(&config);

        let good = registry.get("good").await.unwrap();
        assert!(good.is_active());

        let broken = registry.get("broken").await.unwrap();
        assert!(!broken.is_active());
        assert_eq!(broken.descriptor.status, ProviderStatus::Disabled);
        assert!(broken
            .disabled_reason
            .as_ref()
            .unwrap()
            .contains("SWITCHBOARD_TEST_UNSET_KEY"));
    }

    #[tokio::test]
    async fn list_filters_by_model_and_status() {
        let registry = Registry::load(&stub_config(&["alpha", "beta"]));

        let by_model = registry
            .list(&ProviderFilter {
                model: Some("m-alpha".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(by_model.len(), 1);
        assert_eq!(by_model[0].id(), "alpha");

        let active = registry
            .list(&ProviderFilter {
                status: Some(ProviderStatus::Active),
                ..Default::default()
            })
            .await;
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn reload_preserves_runtime_for_unchanged_descriptors() {
        let config = stub_config(&["alpha"]);
        let registry = Registry::load(&config);

        let runtime = registry.get("alpha").await.unwrap();
        runtime.breaker.record_failure();
        runtime.breaker.record_failure();

        registry.reload(&config).await;
        let after = registry.get("alpha").await.unwrap();
        assert_eq!(after.breaker.snapshot().failure_count, 2);
        assert!(Arc::ptr_eq(&runtime, &after));
    }

    #[tokio::test]
    async fn reload_rebuilds_changed_descriptors() {
        let registry = Registry::load(&stub_config(&["alpha"]));
        registry.get("alpha").await.unwrap().breaker.record_failure();

        let changed = RouterConfig::from_toml(
            "[providers.alpha]\nkind = \"stub\"\nmodels = [\"m-alpha\", \"m-extra\"]\n",
        )
        .unwrap();
        registry.reload(&changed).await;

        let after = registry.get("alpha").await.unwrap();
        assert_eq!(after.breaker.snapshot().failure_count, 0);
        assert!(after.descriptor.models.contains("m-extra"));
    }

    #[tokio::test]
    async fn health_cache_is_single_flight_within_ttl() {
        let registry = Registry::load(&stub_config(&["alpha"]));
        let runtime = registry.get("alpha").await.unwrap();
        let adapter = runtime.adapter().unwrap();

        let first = runtime.health.ensure_fresh(adapter).await;
        assert!(first.healthy);
        let taken_at = first.taken_at;

        // Within the TTL the cached sample is returned, no new probe.
        let second = runtime.health.ensure_fresh(adapter).await;
        assert_eq!(second.taken_at, taken_at);
    }

    #[tokio::test]
    async fn healthy_providers_excludes_unhealthy_and_open_circuits() {
        use switchboard_models_sdk::adapters::stub::StubAdapter;

        let config = stub_config(&["alpha", "beta", "gamma"]);
        let mut overrides: HashMap<String, Arc<dyn ChatAdapter>> = HashMap::new();
        overrides.insert(
            "beta".to_string(),
            Arc::new(StubAdapter::new("m-beta").with_probe_healthy(false)),
        );
        let registry = Registry::load_with(&config, overrides);

        let gamma = registry.get("gamma").await.unwrap();
        for _ in 0..5 {
            gamma.breaker.record_failure();
        }

        let healthy = registry.healthy_providers().await;
        let ids: Vec<&str> = healthy.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["alpha"]);
    }

    #[tokio::test]
    async fn expected_cost_uses_both_rates() {
        let toml = r#"
            [providers.priced]
            kind = "stub"
            models = ["m"]
            cost_input_per_1k = 1.0
            cost_output_per_1k = 2.0
        "#;
        let registry = Registry::load(&RouterConfig::from_toml(toml).unwrap());
        let runtime = registry.get("priced").await.unwrap();
        let cost = runtime.descriptor.expected_cost(500, 1000);
        assert!((cost - 2.5).abs() < 1e-9);
    }
}
