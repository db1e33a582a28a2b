//! # Configuration
//!
//! TOML-based configuration for the router: a provider table keyed by
//! provider id plus top-level policy, rate-limit, breaker, health and
//! request-limit sections. Loading runs `load` → `apply_env_overrides` →
//! `validate`; credentials never live in the file, only the *names* of
//! the environment variables holding them.
//!
//! ## Environment variables
//!
//! - The variable named by each provider's `api_key_env` holds its
//!   credential and is read at registry load time.
//! - `<PROVIDER_ID>_ENABLED=0|1` force-disables or re-enables a provider
//!   without editing the file (id uppercased, `-` mapped to `_`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use switchboard_models_sdk::backoff::BackoffPolicy;
use switchboard_models_sdk::circuit_breaker::CircuitBreakerConfig;

/// Provider lifecycle status from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    #[default]
    Active,
    Degraded,
    Maintenance,
    Disabled,
}

/// Which adapter implementation serves a provider entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// OpenAI-compatible HTTP backend
    OpenaiCompat,
    /// In-process stub backend (keyless, for development and tests)
    Stub,
}

impl AdapterKind {
    /// Keyless kinds may omit `api_key_env`.
    pub fn is_keyless(self) -> bool {
        matches!(self, Self::Stub)
    }
}

/// One `[providers.<id>]` table entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub kind: AdapterKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the env variable holding the credential
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub cost_input_per_1k: f64,
    #[serde(default)]
    pub cost_output_per_1k: f64,
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,
    #[serde(default)]
    pub status: ProviderStatus,
}

fn default_capabilities() -> Vec<String> {
    vec!["chat".to_string()]
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrent() -> usize {
    10
}

fn default_latency_threshold_ms() -> u64 {
    2_000
}

/// `[policy]` section: named preset plus optional explicit weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_policy_name")]
    pub default: String,
    #[serde(default = "default_chain_depth")]
    pub chain_depth: usize,
    #[serde(default)]
    pub weights: Option<WeightsConfig>,
    /// Cost budget assumed when a request does not carry one, in USD
    #[serde(default = "default_cost_budget")]
    pub default_cost_budget: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeightsConfig {
    pub latency: f64,
    pub cost: f64,
    pub reliability: f64,
}

fn default_policy_name() -> String {
    "balanced".to_string()
}

fn default_chain_depth() -> usize {
    4
}

fn default_cost_budget() -> f64 {
    0.05
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default: default_policy_name(),
            chain_depth: default_chain_depth(),
            weights: None,
            default_cost_budget: default_cost_budget(),
        }
    }
}

/// `[ratelimit]` section: sliding-window limits per identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_per_hour")]
    pub per_hour: u32,
    #[serde(default = "default_per_day")]
    pub per_day: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_burst_window_secs")]
    pub burst_window_secs: u64,
}

fn default_per_minute() -> u32 {
    60
}

fn default_per_hour() -> u32 {
    1_000
}

fn default_per_day() -> u32 {
    10_000
}

fn default_burst() -> u32 {
    10
}

fn default_burst_window_secs() -> u64 {
    10
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
            per_day: default_per_day(),
            burst: default_burst(),
            burst_window_secs: default_burst_window_secs(),
        }
    }
}

/// `[breaker]` section.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_half_open_successes")]
    pub half_open_success_threshold: u32,
    #[serde(default = "default_auth_cooldown_ms")]
    pub auth_cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_successes() -> u32 {
    2
}

fn default_auth_cooldown_ms() -> u64 {
    600_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_success_threshold: default_half_open_successes(),
            auth_cooldown_ms: default_auth_cooldown_ms(),
        }
    }
}

impl BreakerConfig {
    pub fn to_breaker_config(self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            half_open_success_threshold: self.half_open_success_threshold,
            auth_cooldown: Duration::from_millis(self.auth_cooldown_ms),
        }
    }
}

/// `[retry]` section: same-provider retry pacing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_retry_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_retry_base_ms() -> u64 {
    200
}

fn default_retry_jitter_ms() -> u64 {
    200
}

fn default_retry_cap_ms() -> u64 {
    2_000
}

fn default_max_retries() -> u32 {
    2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: default_retry_base_ms(),
            jitter_ms: default_retry_jitter_ms(),
            cap_ms: default_retry_cap_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl RetryConfig {
    pub fn to_backoff_policy(self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.base_ms),
            jitter: Duration::from_millis(self.jitter_ms),
            cap: Duration::from_millis(self.cap_ms),
            max_retries: self.max_retries,
        }
    }
}

/// `[health]` section: cached probe sampling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_warmup_interval_seconds")]
    pub warmup_interval_seconds: u64,
}

fn default_health_ttl_seconds() -> u64 {
    15
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_warmup_interval_seconds() -> u64 {
    300
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_health_ttl_seconds(),
            probe_timeout_ms: default_probe_timeout_ms(),
            warmup_interval_seconds: default_warmup_interval_seconds(),
        }
    }
}

/// `[limits]` section: validator caps and deadline ceilings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_tokens_cap")]
    pub max_tokens_cap: u32,
    /// Estimated prompt tokens + max_tokens must stay under this
    #[serde(default = "default_token_budget")]
    pub token_budget: u32,
    #[serde(default = "default_max_deadline_ms")]
    pub max_deadline_ms: u64,
    #[serde(default = "default_fast_path_deadline_ms")]
    pub fast_path_deadline_ms: u64,
    /// Risk score at or above which the gateway denies the request
    #[serde(default = "default_risk_threshold")]
    pub risk_threshold: f32,
}

fn default_max_message_bytes() -> usize {
    10 * 1024
}

fn default_max_total_bytes() -> usize {
    50 * 1024
}

fn default_max_messages() -> usize {
    50
}

fn default_max_tokens_cap() -> u32 {
    4096
}

fn default_token_budget() -> u32 {
    8192
}

fn default_max_deadline_ms() -> u64 {
    20_000
}

fn default_fast_path_deadline_ms() -> u64 {
    6_000
}

fn default_risk_threshold() -> f32 {
    0.8
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
            max_total_bytes: default_max_total_bytes(),
            max_messages: default_max_messages(),
            max_tokens_cap: default_max_tokens_cap(),
            token_budget: default_token_budget(),
            max_deadline_ms: default_max_deadline_ms(),
            fast_path_deadline_ms: default_fast_path_deadline_ms(),
            risk_threshold: default_risk_threshold(),
        }
    }
}

/// Top-level router configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl RouterConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let mut config: RouterConfig = toml::from_str(content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `<PROVIDER_ID>_ENABLED` force-disable/enable overrides.
    pub fn apply_env_overrides(&mut self) {
        for (id, entry) in &mut self.providers {
            let env_key = format!("{}_ENABLED", id.to_uppercase().replace('-', "_"));
            match env::var(&env_key).as_deref() {
                Ok("0") => {
                    entry.status = ProviderStatus::Disabled;
                    tracing::info!("provider {} force-disabled via {}", id, env_key);
                }
                Ok("1") => {
                    if entry.status == ProviderStatus::Disabled {
                        entry.status = ProviderStatus::Active;
                        tracing::info!("provider {} force-enabled via {}", id, env_key);
                    }
                }
                _ => {}
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.providers.is_empty() {
            return Err(anyhow::anyhow!("at least one provider must be configured"));
        }

        for (id, entry) in &self.providers {
            if id.is_empty() {
                return Err(anyhow::anyhow!("provider id cannot be empty"));
            }

            if entry.models.is_empty() && entry.kind != AdapterKind::Stub {
                return Err(anyhow::anyhow!("provider {} advertises no models", id));
            }

            if entry.default_timeout_ms == 0 {
                return Err(anyhow::anyhow!("provider {} has zero timeout", id));
            }

            if entry.max_concurrent == 0 {
                return Err(anyhow::anyhow!(
                    "provider {} max_concurrent cannot be 0",
                    id
                ));
            }

            match (&entry.endpoint, entry.kind) {
                (None, AdapterKind::OpenaiCompat) => {
                    return Err(anyhow::anyhow!("provider {} requires an endpoint", id));
                }
                (Some(endpoint), _)
                    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") =>
                {
                    return Err(anyhow::anyhow!(
                        "provider {} endpoint must start with http:// or https://: {}",
                        id,
                        endpoint
                    ));
                }
                _ => {}
            }

            if entry.api_key_env.is_none()
                && !entry.kind.is_keyless()
                && entry.status != ProviderStatus::Disabled
            {
                return Err(anyhow::anyhow!(
                    "provider {} requires api_key_env (kind {:?} is not keyless)",
                    id,
                    entry.kind
                ));
            }

            if entry.cost_input_per_1k < 0.0 || entry.cost_output_per_1k < 0.0 {
                return Err(anyhow::anyhow!("provider {} has negative cost rates", id));
            }
        }

        if let Some(weights) = &self.policy.weights {
            let sum = weights.latency + weights.cost + weights.reliability;
            if !(0.99..=1.01).contains(&sum) {
                return Err(anyhow::anyhow!(
                    "policy weights must sum to 1.0, got {:.3}",
                    sum
                ));
            }
        }

        if self.ratelimit.per_minute == 0 {
            return Err(anyhow::anyhow!("ratelimit per_minute cannot be 0"));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(anyhow::anyhow!("breaker failure_threshold cannot be 0"));
        }

        if self.limits.max_deadline_ms == 0 {
            return Err(anyhow::anyhow!("limits max_deadline_ms cannot be 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [providers.primary]
        kind = "openai_compat"
        endpoint = "https://api.example.com/v1"
        api_key_env = "PRIMARY_API_KEY"
        models = ["m-large"]
        capabilities = ["chat", "long-context"]
        default_timeout_ms = 15000
        max_concurrent = 4
        cost_input_per_1k = 0.5
        cost_output_per_1k = 1.5

        [providers.local]
        kind = "stub"
        models = ["m-local"]

        [policy]
        default = "latency_first"
        chain_depth = 3

        [ratelimit]
        per_minute = 30

        [breaker]
        failure_threshold = 3
        recovery_timeout_ms = 5000
    "#;

    #[test]
    fn parses_sample_config() {
        let config = RouterConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.providers.len(), 2);

        let primary = &config.providers["primary"];
        assert_eq!(primary.kind, AdapterKind::OpenaiCompat);
        assert_eq!(primary.max_concurrent, 4);
        assert_eq!(primary.status, ProviderStatus::Active);
        // Unspecified fields fall back to defaults.
        assert_eq!(primary.latency_threshold_ms, 2000);

        assert_eq!(config.policy.default, "latency_first");
        assert_eq!(config.policy.chain_depth, 3);
        assert_eq!(config.ratelimit.per_minute, 30);
        assert_eq!(config.ratelimit.per_hour, 1000);
        assert_eq!(config.breaker.failure_threshold, 3);
    }

    #[test]
    fn rejects_missing_endpoint() {
        let bad = r#"
            [providers.broken]
            kind = "openai_compat"
            api_key_env = "X"
            models = ["m"]
        "#;
        assert!(RouterConfig::from_toml(bad).is_err());
    }

    #[test]
    fn rejects_missing_credential_handle() {
        let bad = r#"
            [providers.broken]
            kind = "openai_compat"
            endpoint = "https://api.example.com/v1"
            models = ["m"]
        "#;
        let err = RouterConfig::from_toml(bad).unwrap_err();
        assert!(err.to_string().contains("api_key_env"));
    }

    #[test]
    fn rejects_malformed_endpoint() {
        let bad = r#"
            [providers.broken]
            kind = "openai_compat"
            endpoint = "ftp://nope"
            api_key_env = "X"
            models = ["m"]
        "#;
        assert!(RouterConfig::from_toml(bad).is_err());
    }

    #[test]
    fn env_override_force_disables() {
        std::env::set_var("LOCAL_ENABLED", "0");
        let config = RouterConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.providers["local"].status, ProviderStatus::Disabled);
        std::env::remove_var("LOCAL_ENABLED");
    }

    #[test]
    fn weights_must_sum_to_one() {
        let bad = format!(
            "{}\n[policy.weights]\nlatency = 0.5\ncost = 0.5\nreliability = 0.5\n",
            r#"
            [providers.local]
            kind = "stub"
            models = ["m"]
            "#
        );
        assert!(RouterConfig::from_toml(&bad).is_err());
    }
}
