//! Routing-level request types: what the HTTP layer above the core hands
//! to [`Router::route`](crate::dispatcher::Router::route).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use switchboard_models_sdk::models::Message;

/// Coarse latency expectation, mapped to a numeric target for scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LatencyPriority {
    UltraLow,
    Low,
    #[default]
    Medium,
    High,
}

impl LatencyPriority {
    /// Latency target used by the policy engine's latency axis.
    pub fn target_ms(self) -> u64 {
        match self {
            Self::UltraLow => 500,
            Self::Low => 1000,
            Self::Medium => 2000,
            Self::High => 5000,
        }
    }
}

/// Recognized request intents. Advisory: intent influences routing but
/// never blocks a request on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Chat,
    Code,
    Analysis,
    Creative,
    Summarize,
}

/// Who is asking, for rate-limiting purposes. The session id is always
/// present; user id and client ip are checked when supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    pub session_id: String,
}

impl Identity {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            user_id: None,
            client_ip: None,
            session_id: session_id.into(),
        }
    }

    /// `(scope, value)` pairs in rate-limit precedence order.
    pub fn scopes(&self) -> Vec<(&'static str, &str)> {
        let mut scopes = Vec::with_capacity(3);
        if let Some(user_id) = &self.user_id {
            scopes.push(("user", user_id.as_str()));
        }
        if let Some(client_ip) = &self.client_ip {
            scopes.push(("ip", client_ip.as_str()));
        }
        scopes.push(("session", self.session_id.as_str()));
        scopes
    }
}

/// One admitted routing request, normalized by the validator.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// Normalized conversation
    pub messages: Vec<Message>,
    /// Explicit model pin; providers not advertising it are filtered out
    pub model: Option<String>,
    /// Capability tags the serving provider must advertise
    pub required_capabilities: HashSet<String>,
    /// Completion budget
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    /// Latency expectation driving the scoring target
    pub latency_priority: LatencyPriority,
    /// Caller-supplied intent; classified from content when absent
    pub intent: Option<Intent>,
    /// Per-request spend ceiling in USD, used by the cost axis
    pub cost_budget: Option<f64>,
    /// Rate-limit identity tuple
    pub identity: Identity,
    /// Caller's overall time budget; clamped to the configured maximum
    pub deadline_budget: Option<Duration>,
    /// Whether same-provider retries are safe for this request
    pub idempotent: bool,
}

impl RouteRequest {
    pub fn new(session_id: impl Into<String>, messages: Vec<Message>) -> Self {
        let mut required_capabilities = HashSet::new();
        required_capabilities.insert("chat".to_string());
        Self {
            messages,
            model: None,
            required_capabilities,
            max_tokens: None,
            temperature: None,
            top_p: None,
            latency_priority: LatencyPriority::default(),
            intent: None,
            cost_budget: None,
            identity: Identity::session(session_id),
            deadline_budget: None,
            idempotent: true,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_latency_priority(mut self, priority: LatencyPriority) -> Self {
        self.latency_priority = priority;
        self
    }

    pub fn with_cost_budget(mut self, budget_usd: f64) -> Self {
        self.cost_budget = Some(budget_usd);
        self
    }

    pub fn with_deadline_budget(mut self, budget: Duration) -> Self {
        self.deadline_budget = Some(budget);
        self
    }

    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_targets() {
        assert_eq!(LatencyPriority::UltraLow.target_ms(), 500);
        assert_eq!(LatencyPriority::Low.target_ms(), 1000);
        assert_eq!(LatencyPriority::Medium.target_ms(), 2000);
        assert_eq!(LatencyPriority::High.target_ms(), 5000);
    }

    #[test]
    fn identity_scope_precedence() {
        let identity = Identity {
            user_id: Some("u1".into()),
            client_ip: Some("10.0.0.1".into()),
            session_id: "s1".into(),
        };
        let scopes: Vec<&'static str> = identity.scopes().iter().map(|(s, _)| *s).collect();
        assert_eq!(scopes, vec!["user", "ip", "session"]);

        let bare = Identity::session("s1");
        assert_eq!(bare.scopes().len(), 1);
    }
}
