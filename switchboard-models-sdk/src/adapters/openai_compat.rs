//! Generic adapter for OpenAI-compatible chat endpoints.
//!
//! Most hosted and self-hosted backends speak the `/chat/completions`
//! dialect; this adapter covers all of them with one wire translation.
//! Status codes map onto the error taxonomy (401/403 → auth, 429 → rate
//! limit, 5xx → upstream) and the health probe is a `/models` listing.

use crate::adapters::{Capabilities, ChatAdapter, HealthReport};
use crate::context::RequestContext;
use crate::error::AdapterError;
use crate::models::{ChatRequest, ChatResponse, FinishReason, Usage};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Configuration for one OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    /// Base URL, e.g. "https://api.openai.com/v1"
    pub endpoint: String,
    /// Bearer credential; `None` for keyless local backends
    pub api_key: Option<String>,
    /// Per-request timeout applied by the HTTP client
    pub timeout: Duration,
    /// Models advertised through `capabilities()`
    pub models: HashSet<String>,
    /// Capability tags advertised through `capabilities()`
    pub tags: HashSet<String>,
    /// Per-model context windows, where known
    pub max_context: HashMap<String, u32>,
}

/// Adapter speaking the OpenAI chat-completions dialect.
pub struct OpenAiCompatAdapter {
    http: Client,
    config: OpenAiCompatConfig,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [crate::models::Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a String>,
}

#[derive(Deserialize)]
struct WireResponse {
    model: String,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl OpenAiCompatAdapter {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self, AdapterError> {
        if !config.endpoint.starts_with("http://") && !config.endpoint.starts_with("https://") {
            return Err(AdapterError::Configuration {
                message: format!("endpoint must be an http(s) URI: {}", config.endpoint),
            });
        }
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AdapterError::Configuration {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn classify_failure(resp: reqwest::Response) -> AdapterError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        // Pull a message out of the common {"error": {"message": ...}} shape.
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error")?.get("message")?.as_str().map(String::from))
            .unwrap_or(body);
        AdapterError::from_status(status, message)
    }
}

#[async_trait::async_trait]
impl ChatAdapter for OpenAiCompatAdapter {
    fn name(&self) -> &str {
        "openai_compat"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            models: self.config.models.clone(),
            tags: self.config.tags.clone(),
            supports_streaming: true,
            max_context: self.config.max_context.clone(),
        }
    }

    async fn health_probe(&self, ctx: &RequestContext) -> Result<HealthReport, AdapterError> {
        let started = Instant::now();
        let send = self.authorize(self.http.get(self.url("/models"))).send();

        let resp = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(AdapterError::Canceled),
            resp = send => resp,
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        match resp {
            Ok(resp) if resp.status().is_success() => Ok(HealthReport::healthy(latency_ms)),
            Ok(resp) => Ok(HealthReport::unhealthy(
                latency_ms,
                format!("probe returned HTTP {}", resp.status().as_u16()),
            )),
            Err(e) => Ok(HealthReport::unhealthy(latency_ms, e.to_string())),
        }
    }

    async fn chat(
        &self,
        ctx: &RequestContext,
        request: ChatRequest,
    ) -> Result<ChatResponse, AdapterError> {
        let wire = WireRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            stop: request.stop.as_ref(),
            user: request.user.as_ref(),
        };

        let mut builder = self
            .authorize(self.http.post(self.url("/chat/completions")))
            .json(&wire);
        if let Some(remaining) = ctx.remaining() {
            builder = builder.timeout(std::cmp::min(remaining, self.config.timeout));
        }

        let resp = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(AdapterError::Canceled),
            resp = builder.send() => resp?,
        };

        if !resp.status().is_success() {
            return Err(Self::classify_failure(resp).await);
        }

        let wire: WireResponse = resp.json().await?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Rejected {
                status: 200,
                message: "response contained no choices".to_string(),
            })?;

        let usage = wire
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        let finish_reason = match choice.finish_reason.as_deref() {
            Some("stop") | None => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(_) => FinishReason::Other,
        };

        Ok(ChatResponse {
            content: choice.message.content,
            model: wire.model,
            usage,
            finish_reason,
        })
    }
}
