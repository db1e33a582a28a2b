//! # Chat Data Model
//!
//! Wire-agnostic request/response types shared by every provider adapter.
//! Vendor-specific translation happens inside the adapters; the router and
//! everything above it only ever sees these types.

use serde::{Deserialize, Serialize};

/// A chat completion request in the uniform shape adapters consume.
///
/// # Example
///
/// ```rust
/// let request = ChatRequest {
///     model: "m-large".to_string(),
///     messages: vec![Message::user("Hello!")],
///     temperature: Some(0.7),
///     max_tokens: Some(256),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    /// The model to use for completion
    pub model: String,
    /// The conversation to generate a response for
    pub messages: Vec<Message>,
    /// Controls randomness (0.0 to 2.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Controls diversity via nucleus sampling (0.0 to 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Maximum number of tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sequences that stop generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// End-user identifier forwarded for provider-side accounting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// A completed chat response in the uniform shape adapters produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Generated assistant content
    pub content: String,
    /// Model that actually served the request
    pub model: String,
    /// Token usage reported by the provider
    pub usage: Usage,
    /// Why generation stopped
    pub finish_reason: FinishReason,
}

/// A single message in a conversation.
///
/// # Example
///
/// ```rust
/// let user_msg = Message::user("Hello, how are you?");
/// let system_msg = Message::system("You are a helpful assistant.");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender
    pub role: Role,
    /// Content of the message
    pub content: String,
}

impl Message {
    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions and context
    System,
    /// User input and questions
    User,
    /// Assistant responses
    Assistant,
}

/// Token usage statistics for a completed request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// Why a completion stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of generation
    Stop,
    /// Hit the max_tokens ceiling
    Length,
    /// Provider filtered the content
    ContentFilter,
    /// Provider reported something we do not model
    Other,
}

/// Rough prompt-size estimate: 4 characters per token plus a small
/// per-message overhead for role framing.
pub fn estimate_tokens(messages: &[Message]) -> u32 {
    let chars: usize = messages.iter().map(|m| m.content.len()).sum();
    (chars as u32 / 4) + (messages.len() as u32 * 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(Message::user("hi").role, Role::User);
        assert_eq!(Message::assistant("ok").role, Role::Assistant);
        assert_eq!(Message::system("be nice").role, Role::System);
    }

    #[test]
    fn usage_totals_inputs_and_outputs() {
        let usage = Usage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn token_estimate_scales_with_content() {
        let short = estimate_tokens(&[Message::user("hi")]);
        let long = estimate_tokens(&[Message::user("a".repeat(400))]);
        assert!(long > short);
        assert_eq!(long, 104);
    }
}
