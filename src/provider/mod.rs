//! Provider adapter contract (C5) and adapters (C6).

#[cfg(feature = "anthropic")]
pub mod anthropic;
#[cfg(feature = "completions")]
pub mod completions;
#[cfg(feature = "responses")]
pub mod responses;

mod retry;

pub use retry::{retry_with_backoff, RetryPolicy};

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::accumulator::AccumulatorError;
use crate::config::Config;
use crate::model::{Response, StopReason};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("encoding failed: {0}")]
    Encoding(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("decoding error: {0}")]
    Decoding(String),
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        AdapterError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::Decoding(err.to_string())
    }
}

impl From<AccumulatorError> for AdapterError {
    fn from(err: AccumulatorError) -> Self {
        AdapterError::Decoding(err.to_string())
    }
}

impl AdapterError {
    /// Transient errors are the ones spec section 4.5 says to retry:
    /// network failures, 5xx, and 429.
    pub fn is_transient(&self) -> bool {
        match self {
            AdapterError::Transport(_) => true,
            AdapterError::Provider { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        None
    }
}

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Response, AdapterError>> + Send>>;

/// The minimal provider adapter contract (spec section 4.5): a name, a
/// one-shot `generate`, and a `stream` that yields progressively-complete
/// `Response` snapshots (the last one, once the underlying accumulator
/// reports `is_complete()`, is the final answer). Narrower than
/// `km_tools::llm::provider::LLMProvider` on purpose: history management,
/// compaction, and looping belong to the agent turn loop (C8), not the
/// adapter.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, config: &Config) -> Result<Response, AdapterError>;

    async fn stream(&self, config: &Config) -> Result<ResponseStream, AdapterError>;
}

/// Validate that every message has non-empty content, per spec section
/// 4.5(1).
pub fn validate_messages(config: &Config) -> Result<(), AdapterError> {
    if config.messages.is_empty() {
        return Err(AdapterError::Validation("messages must not be empty".into()));
    }
    for message in &config.messages {
        if message.content.is_empty() {
            return Err(AdapterError::Validation(format!(
                "message with role {:?} has empty content",
                message.role
            )));
        }
    }
    Ok(())
}

/// Canonical stop-reason mapping (spec section 4.5): any tool-call content
/// wins regardless of what the provider's own finish-reason field says.
pub fn stop_reason(has_tool_calls: bool, provider_reason: &str) -> StopReason {
    if has_tool_calls {
        return StopReason::ToolUse;
    }
    match provider_reason {
        "length" | "max_tokens" => StopReason::MaxTokens,
        "stop" | "end_turn" => StopReason::EndTurn,
        "refusal" | "content_filter" => StopReason::Refusal,
        "tool_use" | "tool_calls" | "function_call" => StopReason::ToolUse,
        "stop_sequence" => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;

    #[test]
    fn validate_messages_rejects_empty_list() {
        let config = Config::new("m");
        assert!(validate_messages(&config).is_err());
    }

    #[test]
    fn validate_messages_rejects_empty_content() {
        let mut config = Config::new("m");
        config.messages.push(Message::new(crate::model::Role::User, vec![]));
        assert!(validate_messages(&config).is_err());
    }

    #[test]
    fn stop_reason_prefers_tool_use_over_provider_reason() {
        assert_eq!(stop_reason(true, "stop"), StopReason::ToolUse);
        assert_eq!(stop_reason(false, "length"), StopReason::MaxTokens);
        assert_eq!(stop_reason(false, "end_turn"), StopReason::EndTurn);
    }
}
