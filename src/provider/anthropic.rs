//! Anthropic Messages API adapter. Grounded directly on
//! `km_tools::llm::anthropic::AnthropicProvider`: same `reqwest` + `stream:
//! true` + `eventsource-stream` request shape, same retry-free POST loop
//! wrapped here by [`super::retry::retry_with_backoff`]. Because spec
//! section 6 states the Anthropic wire IS the canonical shape, this adapter
//! reuses [`crate::model::Message`]/[`crate::model::ContentBlock`] directly
//! as its request/response body instead of re-declaring a parallel set of
//! wire structs the way the teacher's `AnthropicMessage`/`AnthropicContent`
//! types do.

use std::env;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::accumulator::{Event, ResponseAccumulator};
use crate::config::{Config, ToolChoiceKind};
use crate::model::{ContentBlock, Message, Response, Usage};
use crate::sse;

use super::{stop_reason, validate_messages, AdapterError, Provider, ResponseStream, RetryPolicy};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    retry_policy: RetryPolicy,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            endpoint: ANTHROPIC_API_BASE.to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn from_env() -> Result<Self, AdapterError> {
        let api_key = env::var("ANTHROPIC_API_KEY")
            .map_err(|_| AdapterError::Validation("ANTHROPIC_API_KEY is not set".into()))?;
        Ok(Self::new(api_key))
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn build_request_body(&self, config: &Config, stream: bool) -> Result<AnthropicRequest, AdapterError> {
        let mut messages = config.messages.clone();
        apply_cache_control(&mut messages, config.caching.unwrap_or(false));
        apply_prefill(&mut messages, config.prefill.as_deref());

        Ok(AnthropicRequest {
            model: config.model.clone(),
            system: config.system_prompt.clone(),
            messages,
            max_tokens: config.max_tokens.unwrap_or(4096),
            temperature: config.temperature,
            top_p: config.top_p,
            stop_sequences: None,
            stream,
            tools: if config.tools.is_empty() {
                None
            } else {
                Some(
                    config
                        .tools
                        .iter()
                        .map(|t| AnthropicTool {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            input_schema: t.parameters.clone(),
                        })
                        .collect(),
                )
            },
            tool_choice: config.tool_choice.as_ref().map(|tc| AnthropicToolChoice {
                kind: match tc.kind {
                    ToolChoiceKind::Auto => "auto",
                    ToolChoiceKind::Any => "any",
                    ToolChoiceKind::Tool => "tool",
                    ToolChoiceKind::None => "none",
                }
                .to_string(),
                name: tc.name.clone(),
            }),
        })
    }

    async fn send(&self, body: &AnthropicRequest) -> Result<reqwest::Response, AdapterError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Provider { status, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, config: &Config) -> Result<Response, AdapterError> {
        validate_messages(config)?;
        let body = self.build_request_body(config, false)?;

        let response = super::retry_with_backoff(&self.retry_policy, || async { self.send(&body).await }).await?;
        let decoded: AnthropicResponseBody = response.json().await.map_err(AdapterError::from)?;
        Ok(decoded.into_canonical())
    }

    async fn stream(&self, config: &Config) -> Result<ResponseStream, AdapterError> {
        validate_messages(config)?;
        let body = self.build_request_body(config, true)?;
        let response = super::retry_with_backoff(&self.retry_policy, || async { self.send(&body).await }).await?;

        let byte_stream = response.bytes_stream();
        let records = sse::events(byte_stream);
        let prefill = config.prefill.clone();
        let prefill_closing_tag = config.prefill_closing_tag.clone();

        let stream = async_stream::stream! {
            let mut acc = ResponseAccumulator::new().with_prefill(prefill, prefill_closing_tag);
            futures::pin_mut!(records);
            while let Some(record) = records.next().await {
                let record = record.map_err(|e| AdapterError::Transport(e.to_string()))?;
                let event: Event = serde_json::from_str(&record.data).map_err(AdapterError::from)?;
                let is_stop = matches!(event, Event::MessageStop);
                acc.add_event(event)?;
                yield Ok(acc.response());
                if is_stop {
                    return;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Clone-before-mutate: attach an ephemeral cache-control marker to the last
/// content block of the last message without touching caller-owned data
/// (spec section 4.5(3)).
fn apply_cache_control(messages: &mut [Message], caching: bool) {
    if !caching {
        return;
    }
    if let Some(last) = messages.last_mut() {
        if let Some(block) = last.content.pop() {
            last.content.push(block.with_cache_control());
        }
    }
}

/// Append an assistant message seeding the response with `prefill` text
/// (spec section 4.5(4)).
fn apply_prefill(messages: &mut Vec<Message>, prefill: Option<&str>) {
    if let Some(prefill) = prefill {
        messages.push(Message::assistant_text(prefill));
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct AnthropicToolChoice {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponseBody {
    id: String,
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: String,
    stop_sequence: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

impl AnthropicResponseBody {
    fn into_canonical(self) -> Response {
        let has_tool_calls = self.content.iter().any(|b| b.is_tool_use());
        Response {
            id: self.id,
            model: self.model,
            role: crate::model::Role::Assistant,
            content: self.content,
            stop_reason: stop_reason(has_tool_calls, &self.stop_reason),
            stop_sequence: self.stop_sequence,
            usage: Usage {
                input_tokens: self.usage.input_tokens,
                output_tokens: self.usage.output_tokens,
                cache_creation_input_tokens: self.usage.cache_creation_input_tokens,
                cache_read_input_tokens: self.usage.cache_read_input_tokens,
            },
            context_management_applied: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    #[test]
    fn cache_control_clones_before_mutating_and_only_touches_last_block() {
        let original = vec![Message::user_text("hi")];
        let mut messages = original.clone();
        apply_cache_control(&mut messages, true);
        assert_ne!(messages[0], original[0]);
        match &messages[0].content[0] {
            ContentBlock::Text { cache_control, .. } => assert!(cache_control.is_some()),
            other => panic!("expected text block, got {other:?}"),
        }
    }

    #[test]
    fn prefill_appends_a_seeded_assistant_message() {
        let mut messages = vec![Message::user_text("hi")];
        apply_prefill(&mut messages, Some("Sure,"));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].last_text(), "Sure,");
    }

    #[test]
    fn response_body_maps_tool_use_stop_reason_regardless_of_wire_value() {
        let body = AnthropicResponseBody {
            id: "m1".into(),
            model: "claude".into(),
            content: vec![ContentBlock::tool_use("t1", "add", serde_json::json!({}))],
            stop_reason: "end_turn".into(),
            stop_sequence: None,
            usage: AnthropicUsage { input_tokens: 1, output_tokens: 1, cache_creation_input_tokens: 0, cache_read_input_tokens: 0 },
        };
        assert_eq!(body.into_canonical().stop_reason, crate::model::StopReason::ToolUse);
    }
}
