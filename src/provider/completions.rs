//! OpenAI-compatible chat-completions adapter (used for OpenAI itself and
//! completions-flavored backends such as Mistral). Grounded on
//! `km_tools::llm::openai::OpenAIProvider`'s primary `ChatCompletionRequest`/
//! `ChatMessage`/`ChatCompletionChunk` wire shapes — this is literally the
//! completions API the teacher already speaks to. The streaming side
//! normalizes OpenAI's per-index tool-call deltas into canonical
//! [`crate::accumulator::Event`]s so the one shared accumulator
//! reconstructs the response, rather than re-implementing a second
//! `ToolCallAssembler` the way the teacher's `openai.rs` does.

use std::collections::HashSet;
use std::env;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::accumulator::{BlockStart, Delta, Event, MessageDeltaInfo, PartialMessage, ResponseAccumulator};
use crate::config::Config;
use crate::model::{ContentBlock, Message, Response, Role, ToolResultContent, Usage};
use crate::sse;

use super::{stop_reason, validate_messages, AdapterError, Provider, ResponseStream, RetryPolicy};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1/chat/completions";

pub struct CompletionsAdapter {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    retry_policy: RetryPolicy,
}

impl CompletionsAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            endpoint: OPENAI_API_BASE.to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn from_env() -> Result<Self, AdapterError> {
        let api_key =
            env::var("OPENAI_API_KEY").map_err(|_| AdapterError::Validation("OPENAI_API_KEY is not set".into()))?;
        Ok(Self::new(api_key))
    }

    pub fn mistral_from_env(endpoint: impl Into<String>) -> Result<Self, AdapterError> {
        let api_key =
            env::var("MISTRAL_API_KEY").map_err(|_| AdapterError::Validation("MISTRAL_API_KEY is not set".into()))?;
        Ok(Self { client: reqwest::Client::new(), api_key, endpoint: endpoint.into(), retry_policy: RetryPolicy::default() })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn build_request_body(&self, config: &Config, stream: bool) -> ChatCompletionRequest {
        let mut messages = Vec::new();
        if let Some(system) = &config.system_prompt {
            messages.push(ChatMessage::System { content: system.clone() });
        }
        for message in &config.messages {
            encode_message(message, &mut messages);
        }

        ChatCompletionRequest {
            model: config.model.clone(),
            messages,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            stream,
            stream_options: if stream { Some(StreamOptions { include_usage: true }) } else { None },
            tools: if config.tools.is_empty() {
                None
            } else {
                Some(
                    config
                        .tools
                        .iter()
                        .map(|t| OpenAiTool {
                            kind: "function".into(),
                            function: OpenAiFunction { name: t.name.clone(), description: t.description.clone(), parameters: t.parameters.clone() },
                        })
                        .collect(),
                )
            },
        }
    }

    async fn send(&self, body: &ChatCompletionRequest) -> Result<reqwest::Response, AdapterError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
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

/// Flatten a canonical message into one-or-more wire messages: assistant
/// `tool_use` blocks collapse into a single assistant message carrying a
/// `tool_calls` array, and `tool_result` blocks become separate `role=tool`
/// messages keyed by `tool_call_id` (spec section 4.5).
fn encode_message(message: &Message, out: &mut Vec<ChatMessage>) {
    match message.role {
        Role::System => out.push(ChatMessage::System { content: message.text() }),
        Role::Assistant => {
            let text = message.text();
            let tool_calls: Vec<OpenAiToolCall> = message
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => Some(OpenAiToolCall {
                        id: id.clone(),
                        kind: "function".into(),
                        function: OpenAiFunctionCall { name: name.clone(), arguments: input.to_string() },
                    }),
                    _ => None,
                })
                .collect();
            out.push(ChatMessage::Assistant {
                content: if text.is_empty() { None } else { Some(text) },
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            });
        }
        Role::User => {
            let mut plain_text = Vec::new();
            for block in &message.content {
                match block {
                    ContentBlock::ToolResult { tool_use_id, content, .. } => {
                        let text = match content {
                            ToolResultContent::Text(t) => t.clone(),
                            other => serde_json::to_string(other).unwrap_or_default(),
                        };
                        out.push(ChatMessage::Tool { content: text, tool_call_id: tool_use_id.clone() });
                    }
                    ContentBlock::Text { text, .. } => plain_text.push(text.clone()),
                    _ => {}
                }
            }
            if !plain_text.is_empty() {
                out.push(ChatMessage::User { content: plain_text.join("\n\n") });
            }
        }
    }
}

#[async_trait]
impl Provider for CompletionsAdapter {
    fn name(&self) -> &str {
        "openai-completions"
    }

    async fn generate(&self, config: &Config) -> Result<Response, AdapterError> {
        validate_messages(config)?;
        let body = self.build_request_body(config, false);
        let response = super::retry_with_backoff(&self.retry_policy, || async { self.send(&body).await }).await?;
        let decoded: ChatCompletionResponse = response.json().await.map_err(AdapterError::from)?;
        Ok(decoded.into_canonical())
    }

    async fn stream(&self, config: &Config) -> Result<ResponseStream, AdapterError> {
        validate_messages(config)?;
        let body = self.build_request_body(config, true);
        let response = super::retry_with_backoff(&self.retry_policy, || async { self.send(&body).await }).await?;

        let byte_stream = response.bytes_stream();
        let records = sse::events(byte_stream);

        let stream = async_stream::stream! {
            let mut acc = ResponseAccumulator::new();
            let mut normalizer = StreamNormalizer::default();
            futures::pin_mut!(records);
            while let Some(record) = records.next().await {
                let record = record.map_err(|e| AdapterError::Transport(e.to_string()))?;
                let chunk: ChatCompletionChunk = serde_json::from_str(&record.data).map_err(AdapterError::from)?;
                let (events, done) = normalizer.on_chunk(chunk);
                for event in events {
                    acc.add_event(event)?;
                }
                yield Ok(acc.response());
                if done {
                    return;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Tracks which synthetic block indices have been opened so OpenAI's
/// per-index tool-call deltas (and its single running text block) can be
/// normalized into the canonical start/delta/stop event triples.
#[derive(Default)]
struct StreamNormalizer {
    message_started: bool,
    text_started: bool,
    tool_blocks_started: HashSet<usize>,
}

impl StreamNormalizer {
    fn on_chunk(&mut self, chunk: ChatCompletionChunk) -> (Vec<Event>, bool) {
        let mut events = Vec::new();
        let mut done = false;

        if !self.message_started {
            events.push(Event::MessageStart {
                message: PartialMessage { id: chunk.id.clone(), model: chunk.model.clone(), role: Role::Assistant, usage: Usage::default() },
            });
            self.message_started = true;
        }

        let Some(choice) = chunk.choices.first() else {
            if let Some(usage) = chunk.usage {
                events.push(Event::MessageDelta {
                    delta: MessageDeltaInfo { stop_reason: None, stop_sequence: None },
                    usage: Usage { input_tokens: usage.prompt_tokens, output_tokens: usage.completion_tokens, ..Default::default() },
                });
            }
            return (events, done);
        };

        if let Some(text) = &choice.delta.content {
            if !text.is_empty() {
                if !self.text_started {
                    events.push(Event::ContentBlockStart { index: 0, content_block: BlockStart::Text { cache_control: None } });
                    self.text_started = true;
                }
                events.push(Event::ContentBlockDelta { index: 0, delta: Delta::TextDelta { text: text.clone() } });
            }
        }

        for tool_call in &choice.delta.tool_calls {
            let index = tool_call.index + 1;
            if let Some(id) = &tool_call.id {
                if self.tool_blocks_started.insert(index) {
                    events.push(Event::ContentBlockStart {
                        index,
                        content_block: BlockStart::ToolUse { id: id.clone(), name: tool_call.function.name.clone().unwrap_or_default() },
                    });
                }
            }
            if let Some(args) = &tool_call.function.arguments {
                if !args.is_empty() {
                    events.push(Event::ContentBlockDelta { index, delta: Delta::InputJsonDelta { partial_json: args.clone() } });
                }
            }
        }

        if let Some(reason) = &choice.finish_reason {
            if self.text_started {
                events.push(Event::ContentBlockStop { index: 0 });
            }
            for index in self.tool_blocks_started.iter().copied().collect::<Vec<_>>() {
                events.push(Event::ContentBlockStop { index });
            }
            let has_tool_calls = !self.tool_blocks_started.is_empty();
            events.push(Event::MessageDelta {
                delta: MessageDeltaInfo { stop_reason: Some(stop_reason(has_tool_calls, reason)), stop_sequence: None },
                usage: Usage::default(),
            });
            if chunk.usage.is_none() {
                events.push(Event::MessageStop);
                done = true;
            }
        }

        if let Some(usage) = chunk.usage {
            events.push(Event::MessageDelta {
                delta: MessageDeltaInfo { stop_reason: None, stop_sequence: None },
                usage: Usage { input_tokens: usage.prompt_tokens, output_tokens: usage.completion_tokens, ..Default::default() },
            });
            events.push(Event::MessageStop);
            done = true;
        }

        (events, done)
    }
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum ChatMessage {
    System { content: String },
    User { content: String },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCall>>,
    },
    Tool { content: String, tool_call_id: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    id: String,
    model: String,
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionsUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

impl ChatCompletionResponse {
    fn into_canonical(self) -> Response {
        let choice = self.choices.into_iter().next();
        let (content, finish_reason) = match choice {
            Some(c) => (decode_assistant_message(&c.message), c.finish_reason.unwrap_or_default()),
            None => (Vec::new(), String::new()),
        };
        let has_tool_calls = content.iter().any(|b| b.is_tool_use());
        let usage = self.usage.unwrap_or_default();
        Response {
            id: self.id,
            model: self.model,
            role: Role::Assistant,
            content,
            stop_reason: stop_reason(has_tool_calls, &finish_reason),
            stop_sequence: None,
            usage: Usage { input_tokens: usage.prompt_tokens, output_tokens: usage.completion_tokens, ..Default::default() },
            context_management_applied: None,
        }
    }
}

fn decode_assistant_message(message: &ChatMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    if let ChatMessage::Assistant { content, tool_calls } = message {
        if let Some(text) = content {
            if !text.is_empty() {
                blocks.push(ContentBlock::text(text.clone()));
            }
        }
        if let Some(calls) = tool_calls {
            for call in calls {
                let input: Value = serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| serde_json::json!({}));
                blocks.push(ContentBlock::tool_use(call.id.clone(), call.function.name.clone(), input));
            }
        }
    }
    blocks
}

#[derive(Debug, Default, Deserialize)]
struct CompletionsUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    id: String,
    model: String,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<CompletionsUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: ChunkFunctionDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
