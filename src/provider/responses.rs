//! OpenAI Responses API adapter. Spec section 4.5 describes this adapter as
//! mapping "output items" (`message`, `function_call`,
//! `image_generation_call`, `web_search_call`, `mcp_call`,
//! `mcp_list_tools`, `mcp_approval_request`, `reasoning`,
//! `code_interpreter_call`) to the canonical content blocks; all nine are
//! handled by [`output_item_to_blocks`]. `km_tools` has no Responses-API
//! adapter of its own — its `openai.rs` only reaches the `/responses/compact`
//! endpoint for context compaction — so this module is scaffolded from
//! `km_tools::llm::gemini`'s file shape (a third, independent `*Adapter`
//! struct parallel to Anthropic/Completions, same `reqwest` +
//! `eventsource-stream` plumbing) since spec.md has no Gemini backend and
//! that file would otherwise be dead code.

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

const RESPONSES_API_BASE: &str = "https://api.openai.com/v1/responses";

pub struct ResponsesAdapter {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    retry_policy: RetryPolicy,
}

impl ResponsesAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            endpoint: RESPONSES_API_BASE.to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn from_env() -> Result<Self, AdapterError> {
        let api_key =
            env::var("OPENAI_API_KEY").map_err(|_| AdapterError::Validation("OPENAI_API_KEY is not set".into()))?;
        Ok(Self::new(api_key))
    }

    fn build_request_body(&self, config: &Config, stream: bool) -> ResponsesRequest {
        let mut tools: Vec<ResponsesToolEntry> = config
            .tools
            .iter()
            .map(|t| ResponsesToolEntry::Function { name: t.name.clone(), description: t.description.clone(), parameters: t.parameters.clone() })
            .collect();
        tools.extend(config.mcp_servers.iter().map(|s| ResponsesToolEntry::Mcp {
            server_label: s.server_label.clone(),
            server_url: s.server_url.clone(),
            authorization_token: s.authorization_token.clone(),
            allowed_tools: s.allowed_tools.clone(),
            require_approval: s.require_approval.clone(),
        }));

        ResponsesRequest {
            model: config.model.clone(),
            instructions: config.system_prompt.clone(),
            input: config.messages.iter().flat_map(encode_input_item).collect(),
            max_output_tokens: config.max_tokens,
            temperature: config.temperature,
            stream,
            tools: if tools.is_empty() { None } else { Some(tools) },
        }
    }

    async fn send(&self, body: &ResponsesRequest) -> Result<reqwest::Response, AdapterError> {
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

/// Encode one canonical message into the input items the Responses API
/// expects. A message maps to more than one item when it carries several
/// tool results or MCP call pairs, never to fewer than one.
fn encode_input_item(message: &Message) -> Vec<ResponsesInputItem> {
    match message.role {
        Role::User => {
            let tool_outputs: Vec<ResponsesInputItem> = message
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult { tool_use_id, content, .. } => {
                        let output = match content {
                            ToolResultContent::Text(t) => t.clone(),
                            other => serde_json::to_string(other).unwrap_or_default(),
                        };
                        Some(ResponsesInputItem::FunctionCallOutput { call_id: tool_use_id.clone(), output })
                    }
                    _ => None,
                })
                .collect();
            if !tool_outputs.is_empty() {
                // A user turn carrying tool results encodes as one
                // function_call_output item per result (spec section 4.5(2)).
                return tool_outputs;
            }
            vec![ResponsesInputItem::Message { role: "user".into(), content: message.text() }]
        }
        Role::System => vec![ResponsesInputItem::Message { role: "system".into(), content: message.text() }],
        Role::Assistant => {
            let pairs = crate::mcp::pair_mcp_calls(&message.content);
            if !pairs.is_empty() {
                return pairs
                    .iter()
                    .map(|p| {
                        let output = p.result.map(|block| match block {
                            ContentBlock::McpToolResult { content, .. } => match content {
                                ToolResultContent::Text(t) => t.clone(),
                                other => serde_json::to_string(other).unwrap_or_default(),
                            },
                            other => serde_json::to_string(other).unwrap_or_default(),
                        });
                        ResponsesInputItem::McpCall {
                            id: p.id.to_string(),
                            server_label: p.server_label.to_string(),
                            name: p.name.to_string(),
                            arguments: p.input.clone(),
                            output,
                        }
                    })
                    .collect();
            }
            vec![ResponsesInputItem::Message { role: "assistant".into(), content: message.text() }]
        }
    }
}

#[async_trait]
impl Provider for ResponsesAdapter {
    fn name(&self) -> &str {
        "openai-responses"
    }

    async fn generate(&self, config: &Config) -> Result<Response, AdapterError> {
        validate_messages(config)?;
        let body = self.build_request_body(config, false);
        let response = super::retry_with_backoff(&self.retry_policy, || async { self.send(&body).await }).await?;
        let decoded: ResponsesBody = response.json().await.map_err(AdapterError::from)?;
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
            let mut normalizer = ResponsesStreamNormalizer::default();
            futures::pin_mut!(records);
            while let Some(record) = records.next().await {
                let record = record.map_err(|e| AdapterError::Transport(e.to_string()))?;
                let raw: ResponsesStreamEvent = match serde_json::from_str(&record.data) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let (events, done) = normalizer.on_event(raw);
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

#[derive(Default)]
struct ResponsesStreamNormalizer {
    message_started: bool,
    text_started: bool,
    call_indices: HashSet<usize>,
    next_index: usize,
}

impl ResponsesStreamNormalizer {
    fn on_event(&mut self, raw: ResponsesStreamEvent) -> (Vec<Event>, bool) {
        let mut events = Vec::new();
        let mut done = false;

        if !self.message_started {
            events.push(Event::MessageStart {
                message: PartialMessage { id: raw.response_id.clone().unwrap_or_default(), model: raw.model.clone().unwrap_or_default(), role: Role::Assistant, usage: Usage::default() },
            });
            self.message_started = true;
            self.next_index = 1;
        }

        match raw.kind.as_str() {
            "response.output_text.delta" => {
                if !self.text_started {
                    events.push(Event::ContentBlockStart { index: 0, content_block: BlockStart::Text { cache_control: None } });
                    self.text_started = true;
                }
                if let Some(delta) = raw.delta {
                    events.push(Event::ContentBlockDelta { index: 0, delta: Delta::TextDelta { text: delta } });
                }
            }
            "response.output_item.added" => {
                if let Some(item) = &raw.item {
                    if item.kind == "function_call" {
                        let index = self.next_index;
                        self.next_index += 1;
                        self.call_indices.insert(index);
                        events.push(Event::ContentBlockStart {
                            index,
                            content_block: BlockStart::ToolUse { id: item.call_id.clone().unwrap_or_default(), name: item.name.clone().unwrap_or_default() },
                        });
                    }
                }
            }
            "response.function_call_arguments.delta" => {
                if let (Some(index), Some(delta)) = (self.call_indices.iter().max().copied(), raw.delta) {
                    events.push(Event::ContentBlockDelta { index, delta: Delta::InputJsonDelta { partial_json: delta } });
                }
            }
            "response.output_item.done" => {
                if self.text_started {
                    events.push(Event::ContentBlockStop { index: 0 });
                    self.text_started = false;
                }
                if let Some(index) = self.call_indices.iter().max().copied() {
                    events.push(Event::ContentBlockStop { index });
                }
                // Reasoning, MCP, and web/image/code tool-call items arrive
                // complete in this event rather than through deltas; the
                // canonical `BlockStart` vocabulary is shaped after
                // Anthropic's wire format and has no slot for them, so live
                // streams surface only text and function-call content
                // incrementally. `generate()` still returns them in full
                // through `output_item_to_blocks`.
            }
            "response.completed" => {
                let has_tool_calls = !self.call_indices.is_empty();
                let usage = raw.response.as_ref().and_then(|r| r.usage.clone()).unwrap_or_default();
                events.push(Event::MessageDelta {
                    delta: MessageDeltaInfo { stop_reason: Some(stop_reason(has_tool_calls, "stop")), stop_sequence: None },
                    usage: Usage { input_tokens: usage.input_tokens, output_tokens: usage.output_tokens, ..Default::default() },
                });
                events.push(Event::MessageStop);
                done = true;
            }
            _ => {}
        }

        (events, done)
    }
}

/// A `tools` entry: a callable function or a declared MCP server. Spec
/// section 4.5(2) requires encoders to preserve declared MCP server
/// descriptors alongside ordinary function tools.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponsesToolEntry {
    Function { name: String, description: String, parameters: Value },
    Mcp {
        server_label: String,
        server_url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        authorization_token: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        allowed_tools: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        require_approval: Option<Value>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponsesInputItem {
    Message { role: String, content: String },
    FunctionCallOutput { call_id: String, output: String },
    McpCall {
        id: String,
        server_label: String,
        name: String,
        arguments: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
}

#[derive(Debug, Serialize)]
struct ResponsesRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    input: Vec<ResponsesInputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ResponsesToolEntry>>,
}

#[derive(Debug, Deserialize)]
struct ResponsesOutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
    #[serde(default)]
    content: Option<Vec<ResponsesContentPart>>,
    #[serde(default)]
    server_label: Option<String>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    tools: Option<Vec<Value>>,
    #[serde(default)]
    action: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    summary: Option<Vec<ResponsesContentPart>>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    outputs: Option<Vec<Value>>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    container_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponsesContentPart {
    #[serde(default)]
    text: Option<String>,
}

/// Map one completed output item to the canonical blocks it represents.
/// `message`/`function_call` stream incrementally via deltas and are handled
/// separately by the normalizer; every other kind (reasoning, web/image/code
/// tool calls, MCP items) arrives fully formed in a single item, both in the
/// non-streaming body and in `response.output_item.done`, so one mapping
/// covers both paths.
fn output_item_to_blocks(item: &ResponsesOutputItem) -> Vec<ContentBlock> {
    match item.kind.as_str() {
        "message" => {
            let text = item
                .content
                .as_ref()
                .map(|parts| parts.iter().filter_map(|p| p.text.clone()).collect::<Vec<_>>().join(""))
                .unwrap_or_default();
            if text.is_empty() { vec![] } else { vec![ContentBlock::text(text)] }
        }
        "function_call" => {
            let input: Value = item.arguments.as_deref().and_then(|a| serde_json::from_str(a).ok()).unwrap_or_else(|| serde_json::json!({}));
            vec![ContentBlock::tool_use(item.call_id.clone().unwrap_or_default(), item.name.clone().unwrap_or_default(), input)]
        }
        "reasoning" => {
            let thinking = item
                .summary
                .as_ref()
                .map(|parts| parts.iter().filter_map(|p| p.text.clone()).collect::<Vec<_>>().join("\n"))
                .unwrap_or_default();
            vec![ContentBlock::Thinking { thinking, signature: None }]
        }
        "image_generation_call" => {
            let input = item.result.clone().unwrap_or_else(|| serde_json::json!({}));
            vec![ContentBlock::ServerToolUse { id: item.id.clone().unwrap_or_default(), name: "image_generation".into(), input }]
        }
        "web_search_call" => {
            let input = item.action.clone().unwrap_or_else(|| serde_json::json!({}));
            vec![ContentBlock::ServerToolUse { id: item.id.clone().unwrap_or_default(), name: "web_search".into(), input }]
        }
        "mcp_call" => {
            let mut blocks = vec![ContentBlock::McpToolUse {
                id: item.id.clone().unwrap_or_default(),
                name: item.name.clone().unwrap_or_default(),
                server_label: item.server_label.clone().unwrap_or_default(),
                input: item.arguments.as_deref().and_then(|a| serde_json::from_str(a).ok()).unwrap_or_else(|| serde_json::json!({})),
            }];
            if let Some(output) = &item.output {
                let text = output.as_str().map(str::to_string).unwrap_or_else(|| output.to_string());
                blocks.push(ContentBlock::McpToolResult { tool_use_id: item.id.clone().unwrap_or_default(), content: ToolResultContent::Text(text), is_error: None });
            }
            blocks
        }
        "mcp_list_tools" => vec![ContentBlock::McpListTools { server_label: item.server_label.clone().unwrap_or_default(), tools: item.tools.clone().unwrap_or_default() }],
        "mcp_approval_request" => vec![ContentBlock::McpApprovalRequest {
            id: item.id.clone().unwrap_or_default(),
            server_label: item.server_label.clone().unwrap_or_default(),
            name: item.name.clone().unwrap_or_default(),
            arguments: item.arguments.as_deref().and_then(|a| serde_json::from_str(a).ok()).unwrap_or_else(|| serde_json::json!({})),
        }],
        "code_interpreter_call" => vec![ContentBlock::CodeInterpreterCall {
            id: item.id.clone().unwrap_or_default(),
            code: item.code.clone().unwrap_or_default(),
            results: item.outputs.clone().unwrap_or_default(),
            status: item.status.clone().unwrap_or_else(|| "completed".into()),
            container_id: item.container_id.clone(),
        }],
        _ => vec![],
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ResponsesBody {
    id: String,
    model: String,
    output: Vec<ResponsesOutputItem>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
}

impl ResponsesBody {
    fn into_canonical(self) -> Response {
        let content: Vec<ContentBlock> = self.output.iter().flat_map(output_item_to_blocks).collect();
        let has_tool_calls = content.iter().any(|b| b.is_tool_use());
        let usage = self.usage.unwrap_or_default();
        Response {
            id: self.id,
            model: self.model,
            role: Role::Assistant,
            content,
            stop_reason: stop_reason(has_tool_calls, "stop"),
            stop_sequence: None,
            usage: Usage { input_tokens: usage.input_tokens, output_tokens: usage.output_tokens, ..Default::default() },
            context_management_applied: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponsesStreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    response_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    item: Option<ResponsesOutputItem>,
    #[serde(default)]
    response: Option<ResponsesBodySummary>,
}

#[derive(Debug, Deserialize)]
struct ResponsesBodySummary {
    #[serde(default)]
    usage: Option<ResponsesUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_item(kind: &str) -> ResponsesOutputItem {
        ResponsesOutputItem {
            kind: kind.into(),
            id: None,
            call_id: None,
            name: None,
            arguments: None,
            content: None,
            server_label: None,
            output: None,
            tools: None,
            action: None,
            result: None,
            summary: None,
            code: None,
            outputs: None,
            status: None,
            container_id: None,
        }
    }

    #[test]
    fn message_output_item_becomes_text_block() {
        let body = ResponsesBody {
            id: "r1".into(),
            model: "gpt-5".into(),
            output: vec![ResponsesOutputItem {
                content: Some(vec![ResponsesContentPart { text: Some("hi there".into()) }]),
                ..blank_item("message")
            }],
            usage: None,
        };
        let resp = body.into_canonical();
        assert_eq!(resp.text(), "hi there");
    }

    #[test]
    fn function_call_output_item_becomes_tool_use_block() {
        let body = ResponsesBody {
            id: "r1".into(),
            model: "gpt-5".into(),
            output: vec![ResponsesOutputItem {
                call_id: Some("c1".into()),
                name: Some("add".into()),
                arguments: Some("{\"a\":1}".into()),
                ..blank_item("function_call")
            }],
            usage: None,
        };
        let resp = body.into_canonical();
        assert!(resp.has_tool_calls());
        assert_eq!(resp.stop_reason, crate::model::StopReason::ToolUse);
    }

    #[test]
    fn reasoning_item_becomes_a_thinking_block() {
        let item = ResponsesOutputItem {
            id: Some("r1".into()),
            summary: Some(vec![ResponsesContentPart { text: Some("weighing options".into()) }]),
            ..blank_item("reasoning")
        };
        match output_item_to_blocks(&item).remove(0) {
            ContentBlock::Thinking { thinking, .. } => assert_eq!(thinking, "weighing options"),
            other => panic!("expected thinking block, got {other:?}"),
        }
    }

    #[test]
    fn mcp_call_with_inline_output_becomes_use_and_result_blocks() {
        let item = ResponsesOutputItem {
            id: Some("m1".into()),
            name: Some("search".into()),
            arguments: Some("{\"q\":\"rust\"}".into()),
            server_label: Some("docs".into()),
            output: Some(serde_json::json!("found it")),
            ..blank_item("mcp_call")
        };
        let blocks = output_item_to_blocks(&item);
        assert_eq!(blocks.len(), 2);
        assert!(matches!(blocks[0], ContentBlock::McpToolUse { .. }));
        assert!(matches!(blocks[1], ContentBlock::McpToolResult { .. }));
    }

    #[test]
    fn user_message_with_tool_result_encodes_as_function_call_output() {
        let msg = Message::new(Role::User, vec![ContentBlock::tool_result("c1", "42", false)]);
        let items = encode_input_item(&msg);
        assert_eq!(items.len(), 1);
        match &items[0] {
            ResponsesInputItem::FunctionCallOutput { call_id, output } => {
                assert_eq!(call_id, "c1");
                assert_eq!(output, "42");
            }
            other => panic!("expected function_call_output, got {other:?}"),
        }
    }

    #[test]
    fn user_message_with_multiple_tool_results_encodes_one_item_per_result() {
        let msg = Message::new(
            Role::User,
            vec![ContentBlock::tool_result("c1", "42", false), ContentBlock::tool_result("c2", "43", false)],
        );
        let items = encode_input_item(&msg);
        assert_eq!(items.len(), 2);
        let call_ids: Vec<&str> = items
            .iter()
            .map(|item| match item {
                ResponsesInputItem::FunctionCallOutput { call_id, .. } => call_id.as_str(),
                other => panic!("expected function_call_output, got {other:?}"),
            })
            .collect();
        assert_eq!(call_ids, vec!["c1", "c2"]);
    }

    #[test]
    fn assistant_message_with_mcp_pair_encodes_as_single_mcp_call() {
        let msg = Message::new(
            Role::Assistant,
            vec![
                ContentBlock::McpToolUse { id: "u1".into(), name: "search".into(), server_label: "docs".into(), input: serde_json::json!({"q": "rust"}) },
                ContentBlock::McpToolResult { tool_use_id: "u1".into(), content: "found it".into(), is_error: None },
            ],
        );
        let items = encode_input_item(&msg);
        assert_eq!(items.len(), 1);
        match &items[0] {
            ResponsesInputItem::McpCall { id, server_label, name, output, .. } => {
                assert_eq!(id, "u1");
                assert_eq!(server_label, "docs");
                assert_eq!(name, "search");
                assert_eq!(output.as_deref(), Some("found it"));
            }
            other => panic!("expected mcp_call, got {other:?}"),
        }
    }

    #[test]
    fn build_request_body_includes_declared_mcp_servers_in_tools() {
        let adapter = ResponsesAdapter::new("test-key");
        let mut config = Config::default();
        config.model = "gpt-5".into();
        config.mcp_servers = vec![crate::mcp::McpServer {
            server_label: "docs".into(),
            server_url: "https://mcp.example.com".into(),
            authorization_token: None,
            allowed_tools: vec![],
            require_approval: None,
        }];
        let body = adapter.build_request_body(&config, false);
        let tools = body.tools.expect("tools should be present");
        assert_eq!(tools.len(), 1);
        assert!(matches!(tools[0], ResponsesToolEntry::Mcp { .. }));
    }
}
