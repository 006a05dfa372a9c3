//! Event model & Response Accumulator (C4). `Event` is the canonical
//! streaming vocabulary (the Anthropic wire shape IS this shape, per spec
//! section 6); OpenAI-shaped adapters normalize their own stream deltas into
//! these events before handing them to the accumulator, so the
//! reconstruction algorithm lives in exactly one place.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{CacheControl, Citation, ContentBlock, Response, Role, StopReason, ToolResultContent, Usage};

#[derive(Debug, Error)]
pub enum AccumulatorError {
    #[error("message_start received twice for one stream")]
    AlreadyStarted,
    #[error("accumulated tool-use input is not valid JSON: {0}")]
    InvalidToolInput(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialMessage {
    pub id: String,
    pub model: String,
    pub role: Role,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockStart {
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolUse {
        id: String,
        name: String,
    },
    Thinking {},
    RedactedThinking {
        data: String,
    },
    ServerToolUse {
        id: String,
        name: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeltaInfo {
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

/// The canonical streaming event taxonomy (spec section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    MessageStart { message: PartialMessage },
    ContentBlockStart { index: usize, content_block: BlockStart },
    ContentBlockDelta { index: usize, delta: Delta },
    ContentBlockStop { index: usize },
    MessageDelta { delta: MessageDeltaInfo, #[serde(default)] usage: Usage },
    MessageStop,
    Ping,
}

#[derive(Debug, Clone)]
enum Scratch {
    Text { text: String, citations: Vec<Citation> },
    ToolUse { id: String, name: String, partial_json: String },
    Thinking { thinking: String, signature: Option<String> },
    RedactedThinking { data: String },
    ServerToolUse { id: String, name: String, partial_json: String },
}

impl Scratch {
    fn finalize(self) -> Result<ContentBlock, AccumulatorError> {
        Ok(match self {
            Scratch::Text { text, citations } => ContentBlock::Text {
                text,
                cache_control: None,
                citations: if citations.is_empty() { None } else { Some(citations) },
            },
            Scratch::ToolUse { id, name, partial_json } => {
                let input = parse_tool_input(&partial_json)?;
                ContentBlock::ToolUse { id, name, input }
            }
            Scratch::Thinking { thinking, signature } => ContentBlock::Thinking { thinking, signature },
            Scratch::RedactedThinking { data } => ContentBlock::RedactedThinking { data },
            Scratch::ServerToolUse { id, name, partial_json } => {
                let input = parse_tool_input(&partial_json)?;
                ContentBlock::ServerToolUse { id, name, input }
            }
        })
    }
}

fn parse_tool_input(partial_json: &str) -> Result<Value, AccumulatorError> {
    if partial_json.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(partial_json).map_err(|e| AccumulatorError::InvalidToolInput(e.to_string()))
}

/// Rebuilds a complete [`Response`] from a sequence of [`Event`]s.
pub struct ResponseAccumulator {
    started: Option<PartialMessage>,
    blocks: BTreeMap<usize, Scratch>,
    finished: BTreeMap<usize, ContentBlock>,
    usage: Usage,
    stop_reason: Option<StopReason>,
    stop_sequence: Option<String>,
    complete: bool,
    prefill: Option<String>,
    prefill_closing_tag: Option<String>,
    prefill_applied: bool,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self {
            started: None,
            blocks: BTreeMap::new(),
            finished: BTreeMap::new(),
            usage: Usage::default(),
            stop_reason: None,
            stop_sequence: None,
            complete: false,
            prefill: None,
            prefill_closing_tag: None,
            prefill_applied: false,
        }
    }

    /// Seed prefill behavior: the first assistant text delta has `prefill`
    /// prepended once, per spec section 4.4.
    pub fn with_prefill(mut self, prefill: Option<String>, closing_tag: Option<String>) -> Self {
        self.prefill = prefill;
        self.prefill_closing_tag = closing_tag;
        self
    }

    pub fn add_event(&mut self, event: Event) -> Result<(), AccumulatorError> {
        match event {
            Event::MessageStart { message } => {
                if self.started.is_some() {
                    return Err(AccumulatorError::AlreadyStarted);
                }
                self.usage = message.usage;
                self.started = Some(message);
            }
            Event::ContentBlockStart { index, content_block } => {
                self.blocks.insert(index, scratch_for(content_block));
            }
            Event::ContentBlockDelta { index, delta } => {
                let scratch = self
                    .blocks
                    .entry(index)
                    .or_insert_with(|| Scratch::Text { text: String::new(), citations: Vec::new() });
                apply_delta(scratch, delta);
                let taken = if let Scratch::Text { text, .. } = scratch {
                    Some(std::mem::take(text))
                } else {
                    None
                };
                if let Some(mut text) = taken {
                    self.maybe_apply_prefill(&mut text);
                    if let Some(Scratch::Text { text: slot, .. }) = self.blocks.get_mut(&index) {
                        *slot = text;
                    }
                }
            }
            Event::ContentBlockStop { index } => {
                if let Some(scratch) = self.blocks.remove(&index) {
                    self.finished.insert(index, scratch.finalize()?);
                }
            }
            Event::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(reason);
                }
                if delta.stop_sequence.is_some() {
                    self.stop_sequence = delta.stop_sequence;
                }
                self.usage += usage;
            }
            Event::MessageStop => {
                self.complete = true;
            }
            Event::Ping => {}
        }
        Ok(())
    }

    fn maybe_apply_prefill(&mut self, text: &mut String) {
        if self.prefill_applied {
            return;
        }
        let Some(prefill) = self.prefill.clone() else { return };
        let should_apply = match &self.prefill_closing_tag {
            None => true,
            Some(tag) if tag.is_empty() => true,
            Some(tag) => text.contains(tag.as_str()),
        };
        if should_apply {
            *text = format!("{prefill}{text}");
            self.prefill_applied = true;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Build the `Response` as observed so far. Callers should check
    /// `is_complete()` to distinguish a fully reconstructed response from a
    /// stream that ended early.
    pub fn response(&self) -> Response {
        let content: Vec<ContentBlock> = self.finished.values().cloned().collect();
        let started = self.started.as_ref();
        Response {
            id: started.map(|m| m.id.clone()).unwrap_or_default(),
            model: started.map(|m| m.model.clone()).unwrap_or_default(),
            role: Role::Assistant,
            content,
            stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
            stop_sequence: self.stop_sequence.clone(),
            usage: self.usage,
            context_management_applied: None,
        }
    }
}

impl Default for ResponseAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

fn scratch_for(start: BlockStart) -> Scratch {
    match start {
        BlockStart::Text { .. } => Scratch::Text { text: String::new(), citations: Vec::new() },
        BlockStart::ToolUse { id, name } => Scratch::ToolUse { id, name, partial_json: String::new() },
        BlockStart::Thinking {} => Scratch::Thinking { thinking: String::new(), signature: None },
        BlockStart::RedactedThinking { data } => Scratch::RedactedThinking { data },
        BlockStart::ServerToolUse { id, name } => Scratch::ServerToolUse { id, name, partial_json: String::new() },
    }
}

fn apply_delta(scratch: &mut Scratch, delta: Delta) {
    match (scratch, delta) {
        (Scratch::Text { text, .. }, Delta::TextDelta { text: t }) => text.push_str(&t),
        (Scratch::ToolUse { partial_json, .. }, Delta::InputJsonDelta { partial_json: p })
        | (Scratch::ServerToolUse { partial_json, .. }, Delta::InputJsonDelta { partial_json: p }) => {
            partial_json.push_str(&p)
        }
        (Scratch::Thinking { thinking, .. }, Delta::ThinkingDelta { thinking: t }) => thinking.push_str(&t),
        (Scratch::Thinking { signature, .. }, Delta::SignatureDelta { signature: s }) => {
            *signature = Some(s);
        }
        _ => {}
    }
}

/// Placeholder conversion used when an adapter needs an initial `tool_result`
/// wrapper; kept here because the accumulator is the natural owner of the
/// "empty json => `{}`" rule tested in spec section 8.
pub fn empty_tool_result(tool_use_id: impl Into<String>) -> ContentBlock {
    ContentBlock::tool_result(tool_use_id, ToolResultContent::text(""), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(id: &str) -> Event {
        Event::MessageStart {
            message: PartialMessage {
                id: id.to_string(),
                model: "claude-x".to_string(),
                role: Role::Assistant,
                usage: Usage::default(),
            },
        }
    }

    #[test]
    fn streaming_count_scenario_reconstructs_text_and_completes() {
        let mut acc = ResponseAccumulator::new();
        acc.add_event(started("m1")).unwrap();
        acc.add_event(Event::ContentBlockStart { index: 0, content_block: BlockStart::Text { cache_control: None } })
            .unwrap();
        for chunk in ["1 ", "2 ", "3"] {
            acc.add_event(Event::ContentBlockDelta { index: 0, delta: Delta::TextDelta { text: chunk.into() } })
                .unwrap();
        }
        acc.add_event(Event::ContentBlockStop { index: 0 }).unwrap();
        acc.add_event(Event::MessageDelta {
            delta: MessageDeltaInfo { stop_reason: Some(StopReason::EndTurn), stop_sequence: None },
            usage: Usage { output_tokens: 3, ..Default::default() },
        })
        .unwrap();
        acc.add_event(Event::MessageStop).unwrap();

        assert!(acc.is_complete());
        let resp = acc.response();
        assert_eq!(resp.text(), "1 2 3");
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
    }

    #[test]
    fn tool_use_reconstructs_from_split_json_deltas() {
        let mut acc = ResponseAccumulator::new();
        acc.add_event(started("m1")).unwrap();
        acc.add_event(Event::ContentBlockStart {
            index: 0,
            content_block: BlockStart::ToolUse { id: "t1".into(), name: "add".into() },
        })
        .unwrap();
        acc.add_event(Event::ContentBlockDelta {
            index: 0,
            delta: Delta::InputJsonDelta { partial_json: "{\"a\":1,".into() },
        })
        .unwrap();
        acc.add_event(Event::ContentBlockDelta {
            index: 0,
            delta: Delta::InputJsonDelta { partial_json: "\"b\":2}".into() },
        })
        .unwrap();
        acc.add_event(Event::ContentBlockStop { index: 0 }).unwrap();

        let resp = acc.response();
        match &resp.content[0] {
            ContentBlock::ToolUse { input, .. } => assert_eq!(input, &serde_json::json!({"a": 1, "b": 2})),
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn empty_tool_input_becomes_empty_object() {
        let mut acc = ResponseAccumulator::new();
        acc.add_event(started("m1")).unwrap();
        acc.add_event(Event::ContentBlockStart {
            index: 0,
            content_block: BlockStart::ToolUse { id: "t1".into(), name: "noop".into() },
        })
        .unwrap();
        acc.add_event(Event::ContentBlockStop { index: 0 }).unwrap();

        let resp = acc.response();
        match &resp.content[0] {
            ContentBlock::ToolUse { input, .. } => assert_eq!(input, &serde_json::json!({})),
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn message_start_twice_is_an_error() {
        let mut acc = ResponseAccumulator::new();
        acc.add_event(started("m1")).unwrap();
        let err = acc.add_event(started("m2")).unwrap_err();
        assert!(matches!(err, AccumulatorError::AlreadyStarted));
    }

    #[test]
    fn incomplete_stream_without_message_stop_is_not_complete() {
        let mut acc = ResponseAccumulator::new();
        acc.add_event(started("m1")).unwrap();
        assert!(!acc.is_complete());
    }

    #[test]
    fn prefill_is_prepended_once_with_no_closing_tag() {
        let mut acc = ResponseAccumulator::new().with_prefill(Some("P".to_string()), None);
        acc.add_event(started("m1")).unwrap();
        acc.add_event(Event::ContentBlockStart { index: 0, content_block: BlockStart::Text { cache_control: None } })
            .unwrap();
        acc.add_event(Event::ContentBlockDelta { index: 0, delta: Delta::TextDelta { text: "ello".into() } })
            .unwrap();
        acc.add_event(Event::ContentBlockDelta { index: 0, delta: Delta::TextDelta { text: " world".into() } })
            .unwrap();
        acc.add_event(Event::ContentBlockStop { index: 0 }).unwrap();

        let resp = acc.response();
        assert_eq!(resp.text(), "Pello world");
    }

    #[test]
    fn deltas_outside_a_started_block_lazily_create_a_text_block() {
        let mut acc = ResponseAccumulator::new();
        acc.add_event(started("m1")).unwrap();
        acc.add_event(Event::ContentBlockDelta { index: 0, delta: Delta::TextDelta { text: "hi".into() } })
            .unwrap();
        acc.add_event(Event::ContentBlockStop { index: 0 }).unwrap();
        assert_eq!(acc.response().text(), "hi");
    }
}
