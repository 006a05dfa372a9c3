//! Messages, roles, usage accounting, and the materialized [`Response`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::content::ContentBlock;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("decode error: {0}")]
    DecodeError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One message in a conversation. `content` must be non-empty before a
/// message is sent to a provider; `tool_use` blocks only ever appear in
/// `Assistant` messages and `tool_result` blocks only in `User` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self { id: None, role, content }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)])
    }

    pub fn system_text(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentBlock::text(text)])
    }

    /// A user message carrying tool-result blocks, keyed by `tool_use_id`.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self::new(Role::User, results)
    }

    /// Concatenation of all text blocks' text, joined by a blank line.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// The last text block's text, or an empty string if there is none.
    pub fn last_text(&self) -> String {
        self.content
            .iter()
            .rev()
            .find_map(ContentBlock::as_text)
            .unwrap_or_default()
            .to_string()
    }

    /// Parse the last text block as JSON into `T`.
    pub fn decode_into<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ContentError> {
        Ok(serde_json::from_str(&self.last_text())?)
    }

    /// Deep clone via a JSON round-trip, matching the spec's mandated
    /// default for session-event immutability and fork isolation.
    pub fn deep_copy(&self) -> Self {
        serde_json::from_value(serde_json::to_value(self).expect("Message always serializes"))
            .expect("Message round-trips through its own schema")
    }

    pub fn tool_use_blocks(&self) -> impl Iterator<Item = &ContentBlock> {
        self.content.iter().filter(|b| b.is_tool_use())
    }
}

/// Token accounting for one generation or one accumulated stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            cache_creation_input_tokens: self.cache_creation_input_tokens + rhs.cache_creation_input_tokens,
            cache_read_input_tokens: self.cache_read_input_tokens + rhs.cache_read_input_tokens,
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

/// Canonical stop-reason, normalized from whichever vocabulary the backing
/// provider uses (see `provider::stop_reason` mapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    Refusal,
}

/// A fully materialized model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub model: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_management_applied: Option<Value>,
}

impl Response {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn last_text(&self) -> String {
        self.content
            .iter()
            .rev()
            .find_map(ContentBlock::as_text)
            .unwrap_or_default()
            .to_string()
    }

    /// The subset of `content` that represents tool invocations requested by
    /// the model.
    pub fn tool_calls(&self) -> Vec<&ContentBlock> {
        self.content.iter().filter(|b| b.is_tool_use()).collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content.iter().any(|b| b.is_tool_use())
    }
}
