//! Polymorphic content blocks: the tagged-union payload of a [`Message`](super::message::Message).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ephemeral cache-control marker attachable to the last content block of the
/// last message in a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: String,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            kind: "ephemeral".to_string(),
        }
    }
}

/// Source of an image or document content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
    File { file_id: String },
    Content { chunks: Vec<ContentBlock> },
    Generated {
        generation_id: String,
        generation_status: String,
        media_type: String,
        data: String,
    },
}

/// A citation attached to a text content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Citation {
    CharLocation {
        document_index: u32,
        start_char_index: u32,
        end_char_index: u32,
        cited_text: String,
    },
    WebSearchResultLocation {
        url: String,
        title: Option<String>,
        encrypted_index: String,
        cited_text: String,
    },
}

/// The body of a `tool_result` content block. Providers accept either a
/// plain string, a list of sub-blocks (e.g. text + image), or an opaque
/// structured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Chunks(Vec<ContentBlock>),
    Structured(Value),
}

impl ToolResultContent {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }
}

/// A single tagged element of a message's content list. The `type` field is
/// the discriminator; unknown types fail to decode rather than being
/// silently dropped (see [`super::ContentError::UnsupportedContentType`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
        #[serde(skip_serializing_if = "Option::is_none")]
        citations: Option<Vec<Citation>>,
    },
    Image {
        source: ContentSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Document {
        source: ContentSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        citations_enabled: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: ToolResultContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    ServerToolUse {
        id: String,
        name: String,
        input: Value,
    },
    WebSearchToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        results: Option<Vec<Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    McpToolUse {
        id: String,
        name: String,
        server_label: String,
        input: Value,
    },
    McpToolResult {
        tool_use_id: String,
        content: ToolResultContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    McpListTools {
        server_label: String,
        tools: Vec<Value>,
    },
    McpApprovalRequest {
        id: String,
        server_label: String,
        name: String,
        arguments: Value,
    },
    McpApprovalResponse {
        approval_request_id: String,
        approve: bool,
    },
    CodeInterpreterCall {
        id: String,
        code: String,
        #[serde(default)]
        results: Vec<Value>,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container_id: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            cache_control: None,
            citations: None,
        }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<ToolResultContent>, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: if is_error { Some(true) } else { None },
        }
    }

    pub fn image(source: ContentSource) -> Self {
        Self::Image {
            source,
            cache_control: None,
        }
    }

    pub fn document(source: ContentSource) -> Self {
        Self::Document {
            source,
            title: None,
            context: None,
            citations_enabled: None,
            cache_control: None,
        }
    }

    /// Attach an ephemeral cache-control marker, returning a new block. Never
    /// mutates `self` in place so callers can clone-before-mutate per the
    /// caller-owned-content invariant.
    pub fn with_cache_control(mut self) -> Self {
        match &mut self {
            Self::Text { cache_control, .. } | Self::Image { cache_control, .. } | Self::Document { cache_control, .. } => {
                *cache_control = Some(CacheControl::ephemeral());
            }
            _ => {}
        }
        self
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. } | Self::ServerToolUse { .. })
    }

    pub fn tool_use_id(&self) -> Option<&str> {
        match self {
            Self::ToolUse { id, .. } | Self::ServerToolUse { id, .. } => Some(id.as_str()),
            _ => None,
        }
    }
}

impl From<String> for ToolResultContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for ToolResultContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}
