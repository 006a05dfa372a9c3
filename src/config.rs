//! Request configuration (C2): a `Config` materialized by applying an
//! ordered list of option functions, mirroring `km_tools::ProviderConfig`'s
//! builder but generalized to every recognized option in spec section 4.2.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mcp::McpServer;
use crate::model::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoiceKind {
    Auto,
    Any,
    Tool,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolChoice {
    #[serde(rename = "type")]
    pub kind: ToolChoiceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormatKind {
    Text,
    JsonObject,
    JsonSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: ResponseFormatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Declarative context-management edit, applied client-side by
/// [`crate::context_management`] or passed through to providers with native
/// support (spec section 4.6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextManagementEdit {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<ContextManagementTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep: Option<ContextManagementKeep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_at_least: Option<u64>,
    #[serde(default)]
    pub exclude_tools: Vec<String>,
    #[serde(default)]
    pub clear_tool_inputs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextManagementTrigger {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextManagementKeep {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: Value,
}

/// A fully-resolved per-call configuration. Adapters consume this; unknown
/// fields are simply ignored by whichever adapter doesn't recognize them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_budget: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,

    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefill_closing_tag: Option<String>,

    #[serde(default)]
    pub mcp_servers: Vec<McpServer>,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caching: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default)]
    pub context_management: Vec<ContextManagementEdit>,

    #[serde(default)]
    pub features: Vec<String>,
}

impl Config {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

/// A function that mutates a `Config` in place. Options are applied in
/// order; later options override earlier ones for the same field.
pub type ConfigOption = Box<dyn FnOnce(&mut Config)>;

pub fn with_messages(messages: Vec<Message>) -> ConfigOption {
    Box::new(move |c| c.messages = messages)
}

pub fn with_system_prompt(prompt: impl Into<String>) -> ConfigOption {
    let prompt = prompt.into();
    Box::new(move |c| c.system_prompt = Some(prompt))
}

pub fn with_max_tokens(max_tokens: u32) -> ConfigOption {
    Box::new(move |c| c.max_tokens = Some(max_tokens))
}

pub fn with_temperature(temperature: f32) -> ConfigOption {
    Box::new(move |c| c.temperature = Some(temperature))
}

pub fn with_tools(tools: Vec<ToolDefinition>) -> ConfigOption {
    Box::new(move |c| c.tools = tools)
}

pub fn with_tool_choice(choice: ToolChoice) -> ConfigOption {
    Box::new(move |c| c.tool_choice = Some(choice))
}

pub fn with_prefill(prefill: impl Into<String>) -> ConfigOption {
    let prefill = prefill.into();
    Box::new(move |c| c.prefill = Some(prefill))
}

pub fn with_caching(caching: bool) -> ConfigOption {
    Box::new(move |c| c.caching = Some(caching))
}

pub fn with_mcp_servers(servers: Vec<McpServer>) -> ConfigOption {
    Box::new(move |c| c.mcp_servers = servers)
}

pub fn with_context_management(edits: Vec<ContextManagementEdit>) -> ConfigOption {
    Box::new(move |c| c.context_management = edits)
}

/// Apply a list of options to a base config, in order.
pub fn build_config(model: impl Into<String>, options: Vec<ConfigOption>) -> Config {
    let mut config = Config::new(model);
    for option in options {
        option(&mut config);
    }
    config
}
