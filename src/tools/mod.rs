//! Tool registry & invocation (C7): a `Tool` trait, a name-keyed
//! `ToolRegistry`, and a `Confirmer` capability gating destructive calls.

pub mod bash;
pub mod editor_edit;

pub use bash::BashTool;
pub use editor_edit::EditorEditTool;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::ToolDefinition;
use crate::model::ToolResultContent;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool '{name}' not found in registry")]
    NotFound { name: String },
    #[error("tool '{name}' denied confirmation")]
    NotConfirmed { name: String },
    #[error("tool '{name}' failed: {message}")]
    CallFailed { name: String, message: String },
}

/// Behavior hints a tool publishes about itself (spec section 4.7).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Annotations {
    pub read_only: bool,
    pub destructive: bool,
    pub idempotent: bool,
    pub open_world: bool,
}

/// A callable capability exposed to the model. Server-side/provider-hosted
/// tools (web search, code execution, computer use) are expected to return
/// `ToolError::CallFailed` from `call` and instead contribute a
/// configuration descriptor to the adapter directly — `Tool` only models
/// client-executed tools.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> Value;

    fn annotations(&self) -> Annotations {
        Annotations::default()
    }

    async fn call(&self, input: Value) -> Result<ToolResultContent, ToolError>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.schema(),
        }
    }
}

/// A request to confirm a pending tool call before it executes.
#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    pub tool_name: String,
    pub input: Value,
}

/// Gates destructive tool calls. `auto` always approves, `deny` always
/// denies (spec section 4.7); a closure-backed implementation lets callers
/// prompt a human or consult a policy.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, request: &ConfirmRequest) -> bool;
}

pub struct AutoConfirmer;

#[async_trait]
impl Confirmer for AutoConfirmer {
    async fn confirm(&self, _request: &ConfirmRequest) -> bool {
        true
    }
}

pub struct DenyConfirmer;

#[async_trait]
impl Confirmer for DenyConfirmer {
    async fn confirm(&self, _request: &ConfirmRequest) -> bool {
        false
    }
}

pub struct ClosureConfirmer<F> {
    f: F,
}

impl<F> ClosureConfirmer<F>
where
    F: Fn(&ConfirmRequest) -> bool + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Confirmer for ClosureConfirmer<F>
where
    F: Fn(&ConfirmRequest) -> bool + Send + Sync,
{
    async fn confirm(&self, request: &ConfirmRequest) -> bool {
        (self.f)(request)
    }
}

/// A name-keyed collection of callable tools, handed to the turn loop (C8)
/// and used to build the `tools[]` field of a `Config`.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub async fn call(&self, name: &str, input: Value) -> Result<ToolResultContent, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::NotFound { name: name.to_string() })?;
        tool.call(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input back as text"
        }
        fn schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn call(&self, input: Value) -> Result<ToolResultContent, ToolError> {
            Ok(ToolResultContent::text(input.to_string()))
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let result = registry.call("echo", serde_json::json!({"a": 1})).await.unwrap();
        assert_eq!(result, ToolResultContent::text("{\"a\":1}"));
    }

    #[tokio::test]
    async fn registry_reports_missing_tool() {
        let registry = ToolRegistry::new();
        let err = registry.call("missing", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
    }

    #[tokio::test]
    async fn deny_confirmer_always_declines() {
        let confirmer = DenyConfirmer;
        let req = ConfirmRequest { tool_name: "bash".into(), input: serde_json::json!({}) };
        assert!(!confirmer.confirm(&req).await);
    }

    #[tokio::test]
    async fn closure_confirmer_delegates_to_closure() {
        let confirmer = ClosureConfirmer::new(|req: &ConfirmRequest| req.tool_name == "safe");
        assert!(confirmer.confirm(&ConfirmRequest { tool_name: "safe".into(), input: serde_json::json!({}) }).await);
        assert!(!confirmer.confirm(&ConfirmRequest { tool_name: "unsafe".into(), input: serde_json::json!({}) }).await);
    }
}
