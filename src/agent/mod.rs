//! Agent turn loop (C8): hooks, tool-call execution, and stop-hook
//! arbitration. Generalized from `km_tools::llm::helpers::{ChatLoopConfig,
//! chat_loop_with_tools}`'s "drive provider, execute tools, loop" shape —
//! its `on_content`/`on_tool_calls`/`on_tool_results` closures become the
//! six typed hook kinds below, and its `ChatLoopConfig::max_rounds` becomes
//! [`AgentConfig::max_iterations`].

pub mod loop_detector;

pub use loop_detector::{LoopAction, LoopDetection, LoopDetector, LoopDetectorConfig};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;

use crate::config::Config;
use crate::model::{ContentBlock, Message, Response};
use crate::provider::{AdapterError, Provider};
use crate::tools::{AutoConfirmer, ConfirmRequest, Confirmer, ToolError, ToolRegistry};

pub type HookValues = HashMap<String, Value>;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook '{name}' failed: {message}")]
    Failed { name: String, message: String },
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error("turn aborted: {0}")]
    Aborted(String),
}

/// Runs before the first generation of a turn. May rewrite the system
/// prompt, the message history, or shared hook state. An error aborts the
/// turn (spec section 4.8, step 1).
#[async_trait]
pub trait PreGenerationHook: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, system_prompt: &mut Option<String>, messages: &mut Vec<Message>, values: &mut HookValues) -> Result<(), HookError>;
}

/// Runs at the top of every loop iteration, before the generation call.
#[async_trait]
pub trait PreIterationHook: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, iteration: u32, values: &mut HookValues) -> Result<(), HookError>;
}

/// Runs after a generation completes. Errors are logged, not propagated
/// (spec section 4.8, step 2c).
#[async_trait]
pub trait PostGenerationHook: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, response: &Response, values: &mut HookValues) -> Result<(), HookError>;
}

/// Runs before a tool call executes. Returning `Some(result)` short-circuits
/// the actual tool invocation and substitutes this result instead.
#[async_trait]
pub trait PreToolHook: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, tool_name: &str, input: &Value, values: &mut HookValues) -> Option<Result<String, String>>;
}

/// Runs after a tool call executes (or was short-circuited). May rewrite the
/// textual result or flip the error flag.
#[async_trait]
pub trait PostToolHook: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, tool_name: &str, result: &mut String, is_error: &mut bool, values: &mut HookValues);
}

pub struct StopDecision {
    pub continue_turn: bool,
    pub reason: Option<String>,
}

/// Runs once the iteration loop would otherwise exit. Any hook returning
/// `continue_turn: true` re-enters the loop with an injected user message
/// carrying its `reason` (spec section 4.8, step 2f).
#[async_trait]
pub trait StopHook: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, messages: &[Message], values: &mut HookValues) -> StopDecision;
}

#[derive(Default)]
pub struct Hooks {
    pub pre_generation: Vec<Arc<dyn PreGenerationHook>>,
    pub pre_iteration: Vec<Arc<dyn PreIterationHook>>,
    pub post_generation: Vec<Arc<dyn PostGenerationHook>>,
    pub pre_tool: Vec<Arc<dyn PreToolHook>>,
    pub post_tool: Vec<Arc<dyn PostToolHook>>,
    pub stop: Vec<Arc<dyn StopHook>>,
}

pub struct AgentConfig {
    pub max_iterations: u32,
    pub parallel_tool_calls: bool,
    pub registry: ToolRegistry,
    pub confirmer: Arc<dyn Confirmer>,
    pub loop_detector: Option<Mutex<LoopDetector>>,
    pub hooks: Hooks,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 32,
            parallel_tool_calls: false,
            registry: ToolRegistry::new(),
            confirmer: Arc::new(AutoConfirmer),
            loop_detector: None,
            hooks: Hooks::default(),
        }
    }
}

/// Drives one turn to completion: generation, tool execution, and stop-hook
/// arbitration, per spec section 4.8's algorithm.
pub struct TurnLoop<P: Provider> {
    provider: P,
    config: AgentConfig,
}

impl<P: Provider> TurnLoop<P> {
    pub fn new(provider: P, config: AgentConfig) -> Self {
        Self { provider, config }
    }

    pub async fn run(&mut self, mut request: Config) -> Result<Response, RuntimeError> {
        let mut values = HookValues::new();

        for hook in &self.config.hooks.pre_generation {
            hook.run(&mut request.system_prompt, &mut request.messages, &mut values)
                .await
                .map_err(|e| RuntimeError::Aborted(format!("{}: {e}", hook.name())))?;
        }
        if !request.tools.is_empty() {
            // tools were already materialized by the caller's Config; nothing to merge here.
        } else {
            request.tools = self.config.registry.definitions();
        }

        let mut iteration: u32 = 0;
        let mut last_response: Option<Response> = None;

        loop {
            for hook in &self.config.hooks.pre_iteration {
                hook.run(iteration, &mut values).await?;
            }

            let response = self.provider.generate(&request).await?;

            for hook in &self.config.hooks.post_generation {
                if let Err(err) = hook.run(&response, &mut values).await {
                    log::warn!("post-generation hook '{}' failed: {err}", hook.name());
                }
            }

            request.messages.push(Message::new(crate::model::Role::Assistant, response.content.clone()));

            let tool_calls: Vec<&ContentBlock> = response.tool_calls();
            let has_tool_calls = !tool_calls.is_empty();

            if has_tool_calls {
                let results = self.execute_tool_calls(&tool_calls, &mut values).await;
                request.messages.push(Message::tool_results(results));
            }

            last_response = Some(response);

            if has_tool_calls && iteration < self.config.max_iterations {
                iteration += 1;
                continue;
            }

            let mut should_continue = false;
            for hook in &self.config.hooks.stop {
                let decision = hook.run(&request.messages, &mut values).await;
                if decision.continue_turn {
                    should_continue = true;
                    let reason = decision.reason.unwrap_or_else(|| "continue".to_string());
                    request.messages.push(Message::user_text(reason));
                    break;
                }
            }

            if should_continue && iteration < self.config.max_iterations {
                iteration += 1;
                continue;
            }

            break;
        }

        last_response.ok_or_else(|| RuntimeError::Aborted("no response produced".into()))
    }

    /// Executes tool calls, preserving the originating block order in the
    /// returned results even when run concurrently (spec section 4.8/5). In
    /// the parallel case each call gets an isolated `hook_values` view,
    /// merged back into the shared map once every call completes.
    async fn execute_tool_calls(&self, tool_calls: &[&ContentBlock], values: &mut HookValues) -> Vec<ContentBlock> {
        if self.config.parallel_tool_calls {
            let this: &Self = self;
            let futures: Vec<_> = tool_calls
                .iter()
                .map(|block| {
                    let mut isolated = values.clone();
                    let block = (*block).clone();
                    async move {
                        let result = this.invoke_one(&block, &mut isolated).await;
                        (result, isolated)
                    }
                })
                .collect();
            let outcomes = join_all(futures).await;
            let mut results = Vec::with_capacity(outcomes.len());
            for (result, isolated) in outcomes {
                values.extend(isolated);
                results.push(result);
            }
            results
        } else {
            let mut out = Vec::with_capacity(tool_calls.len());
            for block in tool_calls {
                out.push(self.invoke_one(block, values).await);
            }
            out
        }
    }

    async fn invoke_one(&self, block: &ContentBlock, values: &mut HookValues) -> ContentBlock {
        let (id, name, input) = match block {
            ContentBlock::ToolUse { id, name, input } | ContentBlock::ServerToolUse { id, name, input } => (id.clone(), name.clone(), input.clone()),
            _ => unreachable!("execute_tool_calls only receives tool_use blocks"),
        };

        let mut is_error = false;
        let mut text = String::new();
        let mut warning: Option<String> = None;

        if let Some(detector) = &self.config.loop_detector {
            let detected = detector.lock().unwrap().check(block);
            if let Some(detection) = detected {
                match detection.action {
                    LoopAction::Terminate => {
                        return ContentBlock::tool_result(
                            id,
                            format!("tool '{name}' blocked: repeated call pattern detected"),
                            true,
                        );
                    }
                    LoopAction::Warn => warning = detection.warning_message,
                    LoopAction::Continue => {}
                }
            }
        }

        let short_circuit = self.short_circuit(&name, &input, values).await;
        match short_circuit {
            Some(Ok(output)) => text = output,
            Some(Err(message)) => {
                is_error = true;
                text = message;
            }
            None => {
                let confirm_req = ConfirmRequest { tool_name: name.clone(), input: input.clone() };
                let needs_confirmation = self.config.registry.get(&name).map(|t| t.annotations().destructive).unwrap_or(false);
                if needs_confirmation && !self.config.confirmer.confirm(&confirm_req).await {
                    is_error = true;
                    text = format!("tool '{name}' was not confirmed");
                } else {
                    match self.config.registry.call(&name, input.clone()).await {
                        Ok(content) => text = render_tool_result(content),
                        Err(ToolError::NotFound { .. }) => {
                            is_error = true;
                            text = format!("tool '{name}' is not registered");
                        }
                        Err(err) => {
                            is_error = true;
                            text = err.to_string();
                        }
                    }
                }
            }
        }

        if let Some(warning) = warning {
            text = format!("{warning}\n\n{text}");
        }

        for hook in &self.config.hooks.post_tool {
            hook.run(&name, &mut text, &mut is_error, values).await;
        }

        ContentBlock::tool_result(id, text, is_error)
    }

    async fn short_circuit(&self, name: &str, input: &Value, values: &mut HookValues) -> Option<Result<String, String>> {
        for hook in &self.config.hooks.pre_tool {
            if let Some(result) = hook.run(name, input, values).await {
                return Some(result);
            }
        }
        None
    }
}

fn render_tool_result(content: crate::model::ToolResultContent) -> String {
    match content {
        crate::model::ToolResultContent::Text(t) => t,
        other => serde_json::to_string(&other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role, StopReason, Usage};
    use async_trait::async_trait as at;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedProvider {
        responses: Mutex<Vec<Response>>,
    }

    #[at]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn generate(&self, _config: &Config) -> Result<Response, AdapterError> {
            let mut responses = self.responses.lock().unwrap();
            Ok(responses.remove(0))
        }
        async fn stream(&self, _config: &Config) -> Result<crate::provider::ResponseStream, AdapterError> {
            unimplemented!()
        }
    }

    fn text_response(text: &str) -> Response {
        Response {
            id: "r".into(),
            model: "m".into(),
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
            stop_reason: StopReason::EndTurn,
            stop_sequence: None,
            usage: Usage::default(),
            context_management_applied: None,
        }
    }

    fn tool_call_response(name: &str) -> Response {
        Response {
            id: "r".into(),
            model: "m".into(),
            role: Role::Assistant,
            content: vec![ContentBlock::tool_use("t1", name, serde_json::json!({}))],
            stop_reason: StopReason::ToolUse,
            stop_sequence: None,
            usage: Usage::default(),
            context_management_applied: None,
        }
    }

    struct EchoTool;

    #[at]
    impl crate::tools::Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn schema(&self) -> Value {
            serde_json::json!({"type":"object"})
        }
        async fn call(&self, _input: Value) -> Result<crate::model::ToolResultContent, ToolError> {
            Ok(crate::model::ToolResultContent::text("echoed"))
        }
    }

    #[tokio::test]
    async fn single_iteration_returns_final_text_response() {
        let provider = ScriptedProvider { responses: Mutex::new(vec![text_response("hello")]) };
        let mut turn = TurnLoop::new(provider, AgentConfig::default());
        let mut config = Config::new("m");
        config.messages.push(Message::user_text("hi"));
        let response = turn.run(config).await.unwrap();
        assert_eq!(response.text(), "hello");
    }

    #[tokio::test]
    async fn tool_call_loops_back_and_appends_results_in_order() {
        let provider = ScriptedProvider { responses: Mutex::new(vec![tool_call_response("echo"), text_response("done")]) };
        let mut agent_config = AgentConfig::default();
        agent_config.registry.register(Arc::new(EchoTool));
        let mut turn = TurnLoop::new(provider, agent_config);
        let mut config = Config::new("m");
        config.messages.push(Message::user_text("hi"));
        let response = turn.run(config).await.unwrap();
        assert_eq!(response.text(), "done");
    }

    fn multi_tool_call_response() -> Response {
        Response {
            id: "r".into(),
            model: "m".into(),
            role: Role::Assistant,
            content: vec![
                ContentBlock::tool_use("t1", "echo", serde_json::json!({})),
                ContentBlock::tool_use("t2", "echo", serde_json::json!({})),
            ],
            stop_reason: StopReason::ToolUse,
            stop_sequence: None,
            usage: Usage::default(),
            context_management_applied: None,
        }
    }

    #[tokio::test]
    async fn parallel_tool_calls_all_execute_and_results_stay_ordered() {
        let provider = ScriptedProvider { responses: Mutex::new(vec![multi_tool_call_response(), text_response("done")]) };
        let mut agent_config = AgentConfig::default();
        agent_config.parallel_tool_calls = true;
        agent_config.registry.register(Arc::new(EchoTool));
        let mut turn = TurnLoop::new(provider, agent_config);
        let mut config = Config::new("m");
        config.messages.push(Message::user_text("hi"));
        let response = turn.run(config).await.unwrap();
        assert_eq!(response.text(), "done");
    }

    struct CountingStopHook {
        calls: AtomicUsize,
    }

    #[at]
    impl StopHook for CountingStopHook {
        fn name(&self) -> &str {
            "counting-stop"
        }
        async fn run(&self, _messages: &[Message], _values: &mut HookValues) -> StopDecision {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                StopDecision { continue_turn: true, reason: Some("keep going".into()) }
            } else {
                StopDecision { continue_turn: false, reason: None }
            }
        }
    }

    #[tokio::test]
    async fn stop_hook_continue_reenters_the_loop_once() {
        let provider = ScriptedProvider { responses: Mutex::new(vec![text_response("first"), text_response("second")]) };
        let mut agent_config = AgentConfig::default();
        agent_config.hooks.stop.push(Arc::new(CountingStopHook { calls: AtomicUsize::new(0) }));
        let mut turn = TurnLoop::new(provider, agent_config);
        let mut config = Config::new("m");
        config.messages.push(Message::user_text("hi"));
        let response = turn.run(config).await.unwrap();
        assert_eq!(response.text(), "second");
    }
}
