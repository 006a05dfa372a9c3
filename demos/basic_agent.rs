//! Minimal end-to-end use of the runtime: register a tool, drive a turn
//! loop against the Anthropic adapter until the model stops asking for
//! tools, and print the final text.
//!
//! Run with: cargo run --example basic_agent

use std::sync::Arc;

use llm_runtime::agent::{AgentConfig, TurnLoop};
use llm_runtime::config::{build_config, with_max_tokens, with_system_prompt};
use llm_runtime::provider::anthropic::AnthropicAdapter;
use llm_runtime::tools::{BashTool, ToolRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let provider = AnthropicAdapter::from_env()?;

    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(BashTool::new()));

    let agent_config = AgentConfig { registry, ..Default::default() };
    let mut turn_loop = TurnLoop::new(provider, agent_config);

    let request = build_config(
        "claude-sonnet-4-5",
        vec![
            with_system_prompt("You can run shell commands with the bash tool."),
            with_max_tokens(1024),
            llm_runtime::config::with_messages(vec![llm_runtime::model::Message::user_text(
                "What files are in the current directory?",
            )]),
        ],
    );

    let response = turn_loop.run(request).await?;
    println!("{}", response.text());
    Ok(())
}
