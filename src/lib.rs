//! Provider-agnostic runtime for driving LLM conversations: a canonical
//! message/content-block model (C1), a provider adapter contract spanning
//! Anthropic, OpenAI Responses, and OpenAI-compatible completions backends
//! (C5/C6), a shared SSE streaming pipeline feeding a response accumulator
//! (C3/C4), client-side context management (C4.6), a tool registry (C7), an
//! agent turn loop with hooks and loop detection (C8), and session
//! persistence with in-memory and append-only file backends (C9).

pub mod accumulator;
pub mod agent;
pub mod config;
pub mod context_management;
pub mod mcp;
pub mod model;
pub mod provider;
pub mod session;
pub mod sse;
pub mod tools;

pub use accumulator::{Event, ResponseAccumulator};
pub use config::{build_config, Config, ToolChoice, ToolChoiceKind, ToolDefinition};
pub use mcp::{pair_mcp_calls, McpCallPair, McpServer};
pub use model::{ContentBlock, Message, Response, Role, StopReason, Usage};
pub use provider::{AdapterError, Provider};
pub use session::{Session, SessionError, SessionStore};
pub use tools::{Tool, ToolError, ToolRegistry};
