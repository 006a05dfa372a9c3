//! MCP config surface (C10): remote tool-server descriptors passed through
//! to providers that support server-side MCP invocation. This crate owns no
//! transport for these; it only carries the descriptor and pairs
//! `mcp_tool_use`/`mcp_tool_result` content blocks by id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::ContentBlock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServer {
    pub server_label: String,
    pub server_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_token: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_approval: Option<Value>,
}

/// A paired `mcp_tool_use` + `mcp_tool_result`, ready to be combined into a
/// single `mcp_call` wire item by an adapter that wants that shape.
#[derive(Debug, Clone, PartialEq)]
pub struct McpCallPair<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub server_label: &'a str,
    pub input: &'a Value,
    pub result: Option<&'a ContentBlock>,
}

/// Two-pointer scan over an assistant message's content list, pairing each
/// `mcp_tool_use` with the next `mcp_tool_result` that shares its id.
/// Orphan results (no matching use) are dropped, as are orphan uses (no
/// matching result) which are returned with `result: None` for callers that
/// want to surface them as still-pending.
pub fn pair_mcp_calls(content: &[ContentBlock]) -> Vec<McpCallPair<'_>> {
    let mut processed = vec![false; content.len()];
    let mut pairs = Vec::new();

    for (i, block) in content.iter().enumerate() {
        if processed[i] {
            continue;
        }
        if let ContentBlock::McpToolUse { id, name, server_label, input } = block {
            processed[i] = true;
            let result = content.iter().enumerate().find_map(|(j, candidate)| {
                if processed[j] {
                    return None;
                }
                match candidate {
                    ContentBlock::McpToolResult { tool_use_id, .. } if tool_use_id == id => {
                        processed[j] = true;
                        Some(candidate)
                    }
                    _ => None,
                }
            });
            pairs.push(McpCallPair {
                id,
                name,
                server_label,
                input,
                result,
            });
        }
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pairs_tool_use_with_matching_result_and_ignores_orphans() {
        let content = vec![
            ContentBlock::McpToolUse {
                id: "u1".into(),
                name: "search".into(),
                server_label: "docs".into(),
                input: json!({"q": "rust"}),
            },
            ContentBlock::McpToolResult {
                tool_use_id: "u1".into(),
                content: "found it".into(),
                is_error: None,
            },
            ContentBlock::McpToolResult {
                tool_use_id: "orphan".into(),
                content: "nobody asked".into(),
                is_error: None,
            },
        ];

        let pairs = pair_mcp_calls(&content);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].id, "u1");
        assert!(pairs[0].result.is_some());
    }
}
