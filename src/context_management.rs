//! Context-management option (spec section 4.6). Client-side realization of
//! the declarative edit list, grounded on `km_tools`'s
//! `prune_message_tool_turns`/`prune_tool_turns` sliding-window pruning,
//! generalized from a single `max_turns` integer into the full
//! `{type, trigger, keep, clear_at_least, exclude_tools, clear_tool_inputs}`
//! edit shape.

use serde::{Deserialize, Serialize};

use crate::config::ContextManagementEdit;
use crate::model::{ContentBlock, Message};

/// One applied edit, echoed back to the caller the way a provider's native
/// context-management response does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedEdit {
    #[serde(rename = "type")]
    pub kind: String,
    pub cleared_input_count: usize,
    pub original_input_tokens: u64,
}

/// A contiguous `(tool_use message index, tool_result message index)` pair
/// representing one "tool turn" in the message history.
struct ToolTurn {
    assistant_index: usize,
    user_index: usize,
    tool_names: Vec<String>,
}

fn find_tool_turns(messages: &[Message]) -> Vec<ToolTurn> {
    let mut turns = Vec::new();
    let mut i = 0;
    while i + 1 < messages.len() {
        let names: Vec<String> = messages[i]
            .tool_use_blocks()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { name, .. } | ContentBlock::ServerToolUse { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        if !names.is_empty() {
            let has_result = messages[i + 1]
                .content
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolResult { .. }));
            if has_result {
                turns.push(ToolTurn { assistant_index: i, user_index: i + 1, tool_names: names });
                i += 2;
                continue;
            }
        }
        i += 1;
    }
    turns
}

/// Apply every `clear_tool_uses`-kind edit to `messages` in place, returning
/// the edits that actually fired. `input_tokens_estimate` stands in for
/// whatever token counter the caller has available; an edit without a
/// `trigger` always fires.
pub fn apply(messages: &mut Vec<Message>, edits: &[ContextManagementEdit], input_tokens_estimate: u64) -> Vec<AppliedEdit> {
    let mut applied = Vec::new();

    for edit in edits {
        if edit.kind != "clear_tool_uses" {
            continue;
        }
        if let Some(trigger) = &edit.trigger {
            if trigger.kind == "input_tokens" && input_tokens_estimate < trigger.value {
                continue;
            }
        }

        let keep_last = edit
            .keep
            .as_ref()
            .and_then(|k| k.value.as_u64())
            .unwrap_or(0) as usize;

        let turns = find_tool_turns(messages);
        if turns.len() <= keep_last {
            continue;
        }

        let eligible: Vec<&ToolTurn> = turns
            .iter()
            .filter(|t| edit.exclude_tools.is_empty() || !t.tool_names.iter().any(|n| edit.exclude_tools.contains(n)))
            .collect();

        let mut to_clear = eligible.len().saturating_sub(keep_last);
        if let Some(min) = edit.clear_at_least {
            to_clear = to_clear.max(min as usize).min(eligible.len());
        }
        if to_clear == 0 {
            continue;
        }

        let targets = &eligible[..to_clear];
        if edit.clear_tool_inputs {
            for turn in targets {
                if let Some(msg) = messages.get_mut(turn.assistant_index) {
                    for block in &mut msg.content {
                        if let ContentBlock::ToolUse { input, .. } = block {
                            *input = serde_json::json!({});
                        }
                    }
                }
            }
        } else {
            let mut remove_indices: Vec<usize> = targets.iter().flat_map(|t| [t.assistant_index, t.user_index]).collect();
            remove_indices.sort_unstable();
            remove_indices.reverse();
            for idx in remove_indices {
                messages.remove(idx);
            }
        }

        applied.push(AppliedEdit {
            kind: edit.kind.clone(),
            cleared_input_count: to_clear,
            original_input_tokens: input_tokens_estimate,
        });
    }

    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextManagementKeep, ContextManagementTrigger};
    use serde_json::json;

    fn tool_turn(id: &str) -> [Message; 2] {
        [
            Message::new(
                crate::model::Role::Assistant,
                vec![ContentBlock::tool_use(id, "bash", json!({"command": "ls"}))],
            ),
            Message::new(
                crate::model::Role::User,
                vec![ContentBlock::tool_result(id, "ok", false)],
            ),
        ]
    }

    #[test]
    fn clears_oldest_tool_turns_beyond_keep_threshold() {
        let mut messages = vec![Message::user_text("start")];
        for i in 0..4 {
            messages.extend(tool_turn(&format!("t{i}")));
        }

        let edit = ContextManagementEdit {
            kind: "clear_tool_uses".into(),
            trigger: None,
            keep: Some(ContextManagementKeep { kind: "tool_uses".into(), value: json!(1) }),
            clear_at_least: None,
            exclude_tools: vec![],
            clear_tool_inputs: false,
        };

        let applied = apply(&mut messages, &[edit], 0);
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].cleared_input_count, 3);
        assert_eq!(find_tool_turns(&messages).len(), 1);
    }

    #[test]
    fn trigger_gates_whether_the_edit_fires() {
        let mut messages = vec![Message::user_text("start")];
        messages.extend(tool_turn("t0"));
        messages.extend(tool_turn("t1"));

        let edit = ContextManagementEdit {
            kind: "clear_tool_uses".into(),
            trigger: Some(ContextManagementTrigger { kind: "input_tokens".into(), value: 1_000_000 }),
            keep: None,
            clear_at_least: None,
            exclude_tools: vec![],
            clear_tool_inputs: false,
        };

        let applied = apply(&mut messages, &[edit], 10);
        assert!(applied.is_empty());
        assert_eq!(find_tool_turns(&messages).len(), 2);
    }

    #[test]
    fn clear_tool_inputs_keeps_messages_but_blanks_arguments() {
        let mut messages = vec![Message::user_text("start")];
        messages.extend(tool_turn("t0"));
        messages.extend(tool_turn("t1"));

        let edit = ContextManagementEdit {
            kind: "clear_tool_uses".into(),
            trigger: None,
            keep: None,
            clear_at_least: None,
            exclude_tools: vec![],
            clear_tool_inputs: true,
        };

        apply(&mut messages, &[edit], 0);
        assert_eq!(messages.len(), 5);
        match &messages[1].content[0] {
            ContentBlock::ToolUse { input, .. } => assert_eq!(input, &json!({})),
            other => panic!("expected tool_use, got {other:?}"),
        }
    }
}
