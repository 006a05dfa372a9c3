//! Content & Message model (C1): the canonical, provider-agnostic data model
//! that every adapter translates to and from.

mod content;
mod message;

pub use content::{CacheControl, Citation, ContentBlock, ContentSource, ToolResultContent};
pub use message::{ContentError, Message, Response, Role, StopReason, Usage};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip_preserves_structural_equality() {
        let msg = Message::new(
            Role::Assistant,
            vec![
                ContentBlock::text("hello"),
                ContentBlock::tool_use("t1", "add", json!({"a": 1, "b": 2})),
            ],
        );
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn text_concatenation_joins_with_blank_line() {
        let msg = Message::new(
            Role::Assistant,
            vec![ContentBlock::text("first"), ContentBlock::text("second")],
        );
        assert_eq!(msg.text(), "first\n\nsecond");
        assert_eq!(msg.last_text(), "second");
    }

    #[test]
    fn last_text_is_empty_when_no_text_block_present() {
        let msg = Message::new(Role::Assistant, vec![ContentBlock::tool_use("t1", "x", json!({}))]);
        assert_eq!(msg.last_text(), "");
    }

    #[test]
    fn deep_copy_is_independent_value_equal_clone() {
        let msg = Message::user_text("hi");
        let copy = msg.deep_copy();
        assert_eq!(msg, copy);
    }

    #[test]
    fn decode_into_parses_last_text_block_as_json() {
        #[derive(serde::Deserialize, PartialEq, Debug)]
        struct Payload {
            x: i32,
        }
        let msg = Message::assistant_text(r#"{"x": 42}"#);
        let payload: Payload = msg.decode_into().unwrap();
        assert_eq!(payload, Payload { x: 42 });
    }

    #[test]
    fn unknown_content_type_fails_to_decode() {
        let raw = json!({"type": "not_a_real_type", "foo": "bar"});
        let err = serde_json::from_value::<ContentBlock>(raw).unwrap_err();
        assert!(err.to_string().contains("not_a_real_type") || err.is_data());
    }

    #[test]
    fn usage_add_is_componentwise() {
        let a = Usage {
            input_tokens: 1,
            output_tokens: 2,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        };
        let b = Usage {
            input_tokens: 3,
            output_tokens: 4,
            cache_creation_input_tokens: 1,
            cache_read_input_tokens: 1,
        };
        let sum = a + b;
        assert_eq!(sum.input_tokens, 4);
        assert_eq!(sum.output_tokens, 6);
        assert_eq!(sum.cache_creation_input_tokens, 1);
        assert_eq!(sum.cache_read_input_tokens, 1);
    }

    #[test]
    fn response_tool_calls_filters_content() {
        let resp = Response {
            id: "r1".into(),
            model: "m".into(),
            role: Role::Assistant,
            content: vec![ContentBlock::text("hi"), ContentBlock::tool_use("t1", "add", json!({}))],
            stop_reason: StopReason::ToolUse,
            stop_sequence: None,
            usage: Usage::default(),
            context_management_applied: None,
        };
        assert_eq!(resp.tool_calls().len(), 1);
        assert!(resp.has_tool_calls());
    }
}
