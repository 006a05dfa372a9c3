//! Loop detection for repetitive tool-calling patterns. Kept close to
//! `km_tools::llm::loop_detector::LoopDetector`'s exact-duplicate and
//! oscillating-pattern (A→B→A→B) checks, retargeted from the teacher's
//! `ToolCall{id,name,arguments}` onto the crate's canonical `tool_use`
//! content blocks via the local [`Invocation`] view.

use std::collections::VecDeque;

use serde_json::Value;

use crate::model::ContentBlock;

#[derive(Debug, Clone, PartialEq)]
struct Invocation {
    name: String,
    arguments: Value,
}

impl Invocation {
    fn from_block(block: &ContentBlock) -> Option<Self> {
        match block {
            ContentBlock::ToolUse { name, input, .. } | ContentBlock::ServerToolUse { name, input, .. } => {
                Some(Self { name: name.clone(), arguments: input.clone() })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    Warn,
    Terminate,
}

#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    pub max_exact_duplicates: usize,
    pub exact_window_size: usize,
    pub enable_pattern_detection: bool,
    pub min_pattern_length: usize,
    pub max_pattern_length: usize,
    pub pattern_window_size: usize,
    pub first_detection_action: LoopAction,
    pub second_detection_action: LoopAction,
    pub third_detection_action: LoopAction,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            max_exact_duplicates: 3,
            exact_window_size: 10,
            enable_pattern_detection: true,
            min_pattern_length: 2,
            max_pattern_length: 3,
            pattern_window_size: 20,
            first_detection_action: LoopAction::Warn,
            second_detection_action: LoopAction::Warn,
            third_detection_action: LoopAction::Terminate,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LoopType {
    ExactDuplicate { name: String, count: usize },
    Pattern { names: Vec<String>, repetitions: usize },
}

#[derive(Debug, Clone)]
pub struct LoopDetection {
    pub loop_type: LoopType,
    pub action: LoopAction,
    pub detection_count: usize,
    pub warning_message: Option<String>,
}

pub struct LoopDetector {
    config: LoopDetectorConfig,
    recent_calls: VecDeque<Invocation>,
    detection_count: usize,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::with_config(LoopDetectorConfig::default())
    }

    pub fn with_config(config: LoopDetectorConfig) -> Self {
        let capacity = config.exact_window_size.max(config.pattern_window_size);
        Self { config, recent_calls: VecDeque::with_capacity(capacity), detection_count: 0 }
    }

    /// Check `block` (a `tool_use`/`server_tool_use` content block) against
    /// recent history before it executes. Non-tool-use blocks are ignored.
    pub fn check(&mut self, block: &ContentBlock) -> Option<LoopDetection> {
        let call = Invocation::from_block(block)?;

        if let Some(mut detection) = self.check_exact_duplicate(&call) {
            self.detection_count += 1;
            self.apply_action_policy(&mut detection);
            self.record_call(call);
            return Some(detection);
        }

        if self.config.enable_pattern_detection {
            if let Some(mut detection) = self.check_pattern(&call) {
                self.detection_count += 1;
                self.apply_action_policy(&mut detection);
                self.record_call(call);
                return Some(detection);
            }
        }

        self.record_call(call);
        None
    }

    fn apply_action_policy(&self, detection: &mut LoopDetection) {
        detection.detection_count = self.detection_count;
        let action = match self.detection_count {
            1 => self.config.first_detection_action,
            2 => self.config.second_detection_action,
            _ => self.config.third_detection_action,
        };
        detection.action = action;
        if action == LoopAction::Warn {
            detection.warning_message = Some(self.generate_warning_message(detection));
        }
    }

    fn generate_warning_message(&self, detection: &LoopDetection) -> String {
        let ordinal = match self.detection_count {
            1 => "first",
            2 => "second",
            3 => "third",
            n => return format!("Loop detected {n} times"),
        };
        let description = match &detection.loop_type {
            LoopType::ExactDuplicate { name, count } => {
                format!("The tool '{name}' has been called with identical arguments {count} times in a row")
            }
            LoopType::Pattern { names, repetitions } => {
                format!("A repeating pattern of tool calls [{}] has occurred {repetitions} times", names.join(" -> "))
            }
        };
        format!(
            "LOOP DETECTION WARNING ({ordinal}): {description}\n\
             This appears to be unproductive. Consider a different approach, asking for \
             clarification, or explaining the limitation instead of repeating the same calls."
        )
    }

    fn check_exact_duplicate(&self, call: &Invocation) -> Option<LoopDetection> {
        let count = self.recent_calls.iter().rev().take(self.config.exact_window_size).filter(|c| *c == call).count();
        if count >= self.config.max_exact_duplicates {
            Some(LoopDetection {
                loop_type: LoopType::ExactDuplicate { name: call.name.clone(), count: count + 1 },
                action: LoopAction::Warn,
                detection_count: 0,
                warning_message: None,
            })
        } else {
            None
        }
    }

    fn check_pattern(&self, call: &Invocation) -> Option<LoopDetection> {
        let min_required = self.config.min_pattern_length * 2;
        if self.recent_calls.len() < min_required {
            return None;
        }
        for pattern_len in self.config.min_pattern_length..=self.config.max_pattern_length {
            if let Some(detection) = self.check_pattern_of_length(call, pattern_len) {
                return Some(detection);
            }
        }
        None
    }

    fn check_pattern_of_length(&self, call: &Invocation, pattern_len: usize) -> Option<LoopDetection> {
        if self.recent_calls.len() < pattern_len * 2 {
            return None;
        }
        let recent: Vec<_> = self.recent_calls.iter().rev().take(pattern_len).collect();
        let prev_pattern: Vec<_> = self.recent_calls.iter().rev().skip(pattern_len).take(pattern_len).collect();
        let matches = recent.iter().zip(prev_pattern.iter()).all(|(a, b)| a == b);
        if !matches {
            return None;
        }
        if call != recent[recent.len() - 1] {
            return None;
        }
        let names: Vec<String> = recent.iter().rev().map(|c| c.name.clone()).collect();
        Some(LoopDetection {
            loop_type: LoopType::Pattern { names, repetitions: 2 },
            action: LoopAction::Warn,
            detection_count: 0,
            warning_message: None,
        })
    }

    fn record_call(&mut self, call: Invocation) {
        let max_size = self.config.exact_window_size.max(self.config.pattern_window_size);
        if self.recent_calls.len() >= max_size {
            self.recent_calls.pop_front();
        }
        self.recent_calls.push_back(call);
    }

    pub fn tracked_count(&self) -> usize {
        self.recent_calls.len()
    }

    pub fn clear(&mut self) {
        self.recent_calls.clear();
        self.detection_count = 0;
    }

    pub fn detection_count(&self) -> usize {
        self.detection_count
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str) -> ContentBlock {
        ContentBlock::tool_use("id", name, serde_json::json!({"x": 1}))
    }

    #[test]
    fn exact_duplicates_trigger_after_the_configured_threshold() {
        let mut detector = LoopDetector::new();
        for _ in 0..2 {
            assert!(detector.check(&call("bash")).is_none());
        }
        let detection = detector.check(&call("bash")).unwrap();
        assert!(matches!(detection.loop_type, LoopType::ExactDuplicate { .. }));
    }

    #[test]
    fn alternating_pattern_is_detected() {
        let mut detector = LoopDetector::new();
        for name in ["a", "b", "a", "b"] {
            detector.check(&call(name));
        }
        let detection = detector.check(&call("a"));
        assert!(detection.is_some());
    }

    #[test]
    fn clear_resets_tracked_history_and_detection_count() {
        let mut detector = LoopDetector::new();
        for _ in 0..3 {
            detector.check(&call("bash"));
        }
        detector.clear();
        assert_eq!(detector.tracked_count(), 0);
        assert_eq!(detector.detection_count(), 0);
    }
}
