//! Line-delimited JSON event stream from the agent subprocess
//!
//! Three event kinds: `result` carries the final outcome, `tool_use` is
//! progress (and feeds the task's actions_taken record), `text` is partial
//! output. Anything that doesn't parse as an event is kept as raw text so
//! a non-streaming agent still produces a usable result.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    Text {
        text: String,
    },
}

/// Parse one stdout line. `None` means the line was not an event.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Progress callback payloads surfaced to the worker while a task runs.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    ToolUse { name: String, input: Value },
    Text { text: String },
}

/// Accumulates stream state across a subprocess run.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    /// The final `result` event, if one arrived
    pub result: Option<(String, bool)>,
    /// Every tool_use event, in order
    pub actions: Vec<Value>,
    /// Raw non-event output, kept as a fallback result source
    pub raw_text: String,
}

impl StreamOutcome {
    pub fn absorb(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Result { result, is_error } => {
                self.result = Some((result.clone().unwrap_or_default(), *is_error));
            }
            StreamEvent::ToolUse { name, input } => {
                self.actions.push(serde_json::json!({ "tool": name, "input": input }));
            }
            StreamEvent::Text { text } => {
                self.raw_text.push_str(text);
            }
        }
    }

    pub fn absorb_raw(&mut self, line: &str) {
        if !self.raw_text.is_empty() {
            self.raw_text.push('\n');
        }
        self.raw_text.push_str(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_three_event_kinds() {
        assert_eq!(
            parse_line(r#"{"type": "result", "result": "done", "is_error": false}"#),
            Some(StreamEvent::Result { result: Some("done".into()), is_error: false })
        );
        assert!(matches!(
            parse_line(r#"{"type": "tool_use", "name": "web_search", "input": {"q": "x"}}"#),
            Some(StreamEvent::ToolUse { .. })
        ));
        assert_eq!(
            parse_line(r#"{"type": "text", "text": "thinking..."}"#),
            Some(StreamEvent::Text { text: "thinking...".into() })
        );
    }

    #[test]
    fn non_events_fall_through() {
        assert_eq!(parse_line("plain output"), None);
        assert_eq!(parse_line(r#"{"type": "unknown"}"#), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn outcome_accumulates_actions_and_last_result_wins() {
        let mut outcome = StreamOutcome::default();
        outcome.absorb(&parse_line(r#"{"type": "tool_use", "name": "a", "input": 1}"#).unwrap());
        outcome.absorb(&parse_line(r#"{"type": "result", "result": "first"}"#).unwrap());
        outcome.absorb(&parse_line(r#"{"type": "tool_use", "name": "b", "input": 2}"#).unwrap());
        outcome.absorb(&parse_line(r#"{"type": "result", "result": "second"}"#).unwrap());

        assert_eq!(outcome.actions.len(), 2);
        assert_eq!(outcome.result, Some(("second".into(), false)));
    }
}
