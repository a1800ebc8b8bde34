//! Normalized LLM-CLI event kinds (`spec.md` §4.5).

use serde_json::Value;

/// One line of the LLM-CLI's stdout, normalized to a known kind. Unknown
/// JSON shapes (no recognizable `type`) and non-JSON lines both collapse
/// to `Text`, matching "forwarded verbatim as text events and appended to
/// the accumulated markdown".
#[derive(Debug, Clone)]
pub enum NormalizedEvent {
    Thinking(Value),
    Text(Value),
    Result(Value),
    ToolUse(Value),
    ToolUseStart(Value),
    ToolInputDelta(Value),
    ToolUseStop(Value),
    ToolResult(Value),
    /// A recognized JSON event whose `type` isn't one of the named kinds.
    Event(Value),
}

impl NormalizedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizedEvent::Thinking(_) => "thinking",
            NormalizedEvent::Text(_) => "text",
            NormalizedEvent::Result(_) => "result",
            NormalizedEvent::ToolUse(_) => "tool_use",
            NormalizedEvent::ToolUseStart(_) => "tool_use_start",
            NormalizedEvent::ToolInputDelta(_) => "tool_input_delta",
            NormalizedEvent::ToolUseStop(_) => "tool_use_stop",
            NormalizedEvent::ToolResult(_) => "tool_result",
            NormalizedEvent::Event(_) => "event",
        }
    }

    /// Text to fold into the accumulated markdown transcript, if any.
    pub fn markdown_fragment(&self) -> Option<String> {
        match self {
            NormalizedEvent::Text(value) => Some(
                value
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    }),
            ),
            _ => None,
        }
    }
}

/// Parse one raw stdout line into a `NormalizedEvent`.
pub fn parse_line(line: &str) -> NormalizedEvent {
    match serde_json::from_str::<Value>(line) {
        Ok(value) => match value.get("type").and_then(Value::as_str) {
            Some("thinking") => NormalizedEvent::Thinking(value),
            Some("text") => NormalizedEvent::Text(value),
            Some("result") => NormalizedEvent::Result(value),
            Some("tool_use") => NormalizedEvent::ToolUse(value),
            Some("tool_use_start") => NormalizedEvent::ToolUseStart(value),
            Some("tool_input_delta") => NormalizedEvent::ToolInputDelta(value),
            Some("tool_use_stop") => NormalizedEvent::ToolUseStop(value),
            Some("tool_result") => NormalizedEvent::ToolResult(value),
            Some(_unrecognized) => NormalizedEvent::Event(value),
            None => NormalizedEvent::Text(Value::String(line.to_string())),
        },
        Err(_) => NormalizedEvent::Text(Value::String(line.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_known_kinds() {
        let event = parse_line(r#"{"type":"tool_use","name":"bash"}"#);
        assert_eq!(event.kind(), "tool_use");
    }

    #[test]
    fn unrecognized_type_is_event() {
        let event = parse_line(r#"{"type":"system_init","cwd":"/tmp"}"#);
        assert_eq!(event.kind(), "event");
    }

    #[test]
    fn non_json_line_is_text() {
        let event = parse_line("plain stdout line");
        assert_eq!(event.kind(), "text");
        assert_eq!(event.markdown_fragment().as_deref(), Some("plain stdout line"));
    }

    #[test]
    fn malformed_json_without_type_is_text() {
        let event = parse_line(r#"{"foo":"bar"}"#);
        assert_eq!(event.kind(), "text");
    }
}
