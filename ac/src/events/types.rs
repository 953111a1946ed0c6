//! Event vocabulary of an execution run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type names emitted by the execution loop
pub mod event_type {
    /// Iteration boundary; payload `{iteration}`
    pub const LOOP_START: &str = "loop_start";
    /// Tool call about to run; payload `{id, name, args}`
    pub const TOOL: &str = "tool";
    /// Tool call finished; payload `{id, name, is_error, duration_ms}`
    pub const TOOL_RESULT: &str = "tool_result";
    /// Reasoning fragment or streamed delta; payload `{text}`
    pub const REASONING: &str = "reasoning";
    /// Non-terminal warning; payload `{source, message}`
    pub const ADVISORY: &str = "advisory";
    /// Run ended; payload `{status, tag, iterations}`
    pub const TERMINAL: &str = "terminal";
}

/// One observable event, as carried on the [`super::EventBus`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: String,
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(execution_id: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            execution_id: execution_id.into(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type == event_type::TERMINAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serializes_flat() {
        let event = ExecutionEvent::new("exec-1", event_type::TOOL, json!({"name": "shell"}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["execution_id"], "exec-1");
        assert_eq!(json["event_type"], "tool");
        assert_eq!(json["payload"]["name"], "shell");
        assert!(!event.is_terminal());
    }
}
