//! Conversation and model request/response types
//!
//! A [`Turn`] is the unit of transcript: once appended it is never edited.
//! Tool calls are carried in one canonical shape ([`ToolCall`]); provider wire
//! formats are converted at the ingress boundary in [`super::wire`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::wire::RawToolCall;

/// Turn role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,

    /// Calls requested by an assistant turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Call answered by a tool turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Turn {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// System instruction or injected note
    pub fn system(content: impl Into<String>) -> Self {
        debug!("Turn::system: called");
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        debug!("Turn::user: called");
        Self::plain(Role::User, content)
    }

    /// Assistant turn, optionally requesting tool calls
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        debug!(call_count = tool_calls.len(), "Turn::assistant: called");
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    /// Tool result answering `tool_call_id`
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        debug!("Turn::tool: called");
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// Canonical tool call: `{id, name, args_json}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,

    /// Arguments as canonical JSON text (object keys sorted)
    pub args_json: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: &Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args_json: args.to_string(),
        }
    }

    /// Parsed arguments; malformed JSON yields an empty object
    pub fn args(&self) -> Value {
        match serde_json::from_str::<Value>(&self.args_json) {
            Ok(value) => value,
            Err(e) => {
                debug!(tool = %self.name, error = %e, "ToolCall::args: malformed arguments");
                Value::Object(Default::default())
            }
        }
    }

    /// `name:args` fragment used for batch signatures
    pub fn signature_fragment(&self) -> String {
        format!("{}:{}", self.name, self.args_json)
    }
}

/// Tool definition offered to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Token usage reported for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_hit_tokens: u64,
}

/// Everything needed for one model call
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Turn>,
    pub tools: Vec<ToolDefinition>,
}

/// Aggregated response of one model call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Text content (if any)
    #[serde(default)]
    pub content: Option<String>,

    /// Tool calls as they arrived on the wire
    #[serde(default)]
    pub tool_calls: Vec<RawToolCall>,

    /// Reasoning fragment, for models that expose one
    #[serde(default)]
    pub reasoning: Option<String>,

    #[serde(default)]
    pub usage: TokenUsage,
}

impl ChatResponse {
    /// Plain text response
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// Response carrying tool calls
    pub fn with_calls(tool_calls: Vec<RawToolCall>) -> Self {
        Self {
            tool_calls,
            ..Default::default()
        }
    }

    /// Content with surrounding whitespace removed, `None` when blank
    pub fn trimmed_content(&self) -> Option<&str> {
        self.content.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }

    /// No content, no tool calls and no reasoning
    pub fn is_empty(&self) -> bool {
        self.trimmed_content().is_none()
            && self.tool_calls.is_empty()
            && self.reasoning.as_deref().is_none_or(|r| r.trim().is_empty())
    }
}

/// Incremental output from a streaming call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    ContentDelta(String),
    ReasoningDelta(String),
    Done,
}
