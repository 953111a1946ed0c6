//! Tool and registry traits

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::llm::ToolDefinition;

/// A single tool implementation
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (matches the model's tool call name)
    fn name(&self) -> &'static str;

    /// Human-readable description
    fn description(&self) -> &'static str;

    /// JSON Schema for input parameters
    fn input_schema(&self) -> Value;

    /// Execute the tool
    async fn execute(&self, args: Value) -> ToolResult;
}

/// Result of a tool execution
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful result
    pub fn success(content: impl Into<String>) -> Self {
        debug!("ToolResult::success: called");
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// Create an error result
    pub fn error(content: impl Into<String>) -> Self {
        debug!("ToolResult::error: called");
        Self {
            content: content.into(),
            is_error: true,
        }
    }

    /// Text form handed back to the model; errors carry an `Error:` prefix
    pub fn into_text(self) -> String {
        if self.is_error && !self.content.trim_start().to_lowercase().starts_with("error") {
            format!("Error: {}", self.content)
        } else {
            self.content
        }
    }
}

/// Registry the loop invokes tools through
///
/// `execute` never fails: every failure is encoded in the returned text. The
/// caller enforces timeouts.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Definitions offered to the model
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Run a tool by name
    async fn execute(&self, name: &str, args: Value) -> String;
}
