//! ToolSet - a registry backed by [`Tool`] trait objects

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::llm::ToolDefinition;

use super::{Tool, ToolRegistry};

/// Name-indexed set of tools
#[derive(Default, Clone)]
pub struct ToolSet {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any tool with the same name
    pub fn add_tool(&mut self, tool: Arc<dyn Tool>) {
        debug!(name = tool.name(), "ToolSet::add_tool: called");
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Builder form of [`ToolSet::add_tool`]
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.add_tool(tool);
        self
    }

    /// Check if a tool exists
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names, sorted
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ToolRegistry for ToolSet {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    async fn execute(&self, name: &str, args: Value) -> String {
        debug!(%name, "ToolSet::execute: called");
        match self.tools.get(name) {
            Some(tool) => tool.execute(args).await.into_text(),
            None => {
                debug!(%name, "ToolSet::execute: unknown tool");
                format!("Error: Unknown tool: {}", name)
            }
        }
    }
}
