//! Tool trait for handler implementations.
//!
//! Concrete handlers live with the embedding application; the orchestrator
//! only needs the trait surface and the definition conversion.

use std::sync::Arc;

use async_trait::async_trait;

use crate::provider::ToolDefinition;

/// Result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Output lines returned to the model inside the `tool_result` block.
    pub lines: Vec<String>,
    /// Whether the tool execution failed.
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            lines: vec![message.into()],
            is_error: true,
        }
    }
}

/// Trait that all tool handlers implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name for this tool (e.g. "read_file").
    fn name(&self) -> &str;
    /// Human-readable description of what this tool does.
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute the tool with the given input. Runs concurrently with
    /// further conversation; the outcome is routed back through
    /// `ingest_tool_results`.
    async fn execute(&self, input: serde_json::Value) -> ToolOutput;
}

/// Convert a slice of tools to API-level tool definitions.
pub fn to_definitions(tools: &[Arc<dyn Tool>]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            input_schema: t.input_schema(),
            cache_control: None,
        })
        .collect()
}
