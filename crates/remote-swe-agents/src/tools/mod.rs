pub mod dispatcher;
pub mod report_progress;
pub mod think;

use std::sync::Arc;

use async_trait::async_trait;
use remote_swe_common::{ContentBlock, Result};

use crate::hooks::OutboundHooks;
use crate::providers::ToolDefinition;

pub use dispatcher::ToolDispatcher;
pub use report_progress::ReportProgressTool;
pub use think::ThinkTool;

/// Context available to a tool while it runs.
#[derive(Clone)]
pub struct ToolContext {
    pub conversation_id: String,
    pub hooks: Arc<dyn OutboundHooks>,
}

/// What a tool returns: plain text, or content blocks (which may carry images).
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        ToolOutput::Text(text.into())
    }
}

/// A tool the agent can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the input object. Inputs are validated against it
    /// before `invoke` is called.
    fn input_schema(&self) -> serde_json::Value;

    async fn invoke(&self, context: &ToolContext, input: serde_json::Value) -> Result<ToolOutput>;

    fn describe(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// A dynamic source of tools reached over a protocol (e.g. MCP servers).
#[async_trait]
pub trait ExternalToolProvider: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;

    async fn call_tool(&self, name: &str, input: serde_json::Value) -> Result<Vec<ContentBlock>>;

    async fn shutdown(&self) {}
}
