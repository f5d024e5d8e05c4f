use async_trait::async_trait;
use remote_swe_common::Result;
use serde_json::json;
use tracing::debug;

use super::{Tool, ToolContext, ToolOutput};

/// Scratchpad for the model. Logs the thought and changes nothing.
pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "Think about something without obtaining new information or changing the repository. \
         Use it for complex reasoning or brainstorming, for example to weigh several ways of \
         fixing a bug or to plan how to address failing tests."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "thought": { "type": "string", "description": "Your thoughts." }
            },
            "required": ["thought"]
        })
    }

    async fn invoke(&self, context: &ToolContext, input: serde_json::Value) -> Result<ToolOutput> {
        debug!(
            conversation_id = %context.conversation_id,
            "think: {}",
            input["thought"].as_str().unwrap_or_default()
        );
        Ok(ToolOutput::text("Nice thought."))
    }
}
