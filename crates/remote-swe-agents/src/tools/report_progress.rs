use async_trait::async_trait;
use remote_swe_common::{Error, Result};
use serde_json::json;

use super::{Tool, ToolContext, ToolOutput};

pub const REPORT_PROGRESS_TOOL_NAME: &str = "reportProgressToUser";

/// Sends an interim message to the user through the progress hook.
pub struct ReportProgressTool;

#[async_trait]
impl Tool for ReportProgressTool {
    fn name(&self) -> &str {
        REPORT_PROGRESS_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Send a message to the user while you keep working. Messages are otherwise only \
         delivered when you end your turn, so use this to tell the user how you are solving \
         the problem. If a tool result asks you to report progress, do so with this tool."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message you want to send to the user."
                }
            },
            "required": ["message"]
        })
    }

    async fn invoke(&self, context: &ToolContext, input: serde_json::Value) -> Result<ToolOutput> {
        let message = input["message"]
            .as_str()
            .ok_or_else(|| Error::Tool("missing 'message' argument".to_string()))?;
        context
            .hooks
            .send_progress(&context.conversation_id, message)
            .await?;
        Ok(ToolOutput::text("successfully sent a message."))
    }
}
