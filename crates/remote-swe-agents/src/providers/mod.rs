pub mod converse;

use async_trait::async_trait;
use remote_swe_common::{ChatMessage, ContentBlock, Result, TokenUsage};
use serde::{Deserialize, Serialize};

use crate::models::ToolChoiceKind;

pub use converse::ConverseBackend;

/// Definition of a tool offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    Any,
    Tool { name: String },
}

impl ToolChoice {
    pub fn kind(&self) -> ToolChoiceKind {
        match self {
            ToolChoice::Auto => ToolChoiceKind::Auto,
            ToolChoice::Any => ToolChoiceKind::Any,
            ToolChoice::Tool { .. } => ToolChoiceKind::Tool,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolConfig {
    pub tools: Vec<ToolDefinition>,
    /// Cache marker after the last tool definition.
    pub cache_point: bool,
    pub tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReasoningConfig {
    pub budget_tokens: u32,
}

/// Model-agnostic request sent to an [`InferenceBackend`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceRequest {
    pub messages: Vec<ChatMessage>,
    pub system: Vec<ContentBlock>,
    pub tool_config: Option<ToolConfig>,
    pub max_tokens: Option<u32>,
    pub reasoning: Option<ReasoningConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    ToolUse,
    EndTurn,
    MaxTokens,
    Other(String),
}

impl StopReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "tool_use" => StopReason::ToolUse,
            "end_turn" | "stop_sequence" => StopReason::EndTurn,
            "max_tokens" => StopReason::MaxTokens,
            other => StopReason::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResponse {
    pub stop_reason: StopReason,
    pub message: Option<ChatMessage>,
    pub usage: Option<TokenUsage>,
}

/// Resolved destination for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTarget {
    pub model_id: String,
    pub region: String,
    /// Bearer token; `None` lets the backend fall back to its own auth.
    pub api_key: Option<String>,
    pub profile: Option<String>,
}

/// An LLM backend that can run one conversational turn.
///
/// Implementations classify throttling as `Error::Throttled`; every other
/// failure is treated as fatal by the caller.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn backend_id(&self) -> &str;

    async fn converse(
        &self,
        target: &ModelTarget,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse>;
}
