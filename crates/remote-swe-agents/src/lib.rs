pub mod context;
pub mod conversation;
pub mod hooks;
pub mod inference;
pub mod knowledge;
#[cfg(feature = "mcp")]
pub mod mcp;
pub mod models;
pub mod prompt;
pub mod providers;
pub mod session;
pub mod tools;

pub use conversation::{ConversationEngine, EngineParts, EngineSettings};
pub use hooks::OutboundHooks;
pub use inference::{CredentialProfile, InferenceClient, RetryPolicy};
pub use models::ModelKind;
pub use providers::{
    ConverseBackend, InferenceBackend, InferenceRequest, InferenceResponse, ModelTarget,
    StopReason, ToolDefinition,
};
pub use session::{Session, SessionController, SessionGuard, SessionState};
pub use tools::{ExternalToolProvider, Tool, ToolContext, ToolDispatcher, ToolOutput};
