use async_trait::async_trait;
use remote_swe_common::Result;

/// Side effects the engine triggers outside itself: chat delivery and the
/// supervisor's idle timer.
#[async_trait]
pub trait OutboundHooks: Send + Sync {
    async fn send_final_answer(&self, conversation_id: &str, text: &str) -> Result<()>;

    async fn send_progress(&self, conversation_id: &str, text: &str) -> Result<()>;

    /// Called at loop entry and before every inference call.
    fn reset_idle_timer(&self, conversation_id: &str);
}
