use std::io::Write;

use async_trait::async_trait;
use remote_swe_agents::OutboundHooks;
use remote_swe_common::Result;
use tracing::trace;

/// Delivers agent output to the terminal.
pub struct ConsoleHooks;

impl ConsoleHooks {
    fn print(line: &str) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}")?;
        stdout.flush()?;
        Ok(())
    }
}

#[async_trait]
impl OutboundHooks for ConsoleHooks {
    async fn send_final_answer(&self, _conversation_id: &str, text: &str) -> Result<()> {
        Self::print(&format!("agent> {text}"))
    }

    async fn send_progress(&self, _conversation_id: &str, text: &str) -> Result<()> {
        Self::print(&format!("agent (progress)> {text}"))
    }

    fn reset_idle_timer(&self, conversation_id: &str) {
        trace!("activity on {conversation_id}");
    }
}
