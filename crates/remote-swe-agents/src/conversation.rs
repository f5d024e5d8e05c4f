use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use remote_swe_common::{
    ChatMessage, ChatRole, ContentBlock, Error, MessageRecord, MessageType, Result, TokenUsage,
};
use remote_swe_config::AppConfig;
use remote_swe_db::{ContentCodec, MessageStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::context::{CachePointTracker, DEFAULT_HEAD_RATIO, middle_out_filter, total_tokens};
use crate::hooks::OutboundHooks;
use crate::inference::InferenceClient;
use crate::knowledge::{find_repository_knowledge, system_prompt_with_knowledge};
use crate::models::ModelKind;
use crate::prompt::{DEFAULT_SYSTEM_PROMPT, strip_thinking};
use crate::providers::{InferenceRequest, StopReason, ToolConfig};
use crate::session::{SessionController, SessionGuard};
use crate::tools::report_progress::REPORT_PROGRESS_TOOL_NAME;
use crate::tools::{ToolContext, ToolDispatcher};

/// Tunables for the conversation loop.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub models: Vec<ModelKind>,
    pub system_prompt: String,
    pub max_input_tokens: i64,
    pub head_ratio: f64,
    pub progress_report_interval: Duration,
    pub history_settle_retries: u32,
    pub settle_min_backoff: Duration,
    pub settle_max_backoff: Duration,
    /// Repository checked for agent instructions at loop start and after
    /// every tool turn.
    pub repository_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            models: vec![ModelKind::Sonnet37],
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_input_tokens: 80_000,
            head_ratio: DEFAULT_HEAD_RATIO,
            progress_report_interval: Duration::from_secs(300),
            history_settle_retries: 5,
            settle_min_backoff: Duration::from_millis(100),
            settle_max_backoff: Duration::from_millis(1000),
            repository_dir: None,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let models = config
            .inference
            .models
            .iter()
            .map(|m| m.parse::<ModelKind>())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            models,
            system_prompt: config
                .agent
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_input_tokens: config.context.max_input_tokens,
            head_ratio: config.context.head_ratio,
            progress_report_interval: Duration::from_secs(
                config.agent.progress_report_interval_secs,
            ),
            history_settle_retries: config.agent.history_settle_retries,
            repository_dir: config.agent.repository_dir.clone(),
            ..Self::default()
        })
    }
}

/// Everything the engine needs, constructed once per process.
pub struct EngineParts {
    pub store: Arc<dyn MessageStore>,
    pub codec: Arc<ContentCodec>,
    pub inference: InferenceClient,
    pub tools: ToolDispatcher,
    pub hooks: Arc<dyn OutboundHooks>,
    pub sessions: SessionController,
    pub settings: EngineSettings,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Message,
    Resume,
}

/// Runs the agent loop for conversations: history in, tool calls and a final
/// answer out.
pub struct ConversationEngine {
    store: Arc<dyn MessageStore>,
    codec: Arc<ContentCodec>,
    inference: InferenceClient,
    tools: ToolDispatcher,
    hooks: Arc<dyn OutboundHooks>,
    sessions: SessionController,
    settings: EngineSettings,
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

impl ConversationEngine {
    pub fn new(parts: EngineParts) -> Self {
        Self {
            store: parts.store,
            codec: parts.codec,
            inference: parts.inference,
            tools: parts.tools,
            hooks: parts.hooks,
            sessions: parts.sessions,
            settings: parts.settings,
        }
    }

    pub fn sessions(&self) -> &SessionController {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Persist an inbound user message and start a loop for it.
    pub async fn receive_user_message(
        self: &Arc<Self>,
        conversation_id: &str,
        text: &str,
        author_user_id: Option<&str>,
    ) -> Result<JoinHandle<()>> {
        let message = ChatMessage::user(vec![ContentBlock::text(text)]);
        self.store
            .append(
                conversation_id,
                &message,
                0,
                MessageType::UserMessage,
                author_user_id,
            )
            .await?;
        Ok(self.dispatch(conversation_id).await)
    }

    /// Start a new session for `conversation_id` (superseding any running one)
    /// and run [`Self::on_message_received`] on a spawned task.
    pub async fn dispatch(self: &Arc<Self>, conversation_id: &str) -> JoinHandle<()> {
        self.spawn_session(conversation_id, Trigger::Message).await
    }

    /// Like [`Self::dispatch`] but runs [`Self::resume`].
    pub async fn dispatch_resume(self: &Arc<Self>, conversation_id: &str) -> JoinHandle<()> {
        self.spawn_session(conversation_id, Trigger::Resume).await
    }

    async fn spawn_session(
        self: &Arc<Self>,
        conversation_id: &str,
        trigger: Trigger,
    ) -> JoinHandle<()> {
        let session = self.sessions.start(conversation_id).await;
        let engine = Arc::clone(self);
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move {
            let guard = SessionGuard::new(session);
            let token = guard.session().token().clone();
            let outcome = match trigger {
                Trigger::Message => engine.on_message_received(&conversation_id, &token).await,
                Trigger::Resume => engine.resume(&conversation_id, &token).await,
            };
            if let Err(e) = outcome {
                error!("conversation {conversation_id} failed: {e}");
                let notice = format!("An error occurred: {e}");
                if let Err(send_err) = engine.hooks.send_final_answer(&conversation_id, &notice).await {
                    warn!("failed to report error to {conversation_id}: {send_err}");
                }
            }
        })
    }

    /// Continue a conversation whose last record is an unanswered user message.
    pub async fn resume(&self, conversation_id: &str, cancel: &CancellationToken) -> Result<()> {
        let history = self.store.get_history(conversation_id).await?;
        match history.last() {
            Some(last) if last.message_type == MessageType::UserMessage => {
                info!("resuming conversation {conversation_id}");
                self.on_message_received(conversation_id, cancel).await
            }
            _ => {
                debug!("nothing to resume for {conversation_id}");
                Ok(())
            }
        }
    }

    /// Run the agent loop until the model ends its turn. Cancellation is a
    /// quiet stop, not an error.
    #[instrument(skip(self, cancel))]
    pub async fn on_message_received(
        &self,
        conversation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self.run_loop(conversation_id, cancel).await {
            Err(e) if e.is_cancelled() => {
                info!("loop for {conversation_id} stopped: superseded by a newer event");
                Ok(())
            }
            other => other,
        }
    }

    async fn run_loop(&self, conversation_id: &str, cancel: &CancellationToken) -> Result<()> {
        checkpoint(cancel)?;
        self.hooks.reset_idle_timer(conversation_id);

        let history = self.load_history(conversation_id, cancel).await?;
        if history.is_empty() {
            info!("no history for {conversation_id}, nothing to do");
            return Ok(());
        }
        let mention = history.iter().rev().find_map(|r| r.author_user_id.clone());

        let tool_defs = self.tools.definitions().await;
        let tool_config = (!tool_defs.is_empty()).then(|| ToolConfig {
            tools: tool_defs,
            cache_point: true,
            tool_choice: None,
        });
        let mut system = self.system_blocks().await;

        let mut items =
            middle_out_filter(&history, self.settings.max_input_tokens, self.settings.head_ratio);
        let mut cache_points = CachePointTracker::new(items.len());
        let tool_context = ToolContext {
            conversation_id: conversation_id.to_string(),
            hooks: Arc::clone(&self.hooks),
        };
        let mut last_report = Instant::now();

        loop {
            checkpoint(cancel)?;
            let total = total_tokens(&items);
            let mut messages = self.build_messages(&items).await?;
            cache_points.apply(&mut messages);

            self.hooks.reset_idle_timer(conversation_id);
            debug!(
                "calling model with {} messages (~{total} tokens)",
                messages.len()
            );
            let request = InferenceRequest {
                messages,
                system: system.clone(),
                tool_config: tool_config.clone(),
                max_tokens: None,
                reasoning: None,
            };
            let response = self
                .inference
                .converse(conversation_id, &self.settings.models, request, cancel)
                .await?;
            // The call may have outlived its session.
            checkpoint(cancel)?;

            if let Some(usage) = response.usage {
                self.correct_prompt_tokens(conversation_id, &mut items, total, &usage, cancel)
                    .await?;
            }
            let output_tokens = response
                .usage
                .map(|u| i64::try_from(u.output_tokens).unwrap_or(i64::MAX))
                .unwrap_or(0);

            if response.stop_reason == StopReason::ToolUse {
                let message = response
                    .message
                    .ok_or_else(|| Error::Agent("model output is missing".into()))?;

                let force_report = last_report.elapsed() > self.settings.progress_report_interval;
                let (result, executions) = self
                    .tools
                    .execute_turn(&tool_context, &message, force_report, cancel)
                    .await?;
                if executions
                    .iter()
                    .any(|e| e.succeeded && e.name == REPORT_PROGRESS_TOOL_NAME)
                {
                    last_report = Instant::now();
                }

                checkpoint(cancel)?;
                let [tool_use, tool_result] = self
                    .store
                    .append_pair(conversation_id, &message, &result, output_tokens)
                    .await?;
                items.push(tool_use);
                items.push(tool_result);
                // Tools may have checked out the repository.
                system = self.system_blocks().await;
                continue;
            }

            let message = response
                .message
                .unwrap_or_else(|| ChatMessage::assistant(Vec::new()));
            if message.content.is_empty() {
                warn!("model ended its turn with an empty message");
                if let Some(user) = &mention {
                    self.hooks
                        .send_final_answer(conversation_id, &format!("<@{user}> "))
                        .await?;
                }
                return Ok(());
            }

            checkpoint(cancel)?;
            self.store
                .append(
                    conversation_id,
                    &message,
                    output_tokens,
                    MessageType::Assistant,
                    None,
                )
                .await?;

            let text = message
                .content
                .iter()
                .rev()
                .find_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .unwrap_or_default();
            let body = strip_thinking(text);
            let reply = match &mention {
                Some(user) => format!("<@{user}> {body}"),
                None => body,
            };
            self.hooks.send_final_answer(conversation_id, &reply).await?;
            info!("final answer sent for {conversation_id}");
            return Ok(());
        }
    }

    /// System prompt plus repository knowledge, followed by a cache marker.
    async fn system_blocks(&self) -> Vec<ContentBlock> {
        let knowledge = match &self.settings.repository_dir {
            Some(dir) => find_repository_knowledge(dir).await,
            None => None,
        };
        vec![
            ContentBlock::text(system_prompt_with_knowledge(
                &self.settings.system_prompt,
                knowledge.as_deref(),
            )),
            ContentBlock::CachePoint,
        ]
    }

    /// Read history, waiting briefly for the newest user message to become
    /// visible. Proceeds with whatever is there once retries run out.
    async fn load_history(
        &self,
        conversation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<MessageRecord>> {
        let mut attempt = 0u32;
        loop {
            let history = self.store.get_history(conversation_id).await?;
            let settled = history
                .last()
                .is_none_or(|r| r.message_type == MessageType::UserMessage);
            if settled || attempt >= self.settings.history_settle_retries {
                if !settled {
                    warn!("last record of {conversation_id} is not a user message, proceeding");
                }
                return Ok(history);
            }

            let delay = self
                .settings
                .settle_min_backoff
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(self.settings.settle_max_backoff);
            attempt += 1;
            debug!("history of {conversation_id} not settled, retry {attempt} in {delay:?}");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn build_messages(&self, items: &[MessageRecord]) -> Result<Vec<ChatMessage>> {
        let mut messages = Vec::with_capacity(items.len());
        for item in items {
            messages.push(ChatMessage {
                role: item.role,
                content: self.codec.rehydrate(&item.content).await?,
            });
        }
        Ok(messages)
    }

    /// Attribute the prompt tokens the model actually counted to the newest
    /// user-side record, so later budgets use real numbers.
    async fn correct_prompt_tokens(
        &self,
        conversation_id: &str,
        items: &mut [MessageRecord],
        total: i64,
        usage: &TokenUsage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(last) = items.last_mut() else {
            return Ok(());
        };
        if last.role != ChatRole::User {
            return Ok(());
        }
        let prompt = i64::try_from(usage.prompt_tokens()).unwrap_or(i64::MAX);
        let corrected = prompt - (total - last.token_count);
        if corrected == last.token_count {
            return Ok(());
        }
        if corrected < 0 {
            warn!(
                "token correction for {} is negative ({corrected}); stored estimates exceed the model's count",
                last.sequence_key
            );
        }

        checkpoint(cancel)?;
        self.store
            .update_token_count(conversation_id, &last.sequence_key, corrected)
            .await?;
        last.token_count = corrected;
        Ok(())
    }

    /// Cancel running loops, close external tool providers and drop cached blobs.
    pub async fn shutdown(&self) {
        info!("shutting down conversation engine");
        self.sessions.cancel_all().await;
        self.tools.shutdown().await;
        self.codec.clear_cache().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_config() {
        let mut config = AppConfig::default();
        config.inference.models = vec!["haiku3.5".into(), "nova-pro".into()];
        config.agent.progress_report_interval_secs = 60;
        let settings = EngineSettings::from_config(&config).expect("settings");
        assert_eq!(settings.models, vec![ModelKind::Haiku35, ModelKind::NovaPro]);
        assert_eq!(settings.progress_report_interval, Duration::from_secs(60));
        assert_eq!(settings.system_prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn unknown_model_in_config_is_rejected() {
        let mut config = AppConfig::default();
        config.inference.models = vec!["gpt-unknown".into()];
        assert!(EngineSettings::from_config(&config).is_err());
    }

    #[test]
    fn checkpoint_reports_cancellation() {
        let token = CancellationToken::new();
        assert!(checkpoint(&token).is_ok());
        token.cancel();
        assert!(checkpoint(&token).expect_err("cancelled").is_cancelled());
    }
}
