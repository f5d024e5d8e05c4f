use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::seq::IndexedRandom;
use remote_swe_common::{ContentBlock, Error, Result};
use remote_swe_config::{InferenceConfig, RetryConfig};
use remote_swe_db::TokenLedger;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{CacheSection, ModelCapabilities, ModelKind};
use crate::providers::{
    InferenceBackend, InferenceRequest, InferenceResponse, ModelTarget, ReasoningConfig,
};

const DEFAULT_REASONING_BUDGET: u32 = 1024;

/// Throttling retry schedule: bounded attempts with a random delay between
/// `min_backoff` and `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            min_backoff: Duration::from_millis(config.min_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.min_backoff_ms)),
        }
    }

    pub fn backoff(&self) -> Duration {
        if self.max_backoff <= self.min_backoff {
            return self.min_backoff;
        }
        let min = self.min_backoff.as_millis() as u64;
        let max = self.max_backoff.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

/// A credential from the configured pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialProfile {
    pub name: String,
    pub api_key: String,
    pub region: Option<String>,
}

/// Calls the inference backend with model selection, request shaping,
/// throttling retry and usage accounting.
pub struct InferenceClient {
    backend: Arc<dyn InferenceBackend>,
    ledger: Option<Arc<TokenLedger>>,
    region: String,
    model_override: Option<ModelKind>,
    default_api_key: Option<String>,
    profiles: Vec<CredentialProfile>,
    retry: RetryPolicy,
    reasoning_budget: u32,
}

impl InferenceClient {
    pub fn new(backend: Arc<dyn InferenceBackend>, region: impl Into<String>) -> Self {
        Self {
            backend,
            ledger: None,
            region: region.into(),
            model_override: None,
            default_api_key: None,
            profiles: Vec::new(),
            retry: RetryPolicy::default(),
            reasoning_budget: DEFAULT_REASONING_BUDGET,
        }
    }

    /// Build from config, resolving credential environment variables through `lookup`.
    pub fn from_config<F>(
        backend: Arc<dyn InferenceBackend>,
        config: &InferenceConfig,
        lookup: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let model_override = config
            .model_override
            .as_deref()
            .map(str::parse::<ModelKind>)
            .transpose()?;

        let mut profiles = Vec::with_capacity(config.credential_profiles.len());
        for profile in &config.credential_profiles {
            let api_key = profile
                .api_key
                .clone()
                .or_else(|| profile.api_key_env.as_deref().and_then(&lookup))
                .ok_or_else(|| {
                    Error::Config(format!(
                        "credential profile '{}' has no api key",
                        profile.name
                    ))
                })?;
            profiles.push(CredentialProfile {
                name: profile.name.clone(),
                api_key,
                region: profile.region.clone(),
            });
        }

        let mut client = Self::new(backend, config.region.clone())
            .with_retry_policy(RetryPolicy::from_config(&config.retry))
            .with_profiles(profiles)
            .with_reasoning_budget(config.reasoning_budget_tokens);
        client.model_override = model_override;
        client.default_api_key = lookup(&config.api_key_env);
        Ok(client)
    }

    pub fn with_ledger(mut self, ledger: Arc<TokenLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_model_override(mut self, model: ModelKind) -> Self {
        self.model_override = Some(model);
        self
    }

    pub fn with_default_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.default_api_key = Some(api_key.into());
        self
    }

    pub fn with_profiles(mut self, profiles: Vec<CredentialProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reasoning_budget(mut self, budget_tokens: u32) -> Self {
        self.reasoning_budget = budget_tokens;
        self
    }

    /// Pick the model for one call: the override if set, else uniformly at random.
    pub fn select_model(&self, candidates: &[ModelKind]) -> Result<ModelKind> {
        if let Some(model) = self.model_override {
            return Ok(model);
        }
        candidates
            .choose(&mut rand::rng())
            .copied()
            .ok_or_else(|| Error::Inference("no candidate models".into()))
    }

    fn resolve_target(&self, model: ModelKind) -> ModelTarget {
        match self.profiles.choose(&mut rand::rng()) {
            Some(profile) => {
                let region = profile.region.clone().unwrap_or_else(|| self.region.clone());
                ModelTarget {
                    model_id: model.model_id_for_region(&region),
                    region,
                    api_key: Some(profile.api_key.clone()),
                    profile: Some(profile.name.clone()),
                }
            }
            None => ModelTarget {
                model_id: model.model_id_for_region(&self.region),
                region: self.region.clone(),
                api_key: self.default_api_key.clone(),
                profile: None,
            },
        }
    }

    /// Run one turn. Throttling is retried per the [`RetryPolicy`]; any other
    /// error is returned at once. Returns `Error::Cancelled` if `cancel` fires
    /// before an attempt or during a backoff.
    pub async fn converse(
        &self,
        conversation_id: &str,
        candidates: &[ModelKind],
        request: InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<InferenceResponse> {
        let model = self.select_model(candidates)?;
        let target = self.resolve_target(model);
        let request = shape_request(request, model.capabilities(), self.reasoning_budget);
        info!(
            "calling {} via {} (profile: {})",
            target.model_id,
            self.backend.backend_id(),
            target.profile.as_deref().unwrap_or("default")
        );

        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt += 1;

            match self.backend.converse(&target, &request).await {
                Ok(response) => {
                    self.record_usage(conversation_id, &target.model_id, &response)
                        .await;
                    return Ok(response);
                }
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff();
                    warn!(
                        "{} throttled (attempt {attempt}/{}), retrying in {delay:?}: {err}",
                        target.model_id, self.retry.max_attempts
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn record_usage(&self, conversation_id: &str, model_id: &str, response: &InferenceResponse) {
        let Some(usage) = response.usage else {
            warn!("no usage data returned by {model_id}");
            return;
        };
        debug!(
            "usage for {model_id}: in={} out={} cache_read={} cache_write={}",
            usage.input_tokens, usage.output_tokens, usage.cache_read_tokens, usage.cache_write_tokens
        );
        let Some(ledger) = &self.ledger else {
            return;
        };
        if let Err(e) = ledger.record(conversation_id, model_id, &usage).await {
            warn!("failed to update token ledger for {conversation_id}: {e}");
        }
    }
}

/// Fit `request` to what the chosen model accepts.
pub fn shape_request(
    mut request: InferenceRequest,
    caps: &ModelCapabilities,
    reasoning_budget: u32,
) -> InferenceRequest {
    if let Some(config) = request.tool_config.as_mut() {
        let unsupported = config
            .tool_choice
            .as_ref()
            .is_some_and(|choice| !caps.supports_tool_choice(choice.kind()));
        if unsupported {
            debug!("dropping unsupported tool choice");
            config.tool_choice = None;
        }
    }

    if reasoning_allowed(&request, caps) {
        request.reasoning = Some(ReasoningConfig {
            budget_tokens: reasoning_budget,
        });
    } else {
        request.reasoning = None;
        for message in &mut request.messages {
            message.content.retain(|block| !block.is_reasoning());
        }
    }

    if request.max_tokens.is_none() {
        request.max_tokens = Some(caps.max_output_tokens);
    }

    if !caps.supports_cache(CacheSection::System) {
        request.system.retain(|block| !block.is_cache_point());
    }
    if !caps.supports_cache(CacheSection::Tool) {
        if let Some(config) = request.tool_config.as_mut() {
            config.cache_point = false;
        }
    }
    if !caps.supports_cache(CacheSection::Message) {
        for message in &mut request.messages {
            message.content.retain(|block| !block.is_cache_point());
        }
    }

    request
}

/// Reasoning needs model support and no forced tool choice. It is also off when
/// the previous assistant turn called a tool without opening with a reasoning
/// block, since the model rejects reasoning that resumes mid tool call.
fn reasoning_allowed(request: &InferenceRequest, caps: &ModelCapabilities) -> bool {
    if !caps.reasoning {
        return false;
    }
    let has_tool_choice = request
        .tool_config
        .as_ref()
        .is_some_and(|c| c.tool_choice.is_some());
    if has_tool_choice {
        return false;
    }
    let len = request.messages.len();
    if len >= 2 {
        let prior = &request.messages[len - 2].content;
        let opens_with_reasoning = prior.first().is_some_and(ContentBlock::is_reasoning);
        let ends_with_tool_use = prior.last().is_some_and(ContentBlock::is_tool_use);
        if !opens_with_reasoning && ends_with_tool_use {
            return false;
        }
    }
    true
}
