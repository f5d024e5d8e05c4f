use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a remote-swe worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root for the database and blob directory when their paths are not set.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

impl AppConfig {
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.store
            .database_path
            .clone()
            .unwrap_or_else(|| self.resolved_data_dir().join("conversations.db"))
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.store
            .blob_dir
            .clone()
            .unwrap_or_else(|| self.resolved_data_dir().join("blobs"))
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".remote-swe"))
        .unwrap_or_else(|| PathBuf::from(".remote-swe"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub blob_dir: Option<PathBuf>,

    /// Rows fetched per page when scanning a conversation.
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            blob_dir: None,
            history_page_size: default_history_page_size(),
        }
    }
}

fn default_history_page_size() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_region")]
    pub region: String,

    /// Candidate model kinds, e.g. `sonnet3.7`. One is picked per call.
    #[serde(default = "default_models")]
    pub models: Vec<String>,

    /// Pins every call to one model kind.
    #[serde(default)]
    pub model_override: Option<String>,

    /// Overrides the regional runtime endpoint (tests, proxies).
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Environment variable holding the default bearer token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Optional pool of credentials; one is chosen at random per call.
    #[serde(default)]
    pub credential_profiles: Vec<CredentialProfileConfig>,

    #[serde(default = "default_reasoning_budget")]
    pub reasoning_budget_tokens: u32,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            models: default_models(),
            model_override: None,
            endpoint_url: None,
            api_key_env: default_api_key_env(),
            credential_profiles: Vec::new(),
            reasoning_budget_tokens: default_reasoning_budget(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_region() -> String {
    "us-west-2".to_string()
}

fn default_models() -> Vec<String> {
    vec!["sonnet3.7".to_string()]
}

fn default_api_key_env() -> String {
    "AWS_BEARER_TOKEN_BEDROCK".to_string()
}

fn default_reasoning_budget() -> u32 {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialProfileConfig {
    pub name: String,

    /// Literal token. Prefer `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Per-profile region override.
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    100
}

fn default_min_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: i64,

    /// Share of the budget kept from the start of the conversation.
    #[serde(default = "default_head_ratio")]
    pub head_ratio: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_input_tokens: default_max_input_tokens(),
            head_ratio: default_head_ratio(),
        }
    }
}

fn default_max_input_tokens() -> i64 {
    80_000
}

fn default_head_ratio() -> f64 {
    0.6
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Seconds of silence after which tool results nudge the model to report progress.
    #[serde(default = "default_progress_interval")]
    pub progress_report_interval_secs: u64,

    /// Retries while waiting for the latest user message to become visible.
    #[serde(default = "default_settle_retries")]
    pub history_settle_retries: u32,

    /// Working tree whose agent instructions (`AGENTS.md`, `.cursorrules`, ...)
    /// extend the system prompt.
    #[serde(default)]
    pub repository_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            progress_report_interval_secs: default_progress_interval(),
            history_settle_retries: default_settle_retries(),
            repository_dir: None,
        }
    }
}

fn default_progress_interval() -> u64 {
    300
}

fn default_settle_retries() -> u32 {
    5
}

/// An MCP server spawned as a child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub enabled: Option<bool>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl McpServerConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(30)
    }
}
