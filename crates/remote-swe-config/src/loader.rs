use std::path::{Path, PathBuf};

use remote_swe_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

pub const ENV_MODEL_OVERRIDE: &str = "REMOTE_SWE_MODEL_OVERRIDE";
pub const ENV_REGION: &str = "REMOTE_SWE_REGION";
pub const ENV_DATA_DIR: &str = "REMOTE_SWE_DATA_DIR";

/// Reads an [`AppConfig`] from YAML or TOML and layers environment overrides on top.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<AppConfig> {
        let mut config = if path.exists() {
            info!("loading config from {}", path.display());
            let raw = std::fs::read_to_string(path)?;
            Self::parse(path, &raw)?
        } else {
            debug!("no config at {}, using defaults", path.display());
            AppConfig::default()
        };

        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn parse(path: &Path, raw: &str) -> Result<AppConfig> {
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        );
        if is_yaml {
            serde_yaml::from_str(raw)
                .map_err(|e| Error::Config(format!("invalid YAML in {}: {e}", path.display())))
        } else {
            toml::from_str(raw)
                .map_err(|e| Error::Config(format!("invalid TOML in {}: {e}", path.display())))
        }
    }

    /// Apply overrides, reading variables through `lookup`.
    pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup(ENV_MODEL_OVERRIDE).filter(|v| !v.trim().is_empty()) {
            info!("model pinned by {ENV_MODEL_OVERRIDE}: {model}");
            config.inference.model_override = Some(model.trim().to_string());
        }
        if let Some(region) = lookup(ENV_REGION).filter(|v| !v.trim().is_empty()) {
            config.inference.region = region.trim().to_string();
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.trim().is_empty()) {
            config.data_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn validate(config: &AppConfig) -> Result<()> {
        if config.inference.models.is_empty() && config.inference.model_override.is_none() {
            return Err(Error::Config(
                "inference.models must name at least one model".into(),
            ));
        }
        if config.context.max_input_tokens <= 0 {
            return Err(Error::Config(
                "context.max_input_tokens must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&config.context.head_ratio) {
            return Err(Error::Config(
                "context.head_ratio must be between 0 and 1".into(),
            ));
        }
        let retry = &config.inference.retry;
        if retry.max_attempts == 0 {
            return Err(Error::Config(
                "inference.retry.max_attempts must be at least 1".into(),
            ));
        }
        if retry.min_backoff_ms > retry.max_backoff_ms {
            return Err(Error::Config(
                "inference.retry.min_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }
        for (name, server) in &config.mcp_servers {
            if server.command.trim().is_empty() {
                return Err(Error::Config(format!(
                    "mcp server '{name}' has an empty command"
                )));
            }
        }
        Ok(())
    }
}
