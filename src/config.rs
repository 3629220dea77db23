//! Configuration loading and validation.

use crate::error::Result;
use anyhow::Context as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level scribebot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance root directory (~/.scribebot or SCRIBEBOT_DIR).
    pub instance_dir: PathBuf,
    /// Slack credentials.
    pub slack: SlackConfig,
    /// Model backend credentials and tuning.
    pub openai: OpenAiConfig,
    /// Google Docs/Drive settings.
    pub docs: DocsConfig,
    /// Idle delay between scheduler sweeps, in milliseconds.
    pub sweep_interval_ms: u64,
}

/// Slack socket-mode credentials.
#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub bot_token: String,
    pub app_token: String,
}

/// OpenAI chat-completions settings.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
}

/// Document backend settings.
#[derive(Debug, Clone)]
pub struct DocsConfig {
    /// Drive file id of the incident report template.
    pub template_file_id: String,
    /// Drive folder id that new reports are created in.
    pub incident_folder_id: String,
    /// Cached authorized-user OAuth credential (token.json).
    pub token_path: PathBuf,
}

fn default_model() -> String {
    "gpt-4-1106-preview".into()
}

fn default_temperature() -> f64 {
    1.0
}

fn default_sweep_interval_ms() -> u64 {
    100
}

#[derive(Deserialize)]
struct TomlConfig {
    slack: TomlSlackConfig,
    openai: TomlOpenAiConfig,
    docs: TomlDocsConfig,
    #[serde(default = "default_sweep_interval_ms")]
    sweep_interval_ms: u64,
}

#[derive(Deserialize)]
struct TomlSlackConfig {
    bot_token: String,
    app_token: String,
}

#[derive(Deserialize)]
struct TomlOpenAiConfig {
    api_key: String,
    #[serde(default = "default_model")]
    model: String,
    #[serde(default = "default_temperature")]
    temperature: f64,
}

#[derive(Deserialize)]
struct TomlDocsConfig {
    template_file_id: String,
    incident_folder_id: String,
    token_path: Option<PathBuf>,
}

/// Resolve a value that might be an "env:VAR_NAME" reference.
fn resolve_env_value(value: &str, what: &str) -> Result<String> {
    if let Some(var_name) = value.strip_prefix("env:") {
        Ok(std::env::var(var_name)
            .with_context(|| format!("{what} references unset env var {var_name}"))?)
    } else {
        Ok(value.to_string())
    }
}

fn require_env(var: &str) -> Result<String> {
    Ok(std::env::var(var).with_context(|| format!("{var} is not set"))?)
}

impl Config {
    /// Resolve the instance directory from env or default (~/.scribebot).
    pub fn default_instance_dir() -> PathBuf {
        std::env::var("SCRIBEBOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|d| d.join(".scribebot"))
                    .unwrap_or_else(|| PathBuf::from("./.scribebot"))
            })
    }

    /// Load configuration from the default config file, falling back to env vars.
    pub fn load() -> Result<Self> {
        let instance_dir = Self::default_instance_dir();

        let config_path = instance_dir.join("config.toml");
        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::load_from_env(&instance_dir)
        }
    }

    /// Load from a specific TOML config file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let instance_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        Self::from_toml(toml_config, instance_dir)
    }

    /// Load from environment variables only (no config file).
    pub fn load_from_env(instance_dir: &Path) -> Result<Self> {
        Ok(Self {
            instance_dir: instance_dir.to_path_buf(),
            slack: SlackConfig {
                bot_token: require_env("SLACK_BOT_TOKEN")?,
                app_token: require_env("SLACK_APP_TOKEN")?,
            },
            openai: OpenAiConfig {
                api_key: require_env("OPENAI_API_KEY")?,
                model: std::env::var("SCRIBEBOT_MODEL").unwrap_or_else(|_| default_model()),
                temperature: default_temperature(),
            },
            docs: DocsConfig {
                template_file_id: require_env("SCRIBEBOT_TEMPLATE_FILE_ID")?,
                incident_folder_id: require_env("SCRIBEBOT_INCIDENT_FOLDER_ID")?,
                token_path: instance_dir.join("token.json"),
            },
            sweep_interval_ms: default_sweep_interval_ms(),
        })
    }

    fn from_toml(toml: TomlConfig, instance_dir: PathBuf) -> Result<Self> {
        let token_path = toml
            .docs
            .token_path
            .unwrap_or_else(|| instance_dir.join("token.json"));

        Ok(Self {
            slack: SlackConfig {
                bot_token: resolve_env_value(&toml.slack.bot_token, "slack.bot_token")?,
                app_token: resolve_env_value(&toml.slack.app_token, "slack.app_token")?,
            },
            openai: OpenAiConfig {
                api_key: resolve_env_value(&toml.openai.api_key, "openai.api_key")?,
                model: toml.openai.model,
                temperature: toml.openai.temperature,
            },
            docs: DocsConfig {
                template_file_id: toml.docs.template_file_id,
                incident_folder_id: toml.docs.incident_folder_id,
                token_path,
            },
            sweep_interval_ms: toml.sweep_interval_ms,
            instance_dir,
        })
    }
}
