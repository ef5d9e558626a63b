//! Configuration loading, validation, and management for Tandem.
//!
//! Loads configuration from `~/.tandem/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tandem_core::InputLimits;

/// The root configuration structure.
///
/// Maps directly to `~/.tandem/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per reply
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Input length ceilings
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Prompt context assembly
    #[serde(default)]
    pub context: ContextConfig,
}

fn default_provider() -> String {
    "anthropic".into()
}
fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("providers", &self.providers)
            .field("gateway", &self.gateway)
            .field("database", &self.database)
            .field("limits", &self.limits)
            .field("context", &self.context)
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path. Defaults to `~/.tandem/tandem.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_task_chars")]
    pub max_task_chars: usize,

    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,

    #[serde(default = "default_max_memory_chars")]
    pub max_memory_chars: usize,
}

fn default_max_task_chars() -> usize {
    InputLimits::default().max_task_chars
}
fn default_max_message_chars() -> usize {
    InputLimits::default().max_message_chars
}
fn default_max_memory_chars() -> usize {
    InputLimits::default().max_memory_chars
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_task_chars: default_max_task_chars(),
            max_message_chars: default_max_message_chars(),
            max_memory_chars: default_max_memory_chars(),
        }
    }
}

impl From<&LimitsConfig> for InputLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_task_chars: limits.max_task_chars,
            max_message_chars: limits.max_message_chars,
            max_memory_chars: limits.max_memory_chars,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// How many relevance-ranked memories to surface per turn.
    #[serde(default = "default_relevance_top_k")]
    pub relevance_top_k: usize,

    /// Items per category bucket.
    #[serde(default = "default_bucket_size")]
    pub bucket_size: usize,

    /// Completed sessions summarized in the prompt.
    #[serde(default = "default_recent_sessions")]
    pub recent_sessions: usize,

    /// Estimated-token ceiling for the rendered system prompt.
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Most recent chat turns sent along with the prompt.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

fn default_relevance_top_k() -> usize {
    5
}
fn default_bucket_size() -> usize {
    5
}
fn default_recent_sessions() -> usize {
    10
}
fn default_token_budget() -> usize {
    3000
}
fn default_history_window() -> usize {
    40
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            relevance_top_k: default_relevance_top_k(),
            bucket_size: default_bucket_size(),
            recent_sessions: default_recent_sessions(),
            token_budget: default_token_budget(),
            history_window: default_history_window(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location with env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        // Environment variable overrides (highest priority)
        if config.api_key.is_none() {
            config.api_key = std::env::var("TANDEM_API_KEY")
                .ok()
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("TANDEM_PROVIDER") {
            config.default_provider = provider;
        }

        if let Ok(model) = std::env::var("TANDEM_MODEL") {
            config.default_model = model;
        }

        if let Ok(path) = std::env::var("TANDEM_DATABASE") {
            config.database.path = Some(path);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".tandem")
    }

    /// The SQLite database path, configured or default.
    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::config_dir().join("tandem.db"))
    }

    /// Input ceilings as the core type.
    pub fn input_limits(&self) -> InputLimits {
        InputLimits::from(&self.limits)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.limits.max_task_chars == 0
            || self.limits.max_message_chars == 0
            || self.limits.max_memory_chars == 0
        {
            return Err(ConfigError::ValidationError(
                "limits must all be greater than 0".into(),
            ));
        }

        if self.context.relevance_top_k == 0 || self.context.bucket_size == 0 {
            return Err(ConfigError::ValidationError(
                "context.relevance_top_k and context.bucket_size must be > 0".into(),
            ));
        }

        if self.context.token_budget < 256 {
            return Err(ConfigError::ValidationError(
                "context.token_budget must be at least 256".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
            || self
                .providers
                .get(&self.default_provider)
                .is_some_and(|p| p.api_key.is_some())
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            providers: HashMap::new(),
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            limits: LimitsConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
