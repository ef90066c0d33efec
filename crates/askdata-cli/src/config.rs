//! Configuration system for askdata
//!
//! Loads configuration from:
//! 1. askdata.yaml (or `--config <path>`) - operational settings
//! 2. .env file - secrets (API keys)
//!
//! Environment variables always override YAML values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Looked up in the working directory when no `--config` is given
pub const DEFAULT_CONFIG_FILE: &str = "askdata.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
}

/// Translator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,

    /// Upper bound for a single API call
    pub timeout_secs: u64,

    /// Extra attempts when the model's answer cannot be parsed
    pub max_retries: usize,

    pub max_tokens: u32,

    /// Alternative API base URL (also `OPENAI_BASE_URL`)
    pub base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 30,
            max_retries: 1,
            max_tokens: 300,
            base_url: None,
        }
    }
}

/// Schema inference settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Non-null values sampled per column for type inference
    pub sample_size: usize,

    /// Sample values per column included in the prompt
    pub prompt_samples: usize,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            sample_size: 100,
            prompt_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub extra_blocked_keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub memory_limit_mb: Option<u64>,
    pub threads: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Rows printed per result; the rest are summarized
    pub max_rows: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self { max_rows: 50 }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or module-specific
    pub level: String,

    /// Output format: pretty, json, compact
    pub format: String,

    /// Output destination: stderr, file, both
    pub output: String,

    /// Directory for log files
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "pretty".to_string(),
            output: "stderr".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub schema: SchemaConfig,
    pub gate: GateConfig,
    pub engine: EngineConfig,
    pub display: DisplayConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = serde_yaml::from_str(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// An explicit path must exist; otherwise use `askdata.yaml` when present,
    /// or defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_FILE);
        if fallback.is_file() {
            return Self::load(fallback);
        }

        let mut config = Config::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = var("ASKDATA_MODEL") {
            self.llm.model = model;
        }
        if let Some(secs) = var("ASKDATA_LLM_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.llm.timeout_secs = secs;
        }
        if let Some(url) = var("OPENAI_BASE_URL") {
            self.llm.base_url = Some(url);
        }
        if let Some(rows) = var("ASKDATA_MAX_ROWS").and_then(|v| v.parse().ok()) {
            self.display.max_rows = rows;
        }

        if let Some(level) = var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Some(format) = var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(output) = var("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Some(dir) = var("LOG_DIR") {
            self.logging.directory = dir;
        }
    }

    /// Get OpenAI API key from environment (usually via .env)
    pub fn openai_api_key() -> Result<String, ConfigError> {
        api_key_from(|key| std::env::var(key).ok())
    }
}

fn api_key_from<F>(var: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    var("OPENAI_API_KEY")
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()))
}
