//! TOML configuration, read from `~/.infrabot/config.toml`
//!
//! Sections:
//!
//! - **core**: Data directory and log level
//! - **llm**: Ollama endpoint, generation and embedding models, request deadline
//! - **pipeline**: Retry budget, backoff and context size
//! - **executor**: Playbook runner program, deadline and check mode
//! - **memory**: Optional retention policy applied by `infrabot prune`
//! - **security**: Maximum risk level allowed to reach the executor
//!
//! A leading `~` in any path is resolved against the home directory, and the
//! data directory is created on load.
//!
//! ```no_run
//! use infrabot_engine::config::Config;
//!
//! let config = Config::load_or_create().expect("config");
//! assert!(config.memory_db_path().ends_with("memory.db"));
//! ```

use crate::db::memory::RetentionPolicy;
use sdk::errors::EngineError;
use sdk::types::RiskLevel;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root of the configuration file
///
/// Every section has defaults, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Language-model gateway settings
    #[serde(default)]
    pub llm: LLMConfig,

    /// Orchestrator policy
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Artifact executor settings
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Memory store retention
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Security settings
    #[serde(default)]
    pub security: SecurityConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Where the memory database and run scratch files live
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Default tracing level; `RUST_LOG` and `--log` override it
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Ollama gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Base URL for the Ollama API
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    /// Generation model used when the request carries no hint
    #[serde(default = "default_model")]
    pub model: String,

    /// Model used for embeddings
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Per-call deadline in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

/// Orchestrator policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Retries for transient gateway failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay; doubles on each retry
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Similar records retrieved as context
    #[serde(default = "default_context_records")]
    pub context_records: usize,

    /// Ask the model for a narrative on top of the deterministic verdict
    #[serde(default)]
    pub review_narrative: bool,
}

/// Artifact executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Playbook runner binary
    #[serde(default = "default_executor_program")]
    pub program: String,

    /// Execution deadline in seconds
    #[serde(default = "default_executor_timeout")]
    pub timeout_secs: u64,

    /// Run with --check (dry run)
    #[serde(default)]
    pub check_mode: bool,

    /// Inventory used when a request names none (supports ~ expansion)
    #[serde(default)]
    pub default_inventory: Option<PathBuf>,
}

/// Memory retention configuration
///
/// Both limits are unset by default: history is kept until an operator prunes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Keep at most this many newest records when pruning
    #[serde(default)]
    pub max_records: Option<u64>,

    /// Drop records older than this many days when pruning
    #[serde(default)]
    pub retention_days: Option<u32>,
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Highest risk level allowed to reach the executor (low, medium, high)
    #[serde(default = "default_max_risk_level")]
    pub max_risk_level: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.infrabot")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "deepseek-coder".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_temperature() -> f64 {
    0.1
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_context_records() -> usize {
    3
}

fn default_executor_program() -> String {
    "ansible-playbook".to_string()
}

fn default_executor_timeout() -> u64 {
    300
}

fn default_max_risk_level() -> String {
    "high".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            request_timeout_secs: default_request_timeout(),
            temperature: default_temperature(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            context_records: default_context_records(),
            review_narrative: false,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: default_executor_program(),
            timeout_secs: default_executor_timeout(),
            check_mode: false,
            default_inventory: None,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_risk_level: default_max_risk_level(),
        }
    }
}

impl LLMConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl MemoryConfig {
    /// Retention policy applied by an explicit prune
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_records: self.max_records,
            max_age_days: self.retention_days,
        }
    }
}

impl SecurityConfig {
    /// Parsed risk ceiling; validated at load time
    pub fn max_risk(&self) -> RiskLevel {
        self.max_risk_level.parse().unwrap_or(RiskLevel::High)
    }
}

impl Config {
    /// Load `~/.infrabot/config.toml`, writing a default file on first run
    pub fn load_or_create() -> Result<Self, EngineError> {
        let path = Self::default_config_path()?;
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Self::write_default(&path)
        }
    }

    /// Load and validate the file at `path`
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let text = fs::read_to_string(path)
            .map_err(|e| config_error(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Parse TOML text, then validate it and resolve paths
    pub fn from_toml_str(text: &str) -> Result<Self, EngineError> {
        let mut config: Config =
            toml::from_str(text).map_err(|e| config_error(format!("invalid TOML: {}", e)))?;
        config.validate_and_process()?;
        Ok(config)
    }

    fn write_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| config_error(format!("cannot create {}: {}", dir.display(), e)))?;
        }

        // Rendered before path expansion so the file keeps `~`
        let mut config = Self::default();
        let rendered = toml::to_string_pretty(&config)
            .map_err(|e| config_error(format!("cannot render defaults: {}", e)))?;
        config.validate_and_process()?;

        fs::write(path, rendered)
            .map_err(|e| config_error(format!("cannot write {}: {}", path.display(), e)))?;
        tracing::info!(path = %path.display(), "Wrote default configuration");
        Ok(config)
    }

    /// `~/.infrabot/config.toml`
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        Ok(home()?.join(".infrabot").join("config.toml"))
    }

    /// Path of the SQLite memory database
    pub fn memory_db_path(&self) -> PathBuf {
        self.core.data_dir.join("memory.db")
    }

    /// Check every field, expand `~` and make sure the data directory exists
    pub fn validate_and_process(&mut self) -> Result<(), EngineError> {
        const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

        if !LOG_LEVELS.contains(&self.core.log_level.as_str()) {
            return Err(config_error(format!(
                "Invalid log level '{}' (expected {})",
                self.core.log_level,
                LOG_LEVELS.join("|")
            )));
        }

        let url = &self.llm.base_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(config_error(format!(
                "llm.base_url '{}' is not an http(s) URL",
                url
            )));
        }

        let checks = [
            (
                self.llm.model.trim().is_empty() || self.llm.embedding_model.trim().is_empty(),
                "llm.model and llm.embedding_model must not be empty",
            ),
            (
                self.llm.request_timeout_secs == 0,
                "llm.request_timeout_secs must be positive",
            ),
            (
                self.executor.timeout_secs == 0,
                "executor.timeout_secs must be positive",
            ),
            (
                self.pipeline.context_records == 0,
                "pipeline.context_records must be at least 1",
            ),
            (
                self.pipeline.max_retries > 10,
                "pipeline.max_retries cannot exceed 10",
            ),
            (
                self.memory.max_records == Some(0),
                "memory.max_records must be at least 1 when set",
            ),
        ];
        if let Some((_, msg)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(config_error(*msg));
        }

        self.security
            .max_risk_level
            .parse::<RiskLevel>()
            .map_err(|e| config_error(format!("security.max_risk_level: {}", e)))?;

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        self.executor.default_inventory = self
            .executor
            .default_inventory
            .as_deref()
            .map(expand_path)
            .transpose()?;

        fs::create_dir_all(&self.core.data_dir).map_err(|e| {
            config_error(format!(
                "cannot create data directory {}: {}",
                self.core.data_dir.display(),
                e
            ))
        })?;

        Ok(())
    }
}

fn config_error(msg: impl Into<String>) -> EngineError {
    EngineError::Config(msg.into())
}

fn home() -> Result<PathBuf, EngineError> {
    dirs::home_dir().ok_or_else(|| config_error("home directory is unknown"))
}

/// Resolve a leading `~` against the home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(home()?.join(rest)),
        Err(_) => Ok(path.to_path_buf()),
    }
}
