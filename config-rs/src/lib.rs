//! config-rs/lib.rs
//! Shared configuration for the assistant coordination core.
//!
//! Configuration is layered:
//! 1. compiled-in defaults (`Default` impls below)
//! 2. an optional TOML file (`ASSISTANT_CONFIG`, default `config/assistant.toml`)
//! 3. a handful of environment overrides for values commonly changed per host
//!
//! Loading never panics. A missing file means defaults; an unparsable file is
//! an error because silently ignoring it would hide operator mistakes.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the TOML configuration file.
pub const CONFIG_PATH_VAR: &str = "ASSISTANT_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config/assistant.toml";

/// Errors produced while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for the inference backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// Base URL of the chat endpoint host (Ollama-compatible)
    pub base_url: String,
    /// Model used by workers that do not name one explicitly
    pub default_model: String,
    /// Transport-level timeout for a single HTTP request
    pub request_timeout_secs: u64,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            default_model: "llama3.1:8b".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// Circuit breaker, timeout and retry tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cool_down_secs: u64,
    pub call_timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub exponential_base: f64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added as random jitter (0.0 - 1.0)
    pub jitter_ratio: f64,
    /// Longest input accepted by the validator, in characters
    pub max_input_chars: usize,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cool_down_secs: 60,
            call_timeout_secs: 30,
            max_attempts: 3,
            base_delay_ms: 1_000,
            exponential_base: 2.0,
            max_delay_ms: 30_000,
            jitter_ratio: 0.1,
            max_input_chars: 10_000,
        }
    }
}

impl ResilienceSettings {
    pub fn cool_down(&self) -> Duration {
        Duration::from_secs(self.cool_down_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Capability-gap and proposal tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImprovementSettings {
    /// Directory holding `capability_gaps.ndjson` and `improvement_proposals.ndjson`
    pub data_dir: PathBuf,
    /// A gap seen this many times is escalated into a proposal
    pub escalation_frequency: u32,
    /// Mailbox name of the improvement engine
    pub engine_agent: String,
    /// Mailbox name of the worker that implements proposals
    pub implementer_agent: String,
}

impl Default for ImprovementSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/self-improve"),
            escalation_frequency: 5,
            engine_agent: "improvement_engine".to_string(),
            implementer_agent: "implementer".to_string(),
        }
    }
}

/// Code change ledger locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// Directory holding `changes.ndjson`, `snapshots/` and `CHANGELOG.md`
    pub dir: PathBuf,
    /// Directory where the implementer writes newly generated files
    pub generated_dir: PathBuf,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/change-ledger"),
            generated_dir: PathBuf::from("generated"),
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub service_name: String,
    pub json_format: bool,
    /// When set, logs are additionally written to a daily-rotated file here
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "assistant-core".to_string(),
            json_format: false,
            log_dir: None,
        }
    }
}

/// Complete configuration of the coordination core.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub inference: InferenceSettings,
    pub resilience: ResilienceSettings,
    pub improvement: ImprovementSettings,
    pub ledger: LedgerSettings,
    pub logging: LoggingSettings,
}

impl AssistantConfig {
    /// Load configuration from the file named by `ASSISTANT_CONFIG` (or the
    /// default location), then apply environment overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        // A .env file is optional.
        let _ = dotenv::dotenv();

        let path = env::var(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply the supported environment overrides in place.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("ASSISTANT_INFERENCE_URL") {
            self.inference.base_url = url;
        }
        if let Ok(model) = env::var("ASSISTANT_DEFAULT_MODEL") {
            self.inference.default_model = model;
        }
        if let Ok(dir) = env::var("ASSISTANT_DATA_DIR") {
            let root = PathBuf::from(dir);
            self.improvement.data_dir = root.join("self-improve");
            self.ledger.dir = root.join("change-ledger");
        }
        if let Ok(level) = env::var("ASSISTANT_LOG_LEVEL") {
            self.logging.level = level;
        }
        self.resilience.failure_threshold = env_or(
            "ASSISTANT_FAILURE_THRESHOLD",
            self.resilience.failure_threshold,
        );
        self.resilience.call_timeout_secs = env_or(
            "ASSISTANT_CALL_TIMEOUT_SECS",
            self.resilience.call_timeout_secs,
        );
    }

    /// Reject settings that would make the core misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.resilience;
        if r.failure_threshold == 0 || r.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit breaker thresholds must be at least 1".to_string(),
            ));
        }
        if r.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "resilience.call_timeout_secs must be at least 1".to_string(),
            ));
        }
        if r.cool_down_secs == 0 {
            return Err(ConfigError::Invalid(
                "resilience.cool_down_secs must be at least 1".to_string(),
            ));
        }
        if r.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "resilience.max_attempts must be at least 1".to_string(),
            ));
        }
        if r.exponential_base < 1.0 {
            return Err(ConfigError::Invalid(
                "resilience.exponential_base must be >= 1.0".to_string(),
            ));
        }
        // With jitter no larger than the growth factor the delay sequence
        // stays non-decreasing.
        if !(0.0..=1.0).contains(&r.jitter_ratio) || r.jitter_ratio > r.exponential_base - 1.0 {
            return Err(ConfigError::Invalid(format!(
                "resilience.jitter_ratio {} must be within [0, exponential_base - 1]",
                r.jitter_ratio
            )));
        }
        if r.base_delay_ms > r.max_delay_ms {
            return Err(ConfigError::Invalid(
                "resilience.base_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }
        if self.improvement.escalation_frequency == 0 {
            return Err(ConfigError::Invalid(
                "improvement.escalation_frequency must be at least 1".to_string(),
            ));
        }
        if self.improvement.engine_agent == self.improvement.implementer_agent {
            return Err(ConfigError::Invalid(
                "engine and implementer mailboxes must differ".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read `name` from the environment and parse it, falling back to `default`
/// when unset or unparsable.
pub fn env_or<T: FromStr + Copy + std::fmt::Display>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            tracing::warn!("Invalid value {:?} in {}, using {}", raw, name, default);
            default
        }),
        Err(_) => default,
    }
}
