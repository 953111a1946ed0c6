//! AgentCore configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Iteration limits and circuit-breaker thresholds
    pub execution: ExecutionLimits,

    /// Prompt assembly and compression
    pub context: ContextConfig,

    /// Stagnation detection
    pub entropy: EntropyConfig,

    /// Durable store location
    pub storage: StorageConfig,

    /// Log output
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path, then `./.agentcore.yml`, then the user config directory,
    /// then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".agentcore.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("agentcore").join("agentcore.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// What a response without tool calls means
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponsePolicy {
    /// Every turn must call a tool; plain text is a hallucination
    #[default]
    RequireToolCall,
    /// Plain text is the final answer
    FreeForm,
}

/// Iteration limits and circuit-breaker thresholds for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Soft limit; past it the model gets a diagnostic hint each iteration
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,

    /// Absolute ceiling on the hard limit
    #[serde(rename = "hard-cap")]
    pub hard_cap: u32,

    /// Hard limit is `max_iterations * hard_limit_factor`, capped at `hard_cap`
    #[serde(rename = "hard-limit-factor")]
    pub hard_limit_factor: f64,

    /// Per tool call timeout in milliseconds
    #[serde(rename = "tool-timeout-ms")]
    pub tool_timeout_ms: u64,

    /// Consecutive identical call batches that interrupt the run
    #[serde(rename = "repeat-trip")]
    pub repeat_trip: u32,

    /// Consecutive identical tool errors that interrupt the run
    #[serde(rename = "error-trip")]
    pub error_trip: u32,

    #[serde(rename = "response-policy")]
    pub response_policy: ResponsePolicy,

    /// Run the calls of one batch concurrently
    #[serde(rename = "parallel-tools")]
    pub parallel_tools: bool,

    /// Retries for retryable model errors (rate limits are not counted)
    #[serde(rename = "model-retries")]
    pub model_retries: u32,

    /// Tools whose output is judged by exit status only
    #[serde(rename = "shell-tools")]
    pub shell_tools: Vec<String>,

    /// Phrases that fail the run on first sight
    #[serde(rename = "critical-keywords")]
    pub critical_keywords: Vec<String>,
}

fn default_max_iterations() -> u32 {
    debug!("default_max_iterations: called");
    10
}

fn default_hard_cap() -> u32 {
    debug!("default_hard_cap: called");
    25
}

fn default_tool_timeout_ms() -> u64 {
    debug!("default_tool_timeout_ms: called");
    60_000
}

fn default_critical_keywords() -> Vec<String> {
    debug!("default_critical_keywords: called");
    [
        "api_key",
        "not configured",
        "unauthorized",
        "access denied",
        "authentication failed",
        "permission denied",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            hard_cap: default_hard_cap(),
            hard_limit_factor: 2.5,
            tool_timeout_ms: default_tool_timeout_ms(),
            repeat_trip: 5,
            error_trip: 3,
            response_policy: ResponsePolicy::default(),
            parallel_tools: true,
            model_retries: 2,
            shell_tools: vec!["shell".to_string(), "bash".to_string()],
            critical_keywords: default_critical_keywords(),
        }
    }
}

impl ExecutionLimits {
    /// Soft limit
    pub fn soft_limit(&self) -> u32 {
        self.max_iterations
    }

    /// `min(hard_cap, floor(max_iterations * hard_limit_factor))`, at least 1
    pub fn hard_limit(&self) -> u32 {
        let scaled = (self.max_iterations as f64 * self.hard_limit_factor).floor() as u32;
        scaled.min(self.hard_cap).max(1)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    /// Builder: soft limit
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Builder: response policy
    pub fn with_policy(mut self, policy: ResponsePolicy) -> Self {
        self.response_policy = policy;
        self
    }
}

pub const DEFAULT_IDENTITY_PROMPT: &str = "You are a tool-executing agent. You receive one instruction and carry it out \
by calling tools.\n\
Rules:\n\
1. Every reply MUST contain a tool call.\n\
2. Think inside <reflection>...</reflection> before acting. If you cannot make progress, say \"I am stuck\" there.\n\
3. When the instruction is fully done, call system_task_complete with a short summary.\n\
4. When the instruction cannot be done, call system_report_failure with the reason.";

/// Prompt assembly and compression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Turns per compression block; compression triggers at twice this many tail turns
    #[serde(rename = "block-size")]
    pub block_size: usize,

    /// Immutable system prefix
    #[serde(rename = "identity-prompt")]
    pub identity_prompt: String,

    #[serde(rename = "compression-enabled")]
    pub compression_enabled: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            block_size: 5,
            identity_prompt: DEFAULT_IDENTITY_PROMPT.to_string(),
            compression_enabled: true,
        }
    }
}

/// Stagnation detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntropyConfig {
    #[serde(rename = "window-size")]
    pub window_size: usize,

    /// Repetition ratio at or above which the state is stagnant
    #[serde(rename = "stagnant-threshold")]
    pub stagnant_threshold: f64,

    /// Repetition ratio at or above which the state is stable
    #[serde(rename = "stable-threshold")]
    pub stable_threshold: f64,
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self {
            window_size: 6,
            stagnant_threshold: 1.0,
            stable_threshold: 0.5,
        }
    }
}

/// Durable store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path; defaults under the user data directory
    #[serde(rename = "db-path")]
    pub db_path: Option<PathBuf>,
}

impl StorageConfig {
    /// Database path to open
    pub fn resolved_db_path(&self) -> PathBuf {
        if let Some(path) = &self.db_path {
            return path.clone();
        }
        dirs::data_local_dir()
            .map(|dir| dir.join("agentcore"))
            .unwrap_or_else(|| PathBuf::from(".agentcore"))
            .join("agentcore.db")
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: String,

    /// Log file; stderr when absent
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}
