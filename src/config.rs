//! Configuration management for agentd.
//!
//! Configuration is read from environment variables:
//! - `LLM_API_KEY` - Required by the binary. API key for the model provider
//!   (`OPENROUTER_API_KEY` is accepted as a fallback).
//! - `LLM_BASE_URL` - Optional. OpenAI-compatible chat completions endpoint.
//! - `DEFAULT_MODEL` - Optional. Model used by agents without an override.
//! - `AGENTD_CATALOG` - Optional. Path to the YAML/JSON catalog of environments.
//! - `AGENTD_MCP_POOL_WORKERS` - Optional. Concurrent tool server connects. Defaults to `5`.
//! - `AGENTD_MCP_CONFIG_WORKERS` - Optional. Concurrent config resolutions. Defaults to `2`.
//! - `AGENTD_MCP_DISCOVERY_TIMEOUT_SECS` - Optional. Defaults to `15`.
//! - `AGENTD_MCP_CALL_TIMEOUT_SECS` - Optional. Defaults to `180`.
//! - `AGENTD_RECONNECT_BASE_MS` / `AGENTD_RECONNECT_MAX_SECS` - Optional. Reconnect backoff.
//! - `AGENTD_QUEUE_WORKERS` - Optional. Concurrent runs. Defaults to `5`.
//! - `AGENTD_QUEUE_CAPACITY` - Optional. Max pending runs. Defaults to `100`.
//! - `AGENTD_MAX_PER_AGENT` - Optional. Per-agent concurrency, `0` = unlimited.
//! - `AGENTD_RUN_TIMEOUT_SECS` - Optional. Per-run wall clock limit. Defaults to `600`.
//! - `AGENTD_SHUTDOWN_GRACE_SECS` - Optional. Defaults to `5`.
//! - `AGENTD_MAX_DELEGATION_DEPTH` - Optional. Defaults to `10`.
//! - `AGENTD_DEFAULT_MAX_STEPS` - Optional. Step limit for agents that declare none. Defaults to `25`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Tool server pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent spawn/handshake/discovery tasks
    pub connect_workers: usize,

    /// Concurrent config template resolutions
    pub config_workers: usize,

    /// Bound on initialize + tools/list
    pub discovery_timeout: Duration,

    /// Bound on a single tools/call
    pub call_timeout: Duration,

    /// First reconnect delay
    pub reconnect_base: Duration,

    /// Reconnect delay cap
    pub reconnect_max: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_workers: 5,
            config_workers: 2,
            discovery_timeout: Duration::from_secs(15),
            call_timeout: Duration::from_secs(180),
            reconnect_base: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Execution queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    pub capacity: usize,
    /// `None` means unlimited
    pub max_per_agent: Option<usize>,
    pub run_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            capacity: 100,
            max_per_agent: None,
            run_timeout: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Model provider API key
    pub api_key: String,

    /// Chat completions endpoint (OpenAI-compatible)
    pub llm_base_url: Option<String>,

    /// Default model identifier
    pub default_model: String,

    /// Catalog file with environments, agents and schedules
    pub catalog_path: Option<PathBuf>,

    pub max_delegation_depth: u32,

    pub default_max_steps: usize,

    pub pool: PoolConfig,

    pub queue: QueueConfig,
}

fn env_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

fn positive(name: &str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if no API key is set and
    /// `ConfigError::InvalidValue` for unparsable numbers.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .map_err(|_| ConfigError::MissingEnvVar("LLM_API_KEY".to_string()))?;

        let default_model = std::env::var("DEFAULT_MODEL")
            .unwrap_or_else(|_| "anthropic/claude-sonnet-4.5".to_string());

        let pool = PoolConfig {
            connect_workers: positive(
                "AGENTD_MCP_POOL_WORKERS",
                env_or("AGENTD_MCP_POOL_WORKERS", 5)?,
            )?,
            config_workers: positive(
                "AGENTD_MCP_CONFIG_WORKERS",
                env_or("AGENTD_MCP_CONFIG_WORKERS", 2)?,
            )?,
            discovery_timeout: Duration::from_secs(env_or(
                "AGENTD_MCP_DISCOVERY_TIMEOUT_SECS",
                15,
            )?),
            call_timeout: Duration::from_secs(env_or("AGENTD_MCP_CALL_TIMEOUT_SECS", 180)?),
            reconnect_base: Duration::from_millis(env_or("AGENTD_RECONNECT_BASE_MS", 500)?),
            reconnect_max: Duration::from_secs(env_or("AGENTD_RECONNECT_MAX_SECS", 30)?),
        };

        let max_per_agent: usize = env_or("AGENTD_MAX_PER_AGENT", 0)?;
        let queue = QueueConfig {
            workers: positive("AGENTD_QUEUE_WORKERS", env_or("AGENTD_QUEUE_WORKERS", 5)?)?,
            capacity: positive(
                "AGENTD_QUEUE_CAPACITY",
                env_or("AGENTD_QUEUE_CAPACITY", 100)?,
            )?,
            max_per_agent: (max_per_agent > 0).then_some(max_per_agent),
            run_timeout: Duration::from_secs(env_or("AGENTD_RUN_TIMEOUT_SECS", 600)?),
            shutdown_grace: Duration::from_secs(env_or("AGENTD_SHUTDOWN_GRACE_SECS", 5)?),
        };

        Ok(Self {
            api_key,
            llm_base_url: std::env::var("LLM_BASE_URL").ok(),
            default_model,
            catalog_path: std::env::var("AGENTD_CATALOG").ok().map(PathBuf::from),
            max_delegation_depth: env_or("AGENTD_MAX_DELEGATION_DEPTH", 10)?,
            default_max_steps: positive(
                "AGENTD_DEFAULT_MAX_STEPS",
                env_or("AGENTD_DEFAULT_MAX_STEPS", 25)?,
            )?,
            pool,
            queue,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, default_model: String) -> Self {
        Self {
            api_key,
            llm_base_url: None,
            default_model,
            catalog_path: None,
            max_delegation_depth: 10,
            default_max_steps: 25,
            pool: PoolConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}
