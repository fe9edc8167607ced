//! Error taxonomy shared by every orchestration component.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable classification of an [`OrchestrationError`].
///
/// This is what gets persisted on a failed run, so the variants are stable
/// and serialized in snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ToolNotFound,
    ToolCallFailed,
    MaxDelegationDepthExceeded,
    DelegationCycleDetected,
    Timeout,
    Cancelled,
    ConnectionUnavailable,
    ConfigurationError,
    InvalidRunIdentity,
    ModelError,
    Persistence,
    QueueFull,
    ShuttingDown,
    UnknownRun,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::ToolNotFound => "tool_not_found",
            ErrorKind::ToolCallFailed => "tool_call_failed",
            ErrorKind::MaxDelegationDepthExceeded => "max_delegation_depth_exceeded",
            ErrorKind::DelegationCycleDetected => "delegation_cycle_detected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ConnectionUnavailable => "connection_unavailable",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::InvalidRunIdentity => "invalid_run_identity",
            ErrorKind::ModelError => "model_error",
            ErrorKind::Persistence => "persistence",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::ShuttingDown => "shutting_down",
            ErrorKind::UnknownRun => "unknown_run",
        };
        f.write_str(s)
    }
}

/// Errors raised by the pool, resolver, engine, queue and scheduler.
#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool '{tool}' failed: {message}")]
    ToolCallFailed { tool: String, message: String },

    #[error("delegation to '{agent}' at depth {depth} exceeds maximum depth {max}")]
    MaxDelegationDepthExceeded {
        agent: String,
        depth: u32,
        max: u32,
    },

    #[error("delegation cycle detected: {}", path.join(" -> "))]
    DelegationCycleDetected { path: Vec<String> },

    #[error("run timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("run cancelled")]
    Cancelled,

    #[error("tool server '{server}' unavailable: {message}")]
    ConnectionUnavailable { server: String, message: String },

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("invalid run identity: {0}")]
    InvalidRunIdentity(String),

    #[error("model error: {0}")]
    ModelError(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("queue is full ({0} runs pending)")]
    QueueFull(usize),

    #[error("queue is shutting down")]
    ShuttingDown,

    #[error("run {0} not found")]
    UnknownRun(String),
}

impl OrchestrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ToolNotFound(_) => ErrorKind::ToolNotFound,
            Self::ToolCallFailed { .. } => ErrorKind::ToolCallFailed,
            Self::MaxDelegationDepthExceeded { .. } => ErrorKind::MaxDelegationDepthExceeded,
            Self::DelegationCycleDetected { .. } => ErrorKind::DelegationCycleDetected,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ConnectionUnavailable { .. } => ErrorKind::ConnectionUnavailable,
            Self::ConfigurationError(_) => ErrorKind::ConfigurationError,
            Self::InvalidRunIdentity(_) => ErrorKind::InvalidRunIdentity,
            Self::ModelError(_) => ErrorKind::ModelError,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::QueueFull(_) => ErrorKind::QueueFull,
            Self::ShuttingDown => ErrorKind::ShuttingDown,
            Self::UnknownRun(_) => ErrorKind::UnknownRun,
        }
    }

    /// Structural errors abort the whole run. Everything else raised while a
    /// tool executes is handed back to the model as a tool error.
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            Self::ToolNotFound(_) | Self::ToolCallFailed { .. } | Self::ConnectionUnavailable { .. }
        )
    }

    pub fn to_run_error(&self) -> RunError {
        RunError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Structured error stored on a terminal run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&OrchestrationError> for RunError {
    fn from(err: &OrchestrationError) -> Self {
        err.to_run_error()
    }
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;
