//! Model call failures, split into transient (retried) and permanent.

use std::time::Duration;

use thiserror::Error;

use crate::backoff::Backoff;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("client error (HTTP {status}): {message}")]
    Client { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    Parse(String),
}

impl LlmError {
    /// Classify a non-success HTTP response.
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => LlmError::RateLimited {
                message,
                retry_after,
            },
            400..=499 => LlmError::Client { status, message },
            _ => LlmError::Server { status, message },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::Server { .. } | LlmError::Network(_)
        )
    }

    /// Delay before retry `attempt`; a server-sent Retry-After wins.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = match self {
            LlmError::RateLimited {
                retry_after: Some(retry_after),
                ..
            } => return *retry_after,
            LlmError::RateLimited { .. } => Duration::from_secs(5),
            LlmError::Server { .. } => Duration::from_secs(2),
            _ => Duration::from_secs(1),
        };
        Backoff::new(base, Duration::from_secs(60)).delay(attempt)
    }
}
