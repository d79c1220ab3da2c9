//! Error types for the request pipeline

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the request pipeline
pub type Result<T> = std::result::Result<T, Error>;

/// Request pipeline errors
///
/// Callers of [`crate::client::ApiClient::execute`] see either a response or
/// exactly one of these.
#[derive(Error, Debug)]
pub enum Error {
    /// Raw failure reported by the transport
    #[error("Transport error{}: {message}", status_suffix(.status))]
    Transport {
        /// HTTP status, `None` for connection-level failures
        status: Option<u16>,
        /// Failure description
        message: String,
    },

    /// Circuit breaker rejected the call without reaching the transport
    #[error("Circuit '{name}' is open, retry in {}ms", .retry_in.as_millis())]
    CircuitOpen {
        /// Breaker name
        name: String,
        /// Time left until the breaker admits a probe
        retry_in: Duration,
    },

    /// Credentials could not be produced or refreshed
    #[error("Credential error: {0}")]
    Credential(String),

    /// `retry()` was invoked past the chain-wide ceiling
    #[error("Maximum retry count exceeded ({max_retries})")]
    RetryExhausted {
        /// Configured ceiling
        max_retries: u32,
    },

    /// Backoff sleep was cancelled before the retry could be issued
    #[error("Retry aborted: interrupted during backoff before attempt {}", next_attempt(.retry_count))]
    InterruptedDuringBackoff {
        /// Retry count at the time of interruption
        retry_count: u32,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Build a transport error carrying an HTTP status
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self::Transport {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Build a connection-level transport error (no HTTP status)
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            message: message.into(),
        }
    }

    /// HTTP status attached to this error, if any
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            _ => None,
        }
    }

    /// True for transport errors with a 5xx status
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status().is_some_and(|s| (500..600).contains(&s))
    }

    /// True for transport errors with a 4xx status
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status().is_some_and(|s| (400..500).contains(&s))
    }

    /// True if the breaker rejected the call
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

fn next_attempt(retry_count: &u32) -> u32 {
    retry_count + 1
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}
