//! Error types for vaultflow-core
//!
//! Every failure the engine can observe is classified into one [`VaultError`]
//! variant. The retrier switches on the variant to decide whether a batch is
//! attempted again, and item results carry the matching [`ErrorKind`].

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for vault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Errors that can occur while talking to the vault API
#[derive(Debug, Clone, Error)]
pub enum VaultError {
    /// Transport failure, no HTTP status available
    #[error("network error: {0}")]
    Network(String),

    /// HTTP 429, optionally carrying the server's `Retry-After` hint
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// HTTP 5xx
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// HTTP 408
    #[error("request timeout: {0}")]
    RequestTimeout(String),

    /// Any other HTTP 4xx
    #[error("client error ({status}): {message}")]
    Client { status: u16, message: String },

    /// HTTP 401
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Response body could not be mapped onto the submitted batch
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Deadline or caller cancellation fired before the work finished
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration or input
    #[error("configuration error: {0}")]
    Config(String),
}

impl VaultError {
    /// Classify a non-2xx HTTP status into a vault error.
    pub fn from_status(status: u16, retry_after: Option<Duration>, body: impl Into<String>) -> Self {
        let message = body.into();
        match status {
            401 => Self::Auth(message),
            408 => Self::RequestTimeout(message),
            429 => Self::RateLimited {
                message,
                retry_after,
            },
            500..=599 => Self::Server { status, message },
            _ => Self::Client { status, message },
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_)
            | Self::RateLimited { .. }
            | Self::Server { .. }
            | Self::RequestTimeout(_) => true,
            Self::Client { .. }
            | Self::Auth(_)
            | Self::MalformedResponse(_)
            | Self::Cancelled
            | Self::Config(_) => false,
        }
    }

    /// Check if this error must abort an enclosing multi-phase workflow
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// HTTP status associated with this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::Server { status, .. } | Self::Client { status, .. } => Some(*status),
            Self::RequestTimeout(_) => Some(408),
            Self::Auth(_) => Some(401),
            _ => None,
        }
    }

    /// Server-provided `Retry-After` hint
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Item-level classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Server { .. } => ErrorKind::Server,
            Self::RequestTimeout(_) => ErrorKind::RequestTimeout,
            Self::Client { .. } | Self::Config(_) => ErrorKind::Client,
            Self::Auth(_) => ErrorKind::Auth,
            Self::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a malformed response error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedResponse(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<reqwest::Error> for VaultError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::from_status(status.as_u16(), None, e.to_string()),
            None if e.is_decode() => Self::MalformedResponse(e.to_string()),
            None => Self::Network(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedResponse(e.to_string())
    }
}

/// Failure class recorded on an individual item result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    RateLimited,
    Server,
    RequestTimeout,
    Client,
    Auth,
    MalformedResponse,
    /// The API answered the batch but rejected this record
    Rejected,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::RateLimited => "rate_limited",
            Self::Server => "server",
            Self::RequestTimeout => "request_timeout",
            Self::Client => "client",
            Self::Auth => "auth",
            Self::MalformedResponse => "malformed_response",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error attached to a single operation's result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Per-record rejection returned inside a successful batch response
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rejected, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, VaultError::Cancelled.to_string())
    }
}

impl From<&VaultError> for ItemError {
    fn from(e: &VaultError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ItemError {}
