//! Error types for the publisher client.

use std::time::Duration;

/// Publisher errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Credentials rejected (401, 403).
    #[error("unauthorized (HTTP {status}): {message}")]
    Auth { status: u16, message: String },

    /// Server refused the document (400, 422).
    #[error("report rejected as invalid (HTTP {status}): {message}")]
    Validation { status: u16, message: String },

    /// Any other 4xx.
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// Client-side configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// 2xx with a body we cannot read.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    /// Connect, timeout, IO, or 408.
    #[error("network error: {message}")]
    Network { message: String },

    /// 429.
    #[error("rate limited: retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// 5xx.
    #[error("server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// A retryable failure that persisted through every attempt.
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<PublishError>,
    },
}

impl PublishError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Validation { .. } => "validation",
            Self::Rejected { .. } => "rejected",
            Self::Config { .. } => "config",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::Network { .. } => "network",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::RetriesExhausted { .. } => "retries_exhausted",
        }
    }

    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            // Config issues
            Self::Config { .. } => 1,

            // Auth issues
            Self::Auth { .. } => 2,

            // Server refused the report
            Self::Validation { .. } => 3,
            Self::Rejected { .. } => 3,

            // Network/transient
            Self::Network { .. } => 5,
            Self::RateLimited { .. } => 5,
            Self::ServerError { .. } => 5,
            Self::RetriesExhausted { .. } => 5,

            // Other
            Self::InvalidResponse { .. } => 6,
        }
    }

    /// Whether a later attempt may succeed.
    ///
    /// `RetriesExhausted` stays retryable: the offline queue keeps the
    /// report pending for the next drain.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::RetriesExhausted { .. }
        )
    }

    /// HTTP status behind this error, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Auth { status, .. }
            | Self::Validation { status, .. }
            | Self::Rejected { status, .. }
            | Self::ServerError { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for PublishError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

/// Result type for publisher operations.
pub type ClientResult<T> = Result<T, PublishError>;
