//! Engine-wide error taxonomy.
//!
//! Every fallible operation in the engine returns one of these kinds. The
//! exchange layer maps venue responses into the taxonomy; the reliable
//! executor decides retry behavior purely from the kind, never from the
//! message text.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All error kinds the engine can surface.
///
/// `Clone` is derived so a cached execution outcome can be replayed to
/// duplicate submitters without re-running the operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Parameters failed validation before any work was attempted.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// A referenced resource (strategy, order, key) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller lacks the capability for this operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The resource exists but its current state forbids the operation.
    #[error("bad state: {0}")]
    BadState(String),

    /// A risk rule rejected the order before submission.
    #[error("risk check rejected order: {0}")]
    RiskReject(String),

    /// Network/timeout class failure; safe to retry.
    #[error("transient venue failure: {0}")]
    Transient(String),

    /// The venue throttled us; retry after the hint if one was provided.
    #[error("rate limited by venue")]
    RateLimited {
        /// Venue-provided retry-after hint, when available.
        retry_after: Option<Duration>,
    },

    /// Credentials were rejected by the venue. Never retried.
    #[error("venue authentication failed: {0}")]
    AuthFailed(String),

    /// The request itself is malformed; retrying cannot help.
    #[error("permanent venue failure: {0}")]
    Permanent(String),

    /// The circuit breaker is open; the call was not attempted.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The operation observed cancellation and stopped without committing.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// The key store (or audit log) is unreachable or misbehaving.
    #[error("key store error: {0}")]
    Store(String),

    /// Anything the taxonomy cannot classify.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Whether the reliable executor may retry this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::RateLimited { .. })
    }

    /// Venue-provided backoff hint, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Process exit code for the CLI runner.
    ///
    /// `0` clean shutdown, `1` config error, `2` fatal dependency error,
    /// `3` cancelled.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::InvalidParams(_) => 1,
            Error::Store(_) => 2,
            Error::Cancelled => 3,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Permanent(format!("payload decode: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Error::Transient(err.to_string())
        } else {
            Error::Unknown(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transient(format!("websocket: {err}"))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Store(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::Config(format!("bad url: {err}"))
    }
}
