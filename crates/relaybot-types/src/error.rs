//! Error types for the relaybot gateway.
//!
//! [`RelayError`] is the top-level taxonomy threaded through the pipeline;
//! [`RequesterError`] covers failures of remote model HTTP services. Both
//! are non-exhaustive so new variants do not break downstream crates.

use thiserror::Error;

/// Failure of a remote LLM / embedding HTTP service.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RequesterError {
    /// The API key was rejected.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The request body was rejected by the provider.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The provider is throttling requests.
    #[error("rate limited by provider")]
    RateLimited {
        /// Suggested wait before retrying, when the provider sent one.
        retry_after_ms: Option<u64>,
    },

    /// The request exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// The model or endpoint does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The provider returned a 5xx.
    #[error("provider error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// The response body could not be interpreted.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl RequesterError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Server { .. } | Self::Network(_) | Self::Timeout
        )
    }
}

/// Top-level error type for the gateway core.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RelayError {
    /// The session is not allowed by access control. Silent to the user.
    #[error("access denied for session")]
    AccessDenied,

    /// The rate limiter rejected the request.
    #[error("rate limited")]
    RateLimited,

    /// A platform payload could not be converted to the canonical model.
    #[error("converter failure: {0}")]
    Converter(String),

    /// A model request failed.
    #[error(transparent)]
    Requester(#[from] RequesterError),

    /// The plugin runtime returned an error or the RPC transport failed.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// A vector-database operation failed.
    #[error("vector store failure ({provider}): {message}")]
    VectorStore { provider: String, message: String },

    /// An embedding request failed.
    #[error("embedding failure: {0}")]
    Embedding(String),

    /// The query was cooperatively cancelled.
    #[error("query cancelled")]
    Cancelled,

    /// An operation exceeded its deadline.
    #[error("operation timed out: {operation}")]
    Timeout { operation: String },

    /// Configuration is malformed or semantically invalid.
    #[error("invalid config: {reason}")]
    ConfigInvalid { reason: String },

    /// Object storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for errors without a dedicated variant.
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requester_retryability() {
        assert!(RequesterError::Timeout.is_retryable());
        assert!(RequesterError::RateLimited {
            retry_after_ms: Some(500)
        }
        .is_retryable());
        assert!(RequesterError::Server {
            status: 503,
            message: "overloaded".into()
        }
        .is_retryable());
        assert!(!RequesterError::Auth("bad key".into()).is_retryable());
        assert!(!RequesterError::BadRequest("schema".into()).is_retryable());
        assert!(!RequesterError::NotFound("gpt-x".into()).is_retryable());
    }

    #[test]
    fn requester_error_converts_to_relay() {
        let err: RelayError = RequesterError::Timeout.into();
        assert!(matches!(err, RelayError::Requester(RequesterError::Timeout)));
    }

    #[test]
    fn display_messages() {
        let err = RelayError::VectorStore {
            provider: "memory".into(),
            message: "dimension mismatch".into(),
        };
        assert_eq!(
            err.to_string(),
            "vector store failure (memory): dimension mismatch"
        );
        assert_eq!(RelayError::AccessDenied.to_string(), "access denied for session");
    }

    #[test]
    fn io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: RelayError = io.into();
        assert!(matches!(err, RelayError::Io(_)));
    }
}
