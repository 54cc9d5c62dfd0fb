//! Error types for the LAM gateway.

use thiserror::Error;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid startup configuration. Fatal; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Tool not found in the registry.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Tool-call arguments rejected by schema validation.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Remote API rejected the credentials. Never retried.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Remote API throttled the request (HTTP 429/5xx). Retried with backoff.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Transport-level failure reaching the remote API. Retried with backoff.
    #[error("network error: {0}")]
    Network(String),

    /// Remote-side failure reported by the LAM API. Surfaced verbatim.
    #[error("remote error ({code}): {message}")]
    Remote {
        /// Machine-readable remote error code.
        code: String,
        /// Human-readable remote message.
        message: String,
    },

    /// A local or remote operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Invocation cancelled by the caller.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the JSON-RPC error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::ToolNotFound(_) => codes::METHOD_NOT_FOUND,
            Error::InvalidParams(_) => codes::INVALID_PARAMS,
            Error::Serialization(_) => codes::PARSE_ERROR,
            Error::Configuration(_) => -32000,
            Error::Auth(_) => -32001,
            Error::RateLimited(_) => -32002,
            Error::Network(_) => -32003,
            Error::Remote { .. } => -32004,
            Error::Timeout(_) => -32005,
            Error::Cancelled(_) => -32006,
            Error::Io(_) => -32007,
            Error::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Machine-readable error kind, included in every tool-call error payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration_error",
            Error::ToolNotFound(_) => "unknown_tool",
            Error::InvalidParams(_) => "invalid_params",
            Error::Auth(_) => "auth_error",
            Error::RateLimited(_) => "rate_limited",
            Error::Network(_) => "network_error",
            Error::Remote { .. } => "remote_error",
            Error::Timeout(_) => "timeout",
            Error::Cancelled(_) => "cancelled",
            Error::Serialization(_) => "serialization_error",
            Error::Io(_) => "io_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Whether a fresh attempt of the same request could succeed.
    ///
    /// Only transient transport failures and throttling qualify. Auth
    /// rejections never do: retrying cannot change the outcome.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::RateLimited(_))
    }
}

/// Standard JSON-RPC error codes.
pub mod codes {
    /// Parse error.
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid request.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Network("reset".into()).is_transient());
        assert!(Error::RateLimited("429".into()).is_transient());
        assert!(!Error::Auth("bad key".into()).is_transient());
        assert!(!Error::Remote {
            code: "task_failed".into(),
            message: "boom".into()
        }
        .is_transient());
        assert!(!Error::Timeout("deadline".into()).is_transient());
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(Error::ToolNotFound("x".into()).kind(), "unknown_tool");
        assert_eq!(Error::InvalidParams("x".into()).kind(), "invalid_params");
        assert_eq!(Error::Auth("x".into()).kind(), "auth_error");
        assert_eq!(Error::Timeout("x".into()).kind(), "timeout");
    }

    #[test]
    fn json_rpc_codes() {
        assert_eq!(Error::ToolNotFound("x".into()).code(), -32601);
        assert_eq!(Error::InvalidParams("x".into()).code(), -32602);
    }
}
