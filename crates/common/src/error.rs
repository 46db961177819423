use thiserror::Error;

/// Canonical rowstream error taxonomy used across crates.
///
/// Classification guidance:
/// - [`RowStreamError::Api`]: structured error returned by the REST backend
/// - [`RowStreamError::Transport`]: connection-level failures before a response was read
/// - [`RowStreamError::Rpc`]: status returned by the streaming read service
/// - [`RowStreamError::Decode`]: malformed wire rows or Arrow batches
/// - [`RowStreamError::InvalidConfig`]: caller/config contract violations
///
/// The type is `Clone` so a terminal iterator can replay the error it failed with.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowStreamError {
    /// Invalid or inconsistent configuration / read request.
    ///
    /// Examples:
    /// - storage mode forced without a configured read client
    /// - job source without a destination table for a storage read
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Structured error body returned by the REST API.
    #[error("{0}")]
    Api(ApiError),

    /// Network/transport failure below the API layer.
    #[error("transport error ({kind:?}): {message}")]
    Transport {
        /// Failure class used for retry decisions.
        kind: TransportErrorKind,
        /// Human-readable detail.
        message: String,
    },

    /// Status returned by the streaming read service.
    #[error("rpc error ({code:?}): {message}")]
    Rpc {
        /// gRPC-style status code.
        code: RpcCode,
        /// Status message.
        message: String,
    },

    /// Wire rows or binary batches could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The query job backing a read has not finished yet.
    #[error("job {0} has not completed")]
    IncompleteJob(String),

    /// The governing cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Valid request for behavior this crate does not implement.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Another error annotated with the call that produced it.
    #[error("{context}: {source}")]
    Context {
        /// Call site, for example `tabledata.list`.
        context: String,
        /// Wrapped error.
        source: Box<RowStreamError>,
    },
}

impl RowStreamError {
    /// Wrap `self` with call context, preserving the original for classification.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error after peeling [`RowStreamError::Context`] layers.
    pub fn root(&self) -> &RowStreamError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when this error (at any wrapping depth) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }
}

/// Structured REST error: HTTP status, first reported reason and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP status code.
    pub code: u16,
    /// First structured reason (`backendError`, `rateLimitExceeded`, ...), if any.
    pub reason: Option<String>,
    /// Server-provided message.
    pub message: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "api error {} ({reason}): {}", self.code, self.message),
            None => write!(f, "api error {}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for ApiError {}

/// Transport failure classes that matter for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ConnectionRefused,
    ConnectionReset,
    UnexpectedEof,
    StreamClosed,
    Other,
}

/// Subset of gRPC status codes surfaced by the streaming read service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

/// Standard rowstream result alias.
pub type Result<T> = std::result::Result<T, RowStreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wraps_and_root_unwraps() {
        let err = RowStreamError::Cancelled
            .context("tabledata.list")
            .context("fetch page");
        assert!(err.is_cancelled());
        assert_eq!(err.root(), &RowStreamError::Cancelled);
        assert_eq!(
            err.to_string(),
            "fetch page: tabledata.list: operation cancelled"
        );
    }

    #[test]
    fn api_error_display_includes_reason() {
        let err = RowStreamError::Api(ApiError {
            code: 503,
            reason: Some("backendError".to_string()),
            message: "try again".to_string(),
        });
        assert_eq!(err.to_string(), "api error 503 (backendError): try again");
    }
}
