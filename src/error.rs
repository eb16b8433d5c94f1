//! Error taxonomy shared by every pipeline stage.

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

/// Convenience alias used throughout the library.
pub type Result<T, E = RagError> = std::result::Result<T, E>;

/// Failures surfaced by the store, index, provider clients and orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RagError {
    /// Unknown document or chunk identifier.
    #[error("not found: {0}")]
    NotFound(String),
    /// Malformed request or text beyond a hard size limit.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Vector length disagrees with the partition's dimensionality.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimensionality configured for the partition.
        expected: usize,
        /// Length of the offending vector.
        actual: usize,
    },
    /// Provider hiccup (timeout, connection reset, 429, 5xx); retried locally.
    #[error("upstream temporarily unavailable: {0}")]
    TransientUnavailable(String),
    /// Provider call failed for good, retries included.
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),
    /// Vector retrieval failed while answering a query.
    #[error("retrieval failure: {0}")]
    RetrievalFailure(String),
    /// The owning request was aborted.
    #[error("request cancelled")]
    Cancelled,
    /// Database or storage-layer failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl RagError {
    /// Whether the retry decorator should attempt the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientUnavailable(_))
    }

    /// HTTP status equivalent for the error kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::DimensionMismatch { .. } | Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::TransientUnavailable(_) | Self::RetrievalFailure(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            // 499 is nginx's "client closed request"; axum has no constant for it.
            Self::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Retry hint attached to 502/503 responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::TransientUnavailable(_) | Self::UpstreamFailure(_) | Self::RetrievalFailure(_) => {
                Some(Duration::from_secs(RETRY_AFTER_SECS))
            }
            _ => None,
        }
    }

    /// Short machine-readable label used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::TransientUnavailable(_) => "transient_unavailable",
            Self::UpstreamFailure(_) => "upstream_failure",
            Self::RetrievalFailure(_) => "retrieval_failure",
            Self::Cancelled => "cancelled",
            Self::Storage(_) => "storage",
        }
    }

    /// Escalates a transient error into a terminal upstream failure.
    pub fn into_upstream(self) -> Self {
        match self {
            Self::TransientUnavailable(msg) => Self::UpstreamFailure(msg),
            other => other,
        }
    }
}

const RETRY_AFTER_SECS: u64 = 5;

impl From<tokio_postgres::Error> for RagError {
    fn from(err: tokio_postgres::Error) -> Self {
        RagError::Storage(err.to_string())
    }
}

/// Classifies a reqwest transport error.
pub(crate) fn classify_transport(err: &reqwest::Error) -> RagError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RagError::TransientUnavailable(err.to_string())
    } else {
        RagError::UpstreamFailure(err.to_string())
    }
}

/// Classifies a non-success provider HTTP status.
pub(crate) fn classify_status(provider: &str, status: reqwest::StatusCode, body: &str) -> RagError {
    let message = format!("{provider} request failed ({status}): {body}");
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        RagError::TransientUnavailable(message)
    } else {
        RagError::UpstreamFailure(message)
    }
}
