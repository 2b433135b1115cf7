//! Error taxonomy for the search broker
//!
//! This module defines the kinds of failure the engine can surface, per
//! the request-lifecycle error policy: most upstream failures live inside
//! a `ShardSearchResult` and never reach here, so the variants below are
//! the ones that are fatal for the whole request.

use thiserror::Error;

/// Broker-wide result type
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Fatal error kinds for a single search request
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("request too costly: {0}")]
    RequestTooCostly(String),

    #[error("backpressure: {in_flight} in-flight searches at limit {limit}")]
    Backpressure { in_flight: usize, limit: usize },

    #[error("continuation token expired")]
    ContinuationExpired,

    #[error("continuation token malformed: {0}")]
    ContinuationMalformed(String),

    #[error("all {shard_count} shards unavailable")]
    UpstreamUnavailable { shard_count: usize },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl BrokerError {
    #[must_use]
    pub fn request_too_costly(msg: impl Into<String>) -> Self {
        Self::RequestTooCostly(msg.into())
    }

    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable error kind tag, for metrics labels and client-facing codes
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestTooCostly(_) => "REQUEST_TOO_COSTLY",
            Self::Backpressure { .. } => "BACKPRESSURE",
            Self::ContinuationExpired => "CONTINUATION_EXPIRED",
            Self::ContinuationMalformed(_) => "CONTINUATION_MALFORMED",
            Self::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a client could reasonably retry the same request unmodified
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backpressure { .. } | Self::UpstreamUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_match_spec_names() {
        assert_eq!(BrokerError::ContinuationExpired.kind(), "CONTINUATION_EXPIRED");
        assert_eq!(
            BrokerError::UpstreamUnavailable { shard_count: 3 }.kind(),
            "UPSTREAM_UNAVAILABLE"
        );
    }

    #[test]
    fn backpressure_is_retryable_but_policy_errors_are_not() {
        assert!(BrokerError::Backpressure { in_flight: 4, limit: 4 }.is_retryable());
        assert!(!BrokerError::request_too_costly("chain depth").is_retryable());
    }
}
