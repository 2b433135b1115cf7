//! Per-shard upstream call outcomes
//!
//! These never propagate as the request's fatal error on their own — they
//! are captured inside a `ShardSearchResult` by the Fan-out Executor, and
//! only escalate to `BrokerError::UpstreamUnavailable` when every shard
//! in a fan-out fails.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum ClientError {
    #[error("circuit open for shard {0}")]
    CircuitOpen(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// HTTP-style status code surfaced on `ShardSearchResult::status_code`
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::CircuitOpen(_) => 503,
            Self::Timeout(_) => 408,
            Self::Transport(_) => 500,
            Self::Protocol(_) => 502,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen(_) => "UPSTREAM_CIRCUIT_OPEN",
            Self::Timeout(_) => "UPSTREAM_TIMEOUT",
            Self::Transport(_) => "UPSTREAM_TRANSPORT",
            Self::Protocol(_) => "UPSTREAM_PROTOCOL",
        }
    }

    /// Whether this outcome should count as a circuit-breaker failure.
    /// A short-circuited call never reached the network, so it must not
    /// be double-counted against the breaker that just rejected it.
    #[must_use]
    pub fn counts_as_breaker_failure(&self) -> bool {
        !matches!(self, Self::CircuitOpen(_))
    }
}
