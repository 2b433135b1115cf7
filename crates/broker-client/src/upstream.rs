//! Upstream record-server client contract and the breaker/timeout wrapper
//! the Fan-out Executor actually calls.

use async_trait::async_trait;
use broker_model::{ShardEndpoint, ShardSearchResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::breaker::BreakerRegistry;
use crate::error::ClientError;

/// Explicit context carried alongside a sub-query, replacing the
/// reflection-based "set unsupported params via reflection" trick the
/// design notes call out for removal.
#[derive(Clone, Debug, Default)]
pub struct SubQueryContext {
    pub only_ids: bool,
    pub is_includes_operation: bool,
}

/// One outbound sub-query to a single shard
#[derive(Clone, Debug)]
pub struct SubQuery {
    pub resource_type: Option<String>,
    pub params: Vec<(String, String)>,
    pub shard_cursor_token: Option<String>,
    pub page_size: u32,
    pub sort: Vec<(String, bool)>, // (param, descending)
    pub unsupported_params: Vec<(String, String)>,
    pub context: SubQueryContext,
}

impl SubQuery {
    #[must_use]
    pub fn new(resource_type: Option<String>, page_size: u32) -> Self {
        Self {
            resource_type,
            params: Vec::new(),
            shard_cursor_token: None,
            page_size,
            sort: Vec::new(),
            unsupported_params: Vec::new(),
            context: SubQueryContext::default(),
        }
    }
}

/// `Search(shard, subRequest, ctx) → ShardSearchResult`
///
/// Implementations perform the actual network round trip; they never see
/// the circuit breaker or the timeout, both applied by `GuardedClient`.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn search(
        &self,
        shard: &ShardEndpoint,
        sub_query: &SubQuery,
    ) -> Result<ShardSearchResult, ClientError>;
}

/// Wraps an `UpstreamClient` with the per-shard circuit breaker and the
/// per-query timeout, and never returns `Err`: every outcome — success,
/// breaker-open, timeout, transport or protocol failure — becomes a
/// `ShardSearchResult`, matching the contract that failures are surfaced
/// *inside* the shard result rather than propagated.
pub struct GuardedClient {
    inner: Arc<dyn UpstreamClient>,
    breakers: Arc<BreakerRegistry>,
}

impl GuardedClient {
    #[must_use]
    pub fn new(inner: Arc<dyn UpstreamClient>, breakers: Arc<BreakerRegistry>) -> Self {
        Self { inner, breakers }
    }

    pub async fn search(
        &self,
        shard: &ShardEndpoint,
        sub_query: &SubQuery,
        timeout: Duration,
    ) -> ShardSearchResult {
        if !self.breakers.should_attempt(&shard.id) {
            debug!(shard = %shard.id, "circuit open, short-circuiting");
            let err = ClientError::CircuitOpen(shard.id.clone());
            return failure_result(shard, &err);
        }

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(timeout, self.inner.search(shard, sub_query)).await;

        let result = match outcome {
            Ok(Ok(mut result)) => {
                self.breakers.record_success(&shard.id);
                result.response = started.elapsed();
                result
            }
            Ok(Err(err)) => {
                warn!(shard = %shard.id, error = %err, "upstream call failed");
                if err.counts_as_breaker_failure() {
                    self.breakers.record_failure(&shard.id);
                }
                failure_result(shard, &err)
            }
            Err(_) => {
                let err = ClientError::Timeout(timeout);
                warn!(shard = %shard.id, "upstream call timed out after {:?}", timeout);
                self.breakers.record_failure(&shard.id);
                failure_result(shard, &err)
            }
        };

        #[cfg(feature = "metrics")]
        {
            metrics::histogram!("broker_shard_latency_ms", "shard" => shard.id.clone())
                .record(started.elapsed().as_millis() as f64);
        }

        result
    }
}

fn failure_result(shard: &ShardEndpoint, err: &ClientError) -> ShardSearchResult {
    ShardSearchResult::failure(shard.id.clone(), shard.base_url.clone(), err.status_code(), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_model::ShardEndpoint;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyClient {
        failures_remaining: AtomicU32,
    }

    #[async_trait]
    impl UpstreamClient for FlakyClient {
        async fn search(&self, shard: &ShardEndpoint, _: &SubQuery) -> Result<ShardSearchResult, ClientError> {
            if self.failures_remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(ClientError::Transport("connection reset".into()))
            } else {
                Ok(ShardSearchResult {
                    shard_id: shard.id.clone(),
                    shard_base_url: shard.base_url.clone(),
                    success: true,
                    status_code: 200,
                    error_message: None,
                    response: std::time::Duration::ZERO,
                    entries: Vec::new(),
                    continuation_token: None,
                    unsupported_params: Vec::new(),
                    total_count: None,
                })
            }
        }
    }

    #[tokio::test]
    async fn opens_breaker_after_threshold_then_short_circuits() {
        let breakers = Arc::new(BreakerRegistry::new(2, Duration::from_secs(30)));
        let client = GuardedClient::new(
            Arc::new(FlakyClient { failures_remaining: AtomicU32::new(10) }),
            breakers,
        );
        let shard = ShardEndpoint::new("A", "http://a.example");
        let sub_query = SubQuery::new(Some("Patient".into()), 10);

        let r1 = client.search(&shard, &sub_query, Duration::from_secs(1)).await;
        assert!(!r1.success);
        let r2 = client.search(&shard, &sub_query, Duration::from_secs(1)).await;
        assert!(!r2.success);

        // breaker should now be open; third call never reaches FlakyClient
        let r3 = client.search(&shard, &sub_query, Duration::from_secs(1)).await;
        assert!(!r3.success);
        assert_eq!(r3.status_code, 503);
    }
}
