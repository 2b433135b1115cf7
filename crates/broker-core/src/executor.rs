//! Fan-out Executor (spec.md §4.5)
//!
//! Drives the chosen `Strategy` across the enabled shard set. `PARALLEL`
//! dispatches every shard concurrently and waits for all; `SEQUENTIAL`
//! queries shards one at a time in priority order until the fill-factor
//! threshold is met, leaving the rest untouched. Grounded on the
//! teacher's `scatter_gather.rs::query_shards` for the parallel fan-out
//! shape, generalized with a priority-ordered early-stop path the
//! teacher's own store (whole-cluster reads only) never needed.

use broker_client::{GuardedClient, SubQuery, SubQueryContext};
use broker_model::{DistributedContinuationToken, ShardCursor, ShardEndpoint, ShardSearchResult};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const MAX_CONCURRENT_SHARD_QUERIES: usize = 32;

/// The per-shard sub-query shape shared across every shard in one fan-out,
/// varying only in cursor token.
#[derive(Clone, Debug)]
pub struct SubQueryTemplate {
    pub resource_type: Option<String>,
    pub params: Vec<(String, String)>,
    pub sort: Vec<(String, bool)>,
    pub unsupported_params: Vec<(String, String)>,
    pub page_size: u32,
    pub context: SubQueryContext,
}

impl SubQueryTemplate {
    fn build(&self, cursor: Option<String>) -> SubQuery {
        SubQuery {
            resource_type: self.resource_type.clone(),
            params: self.params.clone(),
            shard_cursor_token: cursor,
            page_size: self.page_size,
            sort: self.sort.clone(),
            unsupported_params: self.unsupported_params.clone(),
            context: self.context.clone(),
        }
    }
}

/// Results from queried shards, plus cursors for shards a `SEQUENTIAL`
/// fan-out chose not to query this round — carried forward verbatim so
/// the Aggregator's token still offers them on the next page.
pub struct ExecutionOutcome {
    pub results: Vec<ShardSearchResult>,
    pub carried_over: Vec<ShardCursor>,
    /// The cursor token actually presented to each queried shard this
    /// round (`None` for a fresh/first query), keyed by shard id. The
    /// Aggregator needs this to synthesize a correct absolute resume
    /// offset when its own page-size truncation cuts into a shard that
    /// reported itself exhausted.
    pub queried_cursors: HashMap<String, Option<String>>,
}

pub struct FanOutExecutor {
    client: Arc<GuardedClient>,
}

impl FanOutExecutor {
    #[must_use]
    pub fn new(client: Arc<GuardedClient>) -> Self {
        Self { client }
    }

    pub async fn parallel(
        &self,
        shards: &[ShardEndpoint],
        template: &SubQueryTemplate,
        token: Option<&DistributedContinuationToken>,
        default_timeout: Duration,
    ) -> ExecutionOutcome {
        let enabled: Vec<&ShardEndpoint> = shards.iter().filter(|s| s.enabled).collect();
        let mut futures = Vec::with_capacity(enabled.len());
        let mut queried_cursors = HashMap::with_capacity(enabled.len());
        for shard in enabled {
            let cursor = token.and_then(|t| t.cursor_for(&shard.id)).and_then(|c| c.token.clone());
            queried_cursors.insert(shard.id.clone(), cursor.clone());
            let sub_query = template.build(cursor);
            let shard = shard.clone();
            let client = self.client.clone();
            let timeout = shard.effective_timeout(default_timeout);
            futures.push(async move { client.search(&shard, &sub_query, timeout).await });
        }
        let results = stream::iter(futures).buffer_unordered(MAX_CONCURRENT_SHARD_QUERIES).collect().await;
        ExecutionOutcome { results, carried_over: Vec::new(), queried_cursors }
    }

    pub async fn sequential(
        &self,
        shards: &[ShardEndpoint],
        template: &SubQueryTemplate,
        token: Option<&DistributedContinuationToken>,
        default_timeout: Duration,
        fill_factor: f64,
    ) -> ExecutionOutcome {
        let mut ordered: Vec<&ShardEndpoint> = shards.iter().filter(|s| s.enabled).collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let start_index = token.map_or(0, |t| {
            ordered
                .iter()
                .position(|s| t.cursor_for(&s.id).is_none_or(|c| !c.exhausted))
                .unwrap_or(ordered.len())
        });

        let threshold = ((f64::from(template.page_size) * fill_factor).ceil() as usize).max(1);
        let mut results = Vec::new();
        let mut queried_cursors = HashMap::new();
        let mut accumulated = 0usize;
        let mut stopped_at = ordered.len();

        for (i, shard) in ordered.iter().enumerate().skip(start_index) {
            let cursor = token.and_then(|t| t.cursor_for(&shard.id)).and_then(|c| c.token.clone());
            queried_cursors.insert(shard.id.clone(), cursor.clone());
            let sub_query = template.build(cursor);
            let timeout = shard.effective_timeout(default_timeout);
            let result = self.client.search(shard, &sub_query, timeout).await;
            accumulated += result.entries.len();
            results.push(result);
            if accumulated >= threshold {
                stopped_at = i + 1;
                break;
            }
        }

        let mut carried_over = Vec::new();
        for shard in ordered.iter().skip(stopped_at) {
            let cursor = match token.and_then(|t| t.cursor_for(&shard.id)) {
                Some(prior) if prior.exhausted => continue,
                Some(prior) => prior.clone(),
                None => ShardCursor { id: shard.id.clone(), token: None, exhausted: false, results_returned: 0, last_sort_value: None },
            };
            carried_over.push(cursor);
        }

        ExecutionOutcome { results, carried_over, queried_cursors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_client::{BreakerRegistry, ClientError, UpstreamClient};
    use broker_model::{MatchMode, PayloadFormat, ResultEntry, Strategy};
    use std::collections::HashMap;

    /// Test double whose per-shard record count is fixed up front, so
    /// `SEQUENTIAL`'s early-stop behavior can be asserted deterministically.
    struct ShardStubClient {
        counts: HashMap<String, usize>,
    }

    #[async_trait]
    impl UpstreamClient for ShardStubClient {
        async fn search(&self, shard: &ShardEndpoint, sub_query: &SubQuery) -> Result<ShardSearchResult, ClientError> {
            let total = *self.counts.get(&shard.id).unwrap_or(&0);
            let n = total.min(sub_query.page_size as usize);
            let entries = (0..n)
                .map(|i| ResultEntry {
                    resource_type_name: "Patient".into(),
                    resource_id: format!("{}-{i}", shard.id),
                    version_id: None,
                    last_modified: None,
                    raw_payload: bytes::Bytes::new(),
                    payload_format: PayloadFormat::Json,
                    source_shard_url: shard.base_url.clone(),
                    match_mode: MatchMode::Match,
                })
                .collect();
            Ok(ShardSearchResult {
                shard_id: shard.id.clone(),
                shard_base_url: shard.base_url.clone(),
                success: true,
                status_code: 200,
                error_message: None,
                response: Duration::ZERO,
                entries,
                continuation_token: None,
                unsupported_params: Vec::new(),
                total_count: Some(total as u64),
            })
        }
    }

    fn template(page_size: u32) -> SubQueryTemplate {
        SubQueryTemplate {
            resource_type: Some("Patient".into()),
            params: Vec::new(),
            sort: Vec::new(),
            unsupported_params: Vec::new(),
            page_size,
            context: SubQueryContext::default(),
        }
    }

    fn executor_with(records_per_shard: Vec<(&str, usize)>) -> (FanOutExecutor, Vec<ShardEndpoint>) {
        let mut counts = HashMap::new();
        let mut shards = Vec::new();
        let mut priority = 10;
        for (shard_id, count) in records_per_shard {
            counts.insert(shard_id.to_string(), count);
            shards.push(ShardEndpoint::new(shard_id, format!("http://{shard_id}.example")).with_priority(priority));
            priority -= 1;
        }
        let breakers = Arc::new(BreakerRegistry::new(3, Duration::from_secs(30)));
        let client = Arc::new(GuardedClient::new(Arc::new(ShardStubClient { counts }), breakers));
        (FanOutExecutor::new(client), shards)
    }

    #[tokio::test]
    async fn parallel_queries_every_enabled_shard() {
        let (executor, shards) = executor_with(vec![("A", 3), ("B", 2)]);
        let outcome = executor.parallel(&shards, &template(50), None, Duration::from_secs(5)).await;
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.carried_over.is_empty());
        assert!(outcome.results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn sequential_stops_once_fill_factor_met_and_preserves_cursors() {
        let (executor, shards) = executor_with(vec![("A", 30), ("B", 10), ("C", 10)]);
        let outcome = executor
            .sequential(&shards, &template(50), None, Duration::from_secs(5), 0.5)
            .await;

        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].shard_id, "A");
        let carried_ids: Vec<&str> = outcome.carried_over.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(carried_ids, vec!["B", "C"]);
        assert!(outcome.carried_over.iter().all(|c| !c.exhausted && c.token.is_none()));
    }

    #[tokio::test]
    async fn sequential_resumes_from_first_non_exhausted_shard() {
        let (executor, shards) = executor_with(vec![("A", 5), ("B", 30)]);
        let token = DistributedContinuationToken {
            version: 1,
            page_size: 50,
            sort_criteria: None,
            strategy: Strategy::Sequential,
            created_at: chrono::Utc::now(),
            last_sort_values: std::collections::HashMap::new(),
            shards: vec![ShardCursor { id: "A".into(), token: None, exhausted: true, results_returned: 5, last_sort_value: None }],
        };
        let outcome = executor
            .sequential(&shards, &template(50), Some(&token), Duration::from_secs(5), 0.5)
            .await;
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].shard_id, "B");
    }
}
