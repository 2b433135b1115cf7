//! `SearchEngine` — the facade wiring every component behind one
//! `Search` operation (spec.md §6) and the request lifecycle state
//! machine (spec.md §4.9). Grounded on the teacher's `s3::AppState` /
//! `ScatterGatherEngine` (`bin/objectio-gateway/src/scatter_gather.rs`):
//! one struct owning the shard set and the shared upstream client,
//! built once at startup and handed to every request.

use broker_client::{BreakerRegistry, BreakerSnapshot, GuardedClient, SubQueryContext, UpstreamClient};
use broker_model::{
    BrokerConfig, BrokerError, Expression, Result, SearchOptions, SearchRequest, ShardEndpoint, SortDirection, VersionRequirement, Warning,
};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::aggregator::{Aggregator, AggregatedResult};
use crate::chain::ChainResolver;
use crate::executor::{ExecutionOutcome, FanOutExecutor, SubQueryTemplate};
use crate::extractor::extract;
use crate::gate::ProtectionGate;
use crate::include::{IncludeDirective, IncludeResolver};
use crate::strategy::StrategyAnalyzer;

pub struct SearchEngine {
    config: BrokerConfig,
    gate: ProtectionGate,
    strategy: StrategyAnalyzer,
    chain: ChainResolver,
    include: IncludeResolver,
    executor: FanOutExecutor,
    breakers: Arc<BreakerRegistry>,
    shards: RwLock<Vec<ShardEndpoint>>,
}

impl SearchEngine {
    #[must_use]
    pub fn new(config: BrokerConfig, shards: Vec<ShardEndpoint>, upstream: Arc<dyn UpstreamClient>) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(
            config.circuit_breaker.failure_threshold,
            config.circuit_breaker.open_duration(),
        ));
        let client = Arc::new(GuardedClient::new(upstream, breakers.clone()));
        let gate = ProtectionGate::new(&config);
        let strategy = StrategyAnalyzer::new(config.strategy.parallel_threshold, config.strategy.sequential_threshold);
        let chain = ChainResolver::new(
            client.clone(),
            config.resolution.chained_search_resolution,
            config.timeouts.chain_timeout(),
            config.limits.max_chain_depth,
            config.limits.max_distributed_reference_ids,
        );
        let include = IncludeResolver::new(
            client.clone(),
            config.resolution.include_resolution,
            config.timeouts.include_timeout(),
            config.limits.distributed_batch_size,
            config.resolution.include_iteration_cap,
            config.limits.max_included_resources_in_bundle,
        );
        let executor = FanOutExecutor::new(client);
        Self { config, gate, strategy, chain, include, executor, breakers, shards: RwLock::new(shards) }
    }

    /// Swap the enabled shard set. In-flight requests keep the snapshot
    /// they read at admission; only requests admitted after this call
    /// see the new topology.
    pub fn set_shards(&self, shards: Vec<ShardEndpoint>) {
        *self.shards.write() = shards;
    }

    #[must_use]
    pub fn breaker_snapshot(&self, shard_id: &str) -> BreakerSnapshot {
        self.breakers.snapshot(shard_id)
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    /// `Search(resourceType?, params, ctx, options) → Result{entries, continuationToken?, unsupportedParams, totalCount?}`
    ///
    /// # Errors
    /// Any `BrokerError` raised by admission, chain-depth/timeout policy,
    /// a malformed/expired continuation token, or total upstream failure.
    pub async fn search(&self, request: SearchRequest, options: &SearchOptions) -> Result<AggregatedResult> {
        let _token = self.gate.admit(&request)?;
        self.run(request, options).await
    }

    /// Compartment search is out of scope (spec.md §1 Non-goals); fails
    /// fast without touching admission, so it never counts against the
    /// concurrency limit.
    pub fn search_compartment(&self) -> Result<AggregatedResult> {
        Err(BrokerError::Unsupported("compartment search is not supported".into()))
    }

    /// History search is out of scope (spec.md §1 Non-goals).
    pub fn search_history(&self) -> Result<AggregatedResult> {
        Err(BrokerError::Unsupported("history search is not supported".into()))
    }

    /// Reindex is out of scope (spec.md §1 Non-goals).
    pub fn reindex(&self) -> Result<()> {
        Err(BrokerError::Unsupported("reindex is not supported".into()))
    }

    async fn run(&self, request: SearchRequest, options: &SearchOptions) -> Result<AggregatedResult> {
        if request.version_requirement != VersionRequirement::Latest {
            return Err(BrokerError::request_too_costly("only LATEST version requirement is supported"));
        }

        let now = chrono::Utc::now();
        let incoming_token = request
            .continuation_token
            .as_deref()
            .map(|s| broker_model::DistributedContinuationToken::decode(s, self.config.timeouts.token_ttl(), now))
            .transpose()?;

        let shards = self.shards.read().clone();
        let strategy = self.strategy.analyze(&request);

        let mut warnings: Vec<Warning> = Vec::new();

        // RESOLVING_CHAINS
        let resolved_expr = match &request.expression {
            Some(expr) => {
                let resolution = self.chain.resolve(expr, &shards).await?;
                warnings.extend(resolution.warnings);
                if !resolution.satisfiable {
                    return Ok(empty_result(&request, strategy, warnings, now));
                }
                Some(resolution.expression)
            }
            None => None,
        };

        let directives = resolved_expr.as_ref().map(collect_include_directives).unwrap_or_default();

        // EXECUTING
        let template = build_template(&request, resolved_expr.as_ref(), options);
        let outcome: ExecutionOutcome = match strategy {
            broker_model::Strategy::Parallel => {
                self.executor.parallel(&shards, &template, incoming_token.as_ref(), self.config.timeouts.query_timeout()).await
            }
            broker_model::Strategy::Sequential => {
                self.executor
                    .sequential(&shards, &template, incoming_token.as_ref(), self.config.timeouts.query_timeout(), self.config.strategy.fill_factor)
                    .await
            }
        };

        if !outcome.results.is_empty() && outcome.results.iter().all(|r| !r.success) {
            return Err(BrokerError::UpstreamUnavailable { shard_count: outcome.results.len() });
        }

        // AGGREGATING (main entries only — includes are appended after)
        let mut main_page =
            Aggregator::aggregate(&request, strategy, &outcome.results, &outcome.carried_over, Vec::new(), warnings, &outcome.queried_cursors, now);

        // RESOLVING_INCLUDES
        if !directives.is_empty() {
            let include_resolution = self.include.resolve(&main_page.entries, &directives, &shards).await;
            main_page.warnings.extend(include_resolution.warnings);
            main_page.entries.extend(include_resolution.entries);
        }

        Ok(main_page)
    }
}

fn collect_include_directives(expr: &Expression) -> Vec<IncludeDirective> {
    let mut out = Vec::new();
    expr.walk(&mut |node| {
        if let Some(directive) = IncludeDirective::from_expression(node) {
            out.push(directive);
        }
    });
    out
}

fn build_template(request: &SearchRequest, resolved_expr: Option<&Expression>, options: &SearchOptions) -> SubQueryTemplate {
    let extracted = resolved_expr.map_or_else(
        || crate::extractor::Extracted { params: Vec::new(), system_scope_types: Vec::new() },
        |expr| extract(expr, request.resource_type.as_deref()),
    );
    SubQueryTemplate {
        resource_type: request.resource_type.clone(),
        params: extracted.params,
        sort: request.sort.iter().map(|k| (k.param.clone(), k.direction == SortDirection::Desc)).collect(),
        unsupported_params: request.unsupported_params.clone(),
        page_size: request.max_item_count,
        context: SubQueryContext { only_ids: request.only_ids || options.only_ids, is_includes_operation: options.is_includes_operation },
    }
}

fn empty_result(request: &SearchRequest, strategy: broker_model::Strategy, warnings: Vec<Warning>, now: chrono::DateTime<chrono::Utc>) -> AggregatedResult {
    Aggregator::aggregate(request, strategy, &[], &[], Vec::new(), warnings, &std::collections::HashMap::new(), now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_client::{ClientError, FakeRecord, InMemoryUpstreamClient, SubQuery};
    use broker_model::{Expression, ShardSearchResult};
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    fn config() -> BrokerConfig {
        let mut cfg = BrokerConfig::default();
        cfg.limits.max_concurrent_searches = 8;
        cfg
    }

    #[tokio::test]
    async fn two_shard_union_stamps_sources_with_no_cross_shard_dedup() {
        let records = vec![
            FakeRecord::new("Patient", "p1").with_field("name", "John"),
            FakeRecord::new("Patient", "p2").with_field("name", "John"),
        ];
        let fake = InMemoryUpstreamClient::open(records);
        let engine = SearchEngine::new(
            config(),
            vec![ShardEndpoint::new("A", "http://a.example"), ShardEndpoint::new("B", "http://b.example")],
            fake,
        );
        let request = SearchRequest::new(Some("Patient".into()))
            .with_expression(Expression::string_eq("name", "John"))
            .with_max_item_count(10);
        let result = engine.search(request, &SearchOptions::default()).await.unwrap();
        // Both shards answer from the same fake dataset here; the broker
        // never dedups across shards, so both copies of p1/p2 come back.
        assert_eq!(result.entries.len(), 4);
        assert!(result.entries.iter().all(|e| e.source_shard_url == "http://a.example" || e.source_shard_url == "http://b.example"));
        assert!(result.continuation_token.is_none());
    }

    #[tokio::test]
    async fn compartment_search_fails_fast_without_touching_gate() {
        let fake = InMemoryUpstreamClient::open(Vec::new());
        let engine = SearchEngine::new(config(), vec![ShardEndpoint::new("A", "http://a.example")], fake);
        let err = engine.search_compartment().unwrap_err();
        assert_eq!(err.kind(), "UNSUPPORTED");
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test]
    async fn all_shards_failing_is_upstream_unavailable() {
        struct AlwaysFails;
        #[async_trait]
        impl UpstreamClient for AlwaysFails {
            async fn search(&self, _shard: &ShardEndpoint, _sub_query: &SubQuery) -> std::result::Result<ShardSearchResult, ClientError> {
                Err(ClientError::Transport("refused".into()))
            }
        }
        let engine = SearchEngine::new(config(), vec![ShardEndpoint::new("A", "http://a.example")], StdArc::new(AlwaysFails));
        let request = SearchRequest::new(Some("Patient".into())).with_max_item_count(10);
        let err = engine.search(request, &SearchOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), "UPSTREAM_UNAVAILABLE");
    }

    #[tokio::test]
    async fn empty_shard_set_returns_empty_result_with_no_token() {
        let fake = InMemoryUpstreamClient::open(Vec::new());
        let engine = SearchEngine::new(config(), Vec::new(), fake);
        let request = SearchRequest::new(Some("Patient".into())).with_max_item_count(10);
        let result = engine.search(request, &SearchOptions::default()).await.unwrap();
        assert!(result.entries.is_empty());
        assert!(result.continuation_token.is_none());
    }

    #[tokio::test]
    async fn chain_resolving_to_empty_union_yields_empty_result() {
        let fake = InMemoryUpstreamClient::open(vec![FakeRecord::new("Patient", "p1").with_field("name", "Amy")]);
        let engine = SearchEngine::new(config(), vec![ShardEndpoint::new("A", "http://a.example")], fake);
        let chain = Expression::Chained {
            resource_types: vec!["DiagnosticReport".into()],
            ref_param: "subject".into(),
            target_types: vec!["Patient".into()],
            reversed: false,
            child: StdArc::new(Expression::string_eq("name", "Nobody")),
        };
        let request = SearchRequest::new(Some("DiagnosticReport".into())).with_expression(chain).with_max_item_count(10);
        let result = engine.search(request, &SearchOptions::default()).await.unwrap();
        assert!(result.entries.is_empty());
    }
}
