//! Chain Resolver (spec.md §4.3)
//!
//! Rewrites `ref:Target.param = V` into `SearchParam(ref, OR-of id-equals)`
//! by pre-querying every enabled shard for the inner predicate, recursing
//! innermost-first so a nested chain resolves before the chain that
//! contains it. Grounded on the teacher's `query_shards` fan-out
//! (`bin/objectio-gateway/src/scatter_gather.rs`): a `futures::stream`
//! over one future per shard, `buffer_unordered` for bounded concurrency,
//! partial failure tolerated as long as one shard answers.

use broker_client::{GuardedClient, SubQuery};
use broker_model::{BrokerError, Expression, ResolutionMode, Result, ShardEndpoint, Warning};
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::extractor::extract;

const MAX_CONCURRENT_CHAIN_QUERIES: usize = 32;

/// Outcome of resolving one expression tree's chains
#[derive(Debug)]
pub struct ChainResolution {
    pub expression: Expression,
    pub warnings: Vec<Warning>,
    /// False once any chain in the tree resolved to an empty ID set —
    /// the whole request's result must be empty, with no further I/O.
    pub satisfiable: bool,
}

pub struct ChainResolver {
    client: Arc<GuardedClient>,
    mode: ResolutionMode,
    chain_timeout: Duration,
    max_depth: u32,
    max_reference_ids: usize,
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

impl ChainResolver {
    #[must_use]
    pub fn new(client: Arc<GuardedClient>, mode: ResolutionMode, chain_timeout: Duration, max_depth: u32, max_reference_ids: usize) -> Self {
        Self { client, mode, chain_timeout, max_depth, max_reference_ids }
    }

    pub async fn resolve(&self, expr: &Expression, shards: &[ShardEndpoint]) -> Result<ChainResolution> {
        self.resolve_at(expr, shards, 0).await
    }

    fn resolve_at<'a>(&'a self, expr: &'a Expression, shards: &'a [ShardEndpoint], depth: u32) -> BoxFut<'a, Result<ChainResolution>> {
        Box::pin(async move {
            match expr {
                Expression::SearchParam { name, child } => {
                    let inner = self.resolve_at(child, shards, depth).await?;
                    Ok(ChainResolution {
                        expression: Expression::SearchParam { name: name.clone(), child: Arc::new(inner.expression) },
                        warnings: inner.warnings,
                        satisfiable: inner.satisfiable,
                    })
                }
                Expression::Multiary { op, children } => {
                    let mut resolved_children = Vec::with_capacity(children.len());
                    let mut warnings = Vec::new();
                    let mut satisfiable = true;
                    for child in children {
                        let inner = self.resolve_at(child, shards, depth).await?;
                        satisfiable &= inner.satisfiable;
                        warnings.extend(inner.warnings);
                        resolved_children.push(inner.expression);
                    }
                    Ok(ChainResolution {
                        expression: Expression::Multiary { op: *op, children: resolved_children },
                        warnings,
                        satisfiable,
                    })
                }
                Expression::Chained { ref_param, target_types, child, .. } => {
                    if self.mode == ResolutionMode::Passthrough {
                        return Ok(ChainResolution { expression: expr.clone(), warnings: Vec::new(), satisfiable: true });
                    }
                    if depth >= self.max_depth {
                        return Err(BrokerError::request_too_costly(format!(
                            "chain depth exceeds cap {}",
                            self.max_depth
                        )));
                    }

                    // Innermost-first: resolve the child (which may itself
                    // contain a Chained node) before using it as this
                    // level's sub-search predicate.
                    let child_resolution = self.resolve_at(child, shards, depth + 1).await?;
                    if !child_resolution.satisfiable {
                        return Ok(ChainResolution { expression: expr.clone(), warnings: child_resolution.warnings, satisfiable: false });
                    }

                    let fan_out = self.resolve_single_level(&child_resolution.expression, target_types, shards);
                    let (ids, mut warnings) = tokio::time::timeout(self.chain_timeout, fan_out)
                        .await
                        .map_err(|_| BrokerError::request_too_costly("chain resolution timed out"))?;
                    warnings.extend(child_resolution.warnings);

                    if ids.is_empty() {
                        // "mark the outer predicate unsatisfiable (return
                        // original expression; caller returns empty result)"
                        return Ok(ChainResolution { expression: expr.clone(), warnings, satisfiable: false });
                    }

                    let requested = ids.len();
                    let (ids, truncated) = truncate_ids(ids, self.max_reference_ids);
                    if truncated {
                        warnings.push(Warning::ChainReferencesTruncated { requested, kept: ids.len() });
                    }

                    let or_of_ids = Expression::or(
                        ids.into_iter().map(|id| Expression::string_eq("id", id)).collect(),
                    );
                    let rewritten = Expression::SearchParam { name: ref_param.clone(), child: Arc::new(or_of_ids) };
                    Ok(ChainResolution { expression: rewritten, warnings, satisfiable: true })
                }
                Expression::String { .. } | Expression::Include { .. } => {
                    Ok(ChainResolution { expression: expr.clone(), warnings: Vec::new(), satisfiable: true })
                }
            }
        })
    }

    /// Step 3 of spec.md §4.3: for each target type, query every enabled
    /// shard in parallel and union the surviving IDs.
    async fn resolve_single_level(&self, predicate: &Expression, target_types: &[String], shards: &[ShardEndpoint]) -> (BTreeSet<String>, Vec<Warning>) {
        let enabled: Vec<&ShardEndpoint> = shards.iter().filter(|s| s.enabled).collect();
        let mut queries: Vec<BoxFut<'_, std::result::Result<(String, Vec<String>), (String, String)>>> = Vec::new();

        for target_type in target_types {
            let extracted = extract(predicate, Some(target_type));
            for shard in &enabled {
                let sub_query = {
                    let mut q = SubQuery::new(Some(target_type.clone()), self.max_reference_ids as u32);
                    q.params = extracted.params.clone();
                    q
                };
                let shard = (*shard).clone();
                let client = self.client.clone();
                let timeout = self.chain_timeout;
                queries.push(Box::pin(async move {
                    let result = client.search(&shard, &sub_query, timeout).await;
                    if result.success {
                        Ok((shard.id.clone(), result.entries.into_iter().map(|e| e.resource_id).collect()))
                    } else {
                        Err((shard.id.clone(), result.error_message.unwrap_or_default()))
                    }
                }));
            }
        }

        let results: Vec<_> = stream::iter(queries).buffer_unordered(MAX_CONCURRENT_CHAIN_QUERIES).collect().await;

        let mut ids = BTreeSet::new();
        let mut warnings = Vec::new();
        for result in results {
            match result {
                Ok((_, found)) => ids.extend(found),
                Err((shard_id, message)) => {
                    warn!(shard = %shard_id, error = %message, "chain sub-query failed");
                    warnings.push(Warning::ChainShardFailed { shard_id, message });
                }
            }
        }
        (ids, warnings)
    }
}

fn truncate_ids(ids: BTreeSet<String>, max: usize) -> (Vec<String>, bool) {
    if ids.len() <= max {
        (ids.into_iter().collect(), false)
    } else {
        (ids.into_iter().take(max).collect(), true)
    }
}
