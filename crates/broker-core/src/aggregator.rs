//! Aggregator (spec.md §4.8)
//!
//! Merges per-shard results into one page: stamps source URLs, unions
//! entries without cross-shard dedup, applies the request's global sort,
//! truncates to the page size, and serializes the distributed
//! continuation token. Grounded on the teacher's `k_way_merge` +
//! `ListContinuationToken` construction in `scatter_gather.rs`, widened
//! from a single sort key to the broker's ordered `sort` list and from a
//! single cursor to one `ShardCursor` per shard.

use broker_model::{
    DistributedContinuationToken, ResultEntry, SearchRequest, ShardCursor, ShardSearchResult, SortDirection, SortKey, Strategy, Warning,
};
use std::collections::HashMap;

#[derive(Debug)]
pub struct AggregatedResult {
    pub entries: Vec<ResultEntry>,
    pub continuation_token: Option<String>,
    pub unsupported_params: Vec<(String, String)>,
    pub total_count: Option<u64>,
    pub warnings: Vec<Warning>,
}

pub struct Aggregator;

impl Aggregator {
    /// `results` are the shards actually queried this request; `carried_over`
    /// are `SEQUENTIAL`'s unqueried-but-not-exhausted shard cursors, passed
    /// through into the new token verbatim. `extra_entries` are included
    /// resources (`_include`/`_revinclude`), appended after the main union
    /// with no dedup against it. `used_cursors` is the cursor token each
    /// queried shard was actually given this round (`None` for a fresh
    /// query), needed to compute a correct absolute resume offset when a
    /// shard that reports itself exhausted still has entries this page's
    /// truncation cut.
    #[must_use]
    pub fn aggregate(
        request: &SearchRequest,
        strategy: Strategy,
        results: &[ShardSearchResult],
        carried_over: &[ShardCursor],
        extra_entries: Vec<ResultEntry>,
        mut warnings: Vec<Warning>,
        used_cursors: &HashMap<String, Option<String>>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> AggregatedResult {
        let successful: Vec<&ShardSearchResult> = results.iter().filter(|r| r.success).collect();

        for r in results {
            if !r.success {
                warnings.push(Warning::ShardExcluded {
                    shard_id: r.shard_id.clone(),
                    message: r.error_message.clone().unwrap_or_default(),
                });
            }
        }

        let mut entries: Vec<ResultEntry> = Vec::new();
        for result in &successful {
            for mut entry in result.entries.clone() {
                entry.source_shard_url = result.shard_base_url.clone();
                entries.push(entry);
            }
        }

        if !request.sort.is_empty() {
            entries.sort_by(|a, b| compare_by_sort(a, b, &request.sort));
        }

        let page_size = request.max_item_count as usize;
        let truncated = entries.len() > page_size;
        entries.truncate(page_size);

        let unsupported_params = dedup_params(successful.iter().flat_map(|r| r.unsupported_params.iter().cloned()));

        let total_count = if results.is_empty() {
            None
        } else {
            results.iter().try_fold(0u64, |acc, r| r.total_count.map(|c| acc + c))
        };

        let token = Self::build_token(request, strategy, results, carried_over, &entries, truncated, used_cursors, now);

        // Included resources (`_include`/`_revinclude`) are appended after
        // the main page, never sorted or counted against its page size.
        entries.extend(extra_entries);

        AggregatedResult {
            entries,
            continuation_token: token.map(|t| t.encode().unwrap_or_default()),
            unsupported_params,
            total_count,
            warnings,
        }
    }

    fn build_token(
        request: &SearchRequest,
        strategy: Strategy,
        results: &[ShardSearchResult],
        carried_over: &[ShardCursor],
        emitted: &[ResultEntry],
        truncated: bool,
        used_cursors: &HashMap<String, Option<String>>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<DistributedContinuationToken> {
        let mut shards: Vec<ShardCursor> = results
            .iter()
            .filter_map(|r| {
                if !r.success {
                    // Failed shards carry no cursor information of their
                    // own; they are offered again untouched on the next page.
                    return Some(ShardCursor { id: r.shard_id.clone(), token: None, exhausted: false, results_returned: 0, last_sort_value: None });
                }
                if !r.exhausted() {
                    return Some(ShardCursor {
                        id: r.shard_id.clone(),
                        token: r.continuation_token.clone(),
                        exhausted: false,
                        results_returned: u32::try_from(r.entries.len()).unwrap_or(u32::MAX),
                        last_sort_value: None,
                    });
                }
                if !truncated {
                    return None;
                }
                // This shard reported itself exhausted (no token of its
                // own), but global page-size truncation still cut some of
                // its entries from this page. A bare `None` token paired
                // with `exhausted: false` would make the next page re-query
                // it from scratch and reproduce this page forever, so
                // synthesize an absolute offset into its own result set
                // past what was actually shown.
                let kept = emitted.iter().filter(|e| e.source_shard_url == r.shard_base_url).count();
                if kept >= r.entries.len() {
                    return None;
                }
                let prior_offset = used_cursors.get(&r.shard_id).and_then(|c| c.as_deref()).and_then(parse_offset).unwrap_or(0);
                Some(ShardCursor {
                    id: r.shard_id.clone(),
                    token: Some(format!("offset:{}", prior_offset + kept)),
                    exhausted: false,
                    results_returned: u32::try_from(kept).unwrap_or(u32::MAX),
                    last_sort_value: None,
                })
            })
            .collect();
        shards.extend(carried_over.iter().cloned());

        if shards.is_empty() {
            return None;
        }

        let last_sort_values = last_sort_values(emitted, &request.sort);

        Some(DistributedContinuationToken {
            version: broker_model::token::TOKEN_VERSION,
            page_size: request.max_item_count,
            sort_criteria: if request.sort.is_empty() { None } else { Some(request.sort.iter().map(SortKey::signed).collect::<Vec<_>>().join(",")) },
            strategy,
            created_at: now,
            last_sort_values,
            shards,
        })
    }
}

/// Parses the `offset:N` cursor convention shared with
/// `broker_client::InMemoryUpstreamClient` and any `UpstreamClient` impl
/// that follows the same absolute-position-into-the-matching-set scheme.
fn parse_offset(token: &str) -> Option<usize> {
    token.strip_prefix("offset:").and_then(|n| n.parse::<usize>().ok())
}

fn dedup_params(iter: impl Iterator<Item = (String, String)>) -> Vec<(String, String)> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for pair in iter {
        if seen.insert(pair.clone()) {
            out.push(pair);
        }
    }
    out
}

fn compare_by_sort(a: &ResultEntry, b: &ResultEntry, sort: &[SortKey]) -> std::cmp::Ordering {
    for key in sort {
        let av = sort_field_value(a, &key.param);
        let bv = sort_field_value(b, &key.param);
        let ord = compare_json(&av, &bv);
        let ord = match key.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        };
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

fn sort_field_value(entry: &ResultEntry, field: &str) -> Option<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_slice(&entry.raw_payload).ok()?;
    value.get(field).cloned()
}

fn compare_json(a: &Option<serde_json::Value>, b: &Option<serde_json::Value>) -> std::cmp::Ordering {
    match (a, b) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (Some(_), None) => std::cmp::Ordering::Less,
        (Some(x), Some(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(fx), Some(fy)) => fx.partial_cmp(&fy).unwrap_or(std::cmp::Ordering::Equal),
            _ => x.as_str().unwrap_or_default().cmp(y.as_str().unwrap_or_default()),
        },
    }
}

fn last_sort_values(emitted: &[ResultEntry], sort: &[SortKey]) -> HashMap<String, serde_json::Value> {
    let mut out = HashMap::new();
    let Some(last) = emitted.last() else {
        return out;
    };
    for key in sort {
        if let Some(v) = sort_field_value(last, &key.param) {
            out.insert(key.param.clone(), v);
        }
    }
    out
}
