//! Include Resolver (spec.md §4.4)
//!
//! Expands `_include`/`_revinclude` directives after the main query: walks
//! each returned record's raw payload for reference values, batches
//! `_id=` sub-queries per target type per shard, and feeds the included
//! set back through for `:iterate`, bounded by a hard cap. Grounded on
//! the same `scatter_gather.rs` fan-out shape as the Chain Resolver, with
//! a per-round scope filter (Open Question decision in SPEC_FULL.md §5).

use broker_client::{GuardedClient, SubQuery};
use broker_model::{Expression, MatchMode, ResolutionMode, ResultEntry, ShardEndpoint, Warning};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const MAX_CONCURRENT_INCLUDE_QUERIES: usize = 32;

/// One `_include`/`_revinclude` directive, extracted from the request's
/// expression tree once by the caller.
#[derive(Clone, Debug)]
pub struct IncludeDirective {
    pub ref_param: String,
    pub target_type: Option<String>,
    pub iterate: bool,
    pub wildcard: bool,
    pub allowed_scopes: Vec<String>,
}

impl IncludeDirective {
    #[must_use]
    pub fn from_expression(expr: &Expression) -> Option<Self> {
        match expr {
            Expression::Include { ref_param, target_type, iterate, wildcard, allowed_scopes, .. } => Some(Self {
                ref_param: ref_param.clone(),
                target_type: target_type.clone(),
                iterate: *iterate,
                wildcard: *wildcard,
                allowed_scopes: allowed_scopes.clone(),
            }),
            _ => None,
        }
    }
}

pub struct IncludeResolution {
    pub entries: Vec<ResultEntry>,
    pub warnings: Vec<Warning>,
}

pub struct IncludeResolver {
    client: Arc<GuardedClient>,
    mode: ResolutionMode,
    include_timeout: Duration,
    batch_size: usize,
    iteration_cap: u32,
    bundle_cap: usize,
}

impl IncludeResolver {
    #[must_use]
    pub fn new(client: Arc<GuardedClient>, mode: ResolutionMode, include_timeout: Duration, batch_size: usize, iteration_cap: u32, bundle_cap: usize) -> Self {
        Self { client, mode, include_timeout, batch_size, iteration_cap, bundle_cap }
    }

    /// Expand `directives` against `main_entries`. In `PASSTHROUGH` mode
    /// each shard already expanded its own includes into `main_entries`,
    /// so this is a no-op.
    pub async fn resolve(&self, main_entries: &[ResultEntry], directives: &[IncludeDirective], shards: &[ShardEndpoint]) -> IncludeResolution {
        if self.mode == ResolutionMode::Passthrough || directives.is_empty() {
            return IncludeResolution { entries: Vec::new(), warnings: Vec::new() };
        }

        let enabled: Vec<ShardEndpoint> = shards.iter().filter(|s| s.enabled).cloned().collect();
        let mut seen_ids: HashMap<String, HashSet<String>> = HashMap::new();
        let mut included: Vec<ResultEntry> = Vec::new();
        let mut warnings: Vec<Warning> = Vec::new();

        // Round 0 runs every directive; later rounds only the ones marked
        // `:iterate` feed back in, per spec.md §4.4 step 5.
        let iterating: Vec<IncludeDirective> = directives.iter().filter(|d| d.iterate).cloned().collect();
        let mut active: Vec<IncludeDirective> = directives.to_vec();
        let mut round_source: Vec<ResultEntry> = main_entries.to_vec();
        let mut round: u32 = 0;

        loop {
            let mut round_scoped: Vec<ResultEntry> = Vec::new();
            let mut any_fresh = false;

            // Each directive's scope filter must only ever see the entries
            // it itself produced, so references are extracted, fetched,
            // and scope-filtered one directive at a time rather than as a
            // single union over the whole round.
            for directive in &active {
                let references = extract_round_references(&round_source, std::slice::from_ref(directive));
                let fresh = dedup_against_seen(references, &mut seen_ids);
                if fresh.is_empty() {
                    continue;
                }
                any_fresh = true;

                let (fetched, round_warnings) = self.fetch_references(&fresh, &enabled).await;
                warnings.extend(round_warnings);

                round_scoped.extend(apply_scope_filter(fetched, directive));
            }

            if !any_fresh || round_scoped.is_empty() {
                break;
            }

            included.extend(round_scoped.iter().cloned());
            round_source = round_scoped;
            round += 1;

            if iterating.is_empty() {
                break;
            }
            if round >= self.iteration_cap {
                warnings.push(Warning::IncludeIterationCapped { cap: self.iteration_cap });
                break;
            }
            active = iterating.clone();
        }

        if included.len() > self.bundle_cap {
            included.truncate(self.bundle_cap);
            warnings.push(Warning::IncludeBundleTruncated { kept: self.bundle_cap });
        }

        IncludeResolution { entries: included, warnings }
    }

    async fn fetch_references(&self, by_type: &HashMap<String, Vec<String>>, shards: &[ShardEndpoint]) -> (Vec<ResultEntry>, Vec<Warning>) {
        let mut futures: Vec<BoxFut<'_, std::result::Result<Vec<ResultEntry>, (String, String)>>> = Vec::new();
        for (target_type, ids) in by_type {
            for chunk in ids.chunks(self.batch_size.max(1)) {
                let id_param = chunk.join(",");
                for shard in shards {
                    let mut sub_query = SubQuery::new(Some(target_type.clone()), u32::try_from(chunk.len()).unwrap_or(u32::MAX));
                    sub_query.params.push(("_id".into(), id_param.clone()));
                    let shard = shard.clone();
                    let client = self.client.clone();
                    let timeout = self.include_timeout;
                    futures.push(Box::pin(async move {
                        let result = client.search(&shard, &sub_query, timeout).await;
                        if result.success {
                            Ok(result.entries)
                        } else {
                            Err((shard.id, result.error_message.unwrap_or_default()))
                        }
                    }));
                }
            }
        }

        let results: Vec<_> = stream::iter(futures).buffer_unordered(MAX_CONCURRENT_INCLUDE_QUERIES).collect().await;
        let mut entries = Vec::new();
        let mut warnings = Vec::new();
        for result in results {
            match result {
                Ok(mut batch) => {
                    for entry in &mut batch {
                        entry.match_mode = MatchMode::Include;
                    }
                    entries.extend(batch);
                }
                Err((shard_id, message)) => {
                    warn!(shard = %shard_id, error = %message, "include sub-query failed");
                    warnings.push(Warning::ShardExcluded { shard_id, message });
                }
            }
        }
        (entries, warnings)
    }
}

/// Walk each source record's raw JSON payload for every directive's
/// reference field, grouped by resolved target type.
fn extract_round_references(source: &[ResultEntry], directives: &[IncludeDirective]) -> HashMap<String, Vec<String>> {
    let mut by_type: HashMap<String, Vec<String>> = HashMap::new();
    for entry in source {
        let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&entry.raw_payload) else {
            continue;
        };
        for directive in directives {
            for (ref_type, id) in find_references(&payload, &directive.ref_param) {
                if let Some(target) = ref_type.or_else(|| directive.target_type.clone()) {
                    if !directive.wildcard {
                        if let Some(want) = &directive.target_type {
                            if want != &target {
                                continue;
                            }
                        }
                    }
                    by_type.entry(target).or_default().push(id);
                }
            }
        }
    }
    by_type
}

/// Recursively search `value` for a field named `field_name` holding a
/// FHIR reference (`{"reference": "Type/id"}` or an array of such),
/// returning `(resourceType, id)` when the type can be determined.
fn find_references(value: &serde_json::Value, field_name: &str) -> Vec<(Option<String>, String)> {
    let mut out = Vec::new();
    match value {
        serde_json::Value::Object(map) => {
            if let Some(found) = map.get(field_name) {
                out.extend(references_from_value(found));
            }
            for v in map.values() {
                out.extend(find_references(v, field_name));
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                out.extend(find_references(item, field_name));
            }
        }
        _ => {}
    }
    out
}

fn references_from_value(value: &serde_json::Value) -> Vec<(Option<String>, String)> {
    match value {
        serde_json::Value::Object(obj) => obj
            .get("reference")
            .and_then(|v| v.as_str())
            .map(parse_reference)
            .into_iter()
            .collect(),
        serde_json::Value::Array(items) => items.iter().flat_map(references_from_value).collect(),
        _ => Vec::new(),
    }
}

fn parse_reference(raw: &str) -> (Option<String>, String) {
    if let Some(id) = raw.strip_prefix('#') {
        return (None, id.to_string());
    }
    let tail = raw.rsplit('/').take(2).collect::<Vec<_>>();
    if tail.len() == 2 {
        (Some(tail[1].to_string()), tail[0].to_string())
    } else {
        (None, raw.to_string())
    }
}

/// Drop ids already processed in a prior round (cycle detection), grouped by type.
fn dedup_against_seen(by_type: HashMap<String, Vec<String>>, seen: &mut HashMap<String, HashSet<String>>) -> HashMap<String, Vec<String>> {
    let mut fresh = HashMap::new();
    for (target_type, ids) in by_type {
        let seen_ids = seen.entry(target_type.clone()).or_default();
        let new_ids: Vec<String> = ids.into_iter().filter(|id| seen_ids.insert(id.clone())).collect();
        if !new_ids.is_empty() {
            fresh.insert(target_type, new_ids);
        }
    }
    fresh
}

/// Applies one directive's `allowedScopes` to the entries *it itself*
/// fetched. Never call this with entries pooled across directives — a
/// directive with no scope restriction would incorrectly lose entries to
/// a sibling directive's narrower scope.
fn apply_scope_filter(entries: Vec<ResultEntry>, directive: &IncludeDirective) -> Vec<ResultEntry> {
    if directive.allowed_scopes.is_empty() {
        return entries;
    }
    entries.into_iter().filter(|e| directive.allowed_scopes.iter().any(|s| s == &e.resource_type_name)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_client::{BreakerRegistry, FakeRecord, InMemoryUpstreamClient};
    use broker_model::PayloadFormat;
    use bytes::Bytes;

    fn patient_entry(id: &str, org_id: &str) -> ResultEntry {
        let payload = serde_json::json!({
            "resourceType": "Patient",
            "id": id,
            "managingOrganization": { "reference": format!("Organization/{org_id}") }
        });
        ResultEntry {
            resource_type_name: "Patient".into(),
            resource_id: id.into(),
            version_id: None,
            last_modified: None,
            raw_payload: Bytes::from(payload.to_string()),
            payload_format: PayloadFormat::Json,
            source_shard_url: "http://a.example".into(),
            match_mode: MatchMode::Match,
        }
    }

    fn resolver_with(records: Vec<FakeRecord>) -> (IncludeResolver, Vec<ShardEndpoint>) {
        let fake = InMemoryUpstreamClient::open(records);
        let breakers = Arc::new(BreakerRegistry::new(3, Duration::from_secs(30)));
        let client = Arc::new(GuardedClient::new(fake, breakers));
        let shards = vec![ShardEndpoint::new("A", "http://a.example")];
        let resolver = IncludeResolver::new(client, ResolutionMode::Distributed, Duration::from_secs(5), 10, 5, 500);
        (resolver, shards)
    }

    #[tokio::test]
    async fn expands_reference_to_included_entry() {
        let records = vec![FakeRecord::new("Organization", "o1"), FakeRecord::new("Organization", "o2")];
        let (resolver, shards) = resolver_with(records);
        let directive = IncludeDirective {
            ref_param: "managingOrganization".into(),
            target_type: Some("Organization".into()),
            iterate: false,
            wildcard: false,
            allowed_scopes: Vec::new(),
        };
        let main = vec![patient_entry("p1", "o1"), patient_entry("p2", "o2")];
        let resolution = resolver.resolve(&main, &[directive], &shards).await;
        let mut ids: Vec<&str> = resolution.entries.iter().map(|e| e.resource_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["o1", "o2"]);
        assert!(resolution.entries.iter().all(|e| e.match_mode == MatchMode::Include));
    }

    #[tokio::test]
    async fn passthrough_mode_returns_nothing_new() {
        let records = vec![FakeRecord::new("Organization", "o1")];
        let (mut resolver, shards) = resolver_with(records);
        resolver.mode = ResolutionMode::Passthrough;
        let directive = IncludeDirective {
            ref_param: "managingOrganization".into(),
            target_type: Some("Organization".into()),
            iterate: false,
            wildcard: false,
            allowed_scopes: Vec::new(),
        };
        let main = vec![patient_entry("p1", "o1")];
        let resolution = resolver.resolve(&main, &[directive], &shards).await;
        assert!(resolution.entries.is_empty());
    }

    #[tokio::test]
    async fn scope_filter_drops_disallowed_types() {
        let records = vec![FakeRecord::new("Organization", "o1")];
        let (resolver, shards) = resolver_with(records);
        let directive = IncludeDirective {
            ref_param: "managingOrganization".into(),
            target_type: Some("Organization".into()),
            iterate: false,
            wildcard: false,
            allowed_scopes: vec!["Practitioner".into()],
        };
        let main = vec![patient_entry("p1", "o1")];
        let resolution = resolver.resolve(&main, &[directive], &shards).await;
        assert!(resolution.entries.is_empty());
    }

    #[tokio::test]
    async fn scope_filter_is_applied_per_directive_not_as_a_global_union() {
        let records = vec![FakeRecord::new("Organization", "o1"), FakeRecord::new("Practitioner", "pr1")];
        let (resolver, shards) = resolver_with(records);

        // Directive 1 has no scope restriction and should keep whatever it
        // fetches (Organization); directive 2 restricts to Practitioner
        // only. Neither directive's filter should affect the other's
        // entries.
        let unrestricted = IncludeDirective {
            ref_param: "managingOrganization".into(),
            target_type: Some("Organization".into()),
            iterate: false,
            wildcard: false,
            allowed_scopes: Vec::new(),
        };
        let restricted_to_practitioner = IncludeDirective {
            ref_param: "generalPractitioner".into(),
            target_type: Some("Practitioner".into()),
            iterate: false,
            wildcard: false,
            allowed_scopes: vec!["Practitioner".into()],
        };

        let payload = serde_json::json!({
            "resourceType": "Patient",
            "id": "p1",
            "managingOrganization": { "reference": "Organization/o1" },
            "generalPractitioner": [{ "reference": "Practitioner/pr1" }],
        });
        let main = vec![ResultEntry {
            resource_type_name: "Patient".into(),
            resource_id: "p1".into(),
            version_id: None,
            last_modified: None,
            raw_payload: Bytes::from(payload.to_string()),
            payload_format: PayloadFormat::Json,
            source_shard_url: "http://a.example".into(),
            match_mode: MatchMode::Match,
        }];

        let resolution = resolver.resolve(&main, &[unrestricted, restricted_to_practitioner], &shards).await;
        let mut ids: Vec<&str> = resolution.entries.iter().map(|e| e.resource_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["o1", "pr1"], "unrestricted directive's Organization entry must survive the sibling's Practitioner-only scope");
    }

    #[test]
    fn parses_relative_absolute_and_fragment_references() {
        assert_eq!(parse_reference("Organization/o1"), (Some("Organization".into()), "o1".into()));
        assert_eq!(
            parse_reference("http://example.com/fhir/Organization/o1"),
            (Some("Organization".into()), "o1".into())
        );
        assert_eq!(parse_reference("#contained1"), (None, "contained1".into()));
    }
}
