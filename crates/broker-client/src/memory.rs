//! In-memory `UpstreamClient` for tests
//!
//! The spec's design notes call out the sample file-backed shard as
//! out-of-core test scaffolding that should become "a confined resource
//! behind the same `UpstreamClient` interface with explicit lifecycle
//! (open, search, close)" rather than a global mutable map reached via a
//! backdoor. This follows that shape: each instance owns one shard's
//! dataset behind a lock, `open`/`close` are no-ops recording lifecycle
//! state for assertions, and `search` answers from the in-memory table
//! with the same cursor/pagination semantics a real shard would apply.

use async_trait::async_trait;
use broker_model::{Expression, ResultEntry, ShardEndpoint, ShardSearchResult, StringOp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ClientError;
use crate::upstream::{SubQuery, UpstreamClient};

/// A single record held by the fake shard
#[derive(Clone, Debug)]
pub struct FakeRecord {
    pub resource_type: String,
    pub id: String,
    pub fields: HashMap<String, String>,
    pub references: HashMap<String, String>, // field -> "Type/id"
}

impl FakeRecord {
    #[must_use]
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self { resource_type: resource_type.into(), id: id.into(), fields: HashMap::new(), references: HashMap::new() }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_reference(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.references.insert(name.into(), target.into());
        self
    }
}

struct Dataset {
    records: Vec<FakeRecord>,
}

/// In-process fake upstream, confined per instance, with explicit lifecycle
pub struct InMemoryUpstreamClient {
    dataset: Mutex<Dataset>,
    opened: AtomicBool,
    /// Shard ids that should answer every call with a transport error,
    /// to exercise partial-failure paths without a flaky-timer hack.
    poisoned: Mutex<std::collections::HashSet<String>>,
}

impl InMemoryUpstreamClient {
    #[must_use]
    pub fn open(records: Vec<FakeRecord>) -> Arc<Self> {
        Arc::new(Self {
            dataset: Mutex::new(Dataset { records }),
            opened: AtomicBool::new(true),
            poisoned: Mutex::new(std::collections::HashSet::new()),
        })
    }

    pub fn close(&self) {
        self.opened.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub fn poison(&self, shard_id: impl Into<String>) {
        self.poisoned.lock().insert(shard_id.into());
    }

    fn matches(record: &FakeRecord, expr: &Expression) -> bool {
        match expr {
            Expression::SearchParam { child, .. } => Self::matches(record, child),
            Expression::String { op, field, value, ignore_case } => {
                let Some(actual) = record.fields.get(field).or_else(|| record.references.get(field)) else {
                    return false;
                };
                let (actual, value) = if *ignore_case {
                    (actual.to_lowercase(), value.to_lowercase())
                } else {
                    (actual.clone(), value.clone())
                };
                match op {
                    StringOp::Equals => actual == value,
                    StringOp::StartsWith => actual.starts_with(&value),
                    StringOp::Contains => actual.contains(&value),
                }
            }
            Expression::Multiary { op, children } => match op {
                broker_model::BoolOp::And => children.iter().all(|c| Self::matches(record, c)),
                broker_model::BoolOp::Or => children.iter().any(|c| Self::matches(record, c)),
            },
            // A fake shard resolving `PASSTHROUGH` chains itself would walk
            // the chain's child against its own Target-typed records; the
            // distributed resolver always rewrites chains away before a
            // sub-query reaches here, so this client only needs to satisfy
            // the simple leaf/boolean predicates above.
            Expression::Chained { .. } | Expression::Include { .. } => true,
        }
    }

    fn matches_params(record: &FakeRecord, params: &[(String, String)], resource_type: Option<&str>) -> bool {
        if let Some(rt) = resource_type {
            if record.resource_type != rt {
                return false;
            }
        }
        for (name, value) in params {
            if name == "_id" {
                let wanted: Vec<&str> = value.split(',').collect();
                if !wanted.contains(&record.id.as_str()) {
                    return false;
                }
                continue;
            }
            if name == "_type" {
                let wanted: Vec<&str> = value.split(',').collect();
                if !wanted.contains(&record.resource_type.as_str()) {
                    return false;
                }
                continue;
            }
            let actual = record.fields.get(name).or_else(|| record.references.get(name));
            match actual {
                Some(actual) if value.ends_with('*') => {
                    if !actual.starts_with(value.trim_end_matches('*')) {
                        return false;
                    }
                }
                Some(actual) => {
                    let candidates: Vec<&str> = value.split(',').collect();
                    if !candidates.contains(&actual.as_str()) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

#[async_trait]
impl UpstreamClient for InMemoryUpstreamClient {
    async fn search(
        &self,
        shard: &ShardEndpoint,
        sub_query: &SubQuery,
    ) -> Result<ShardSearchResult, ClientError> {
        if self.poisoned.lock().contains(&shard.id) {
            return Err(ClientError::Transport("poisoned shard".into()));
        }
        if !self.is_open() {
            return Err(ClientError::Transport("client closed".into()));
        }

        let dataset = self.dataset.lock();
        let mut matched: Vec<&FakeRecord> = dataset
            .records
            .iter()
            .filter(|r| Self::matches_params(r, &sub_query.params, sub_query.resource_type.as_deref()))
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));

        let start = sub_query
            .shard_cursor_token
            .as_ref()
            .and_then(|t| t.strip_prefix("offset:"))
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0);

        let page: Vec<&FakeRecord> = matched.iter().skip(start).take(sub_query.page_size as usize).copied().collect();
        let next_start = start + page.len();
        let continuation_token = if next_start < matched.len() { Some(format!("offset:{next_start}")) } else { None };

        let entries = page
            .iter()
            .map(|r| ResultEntry {
                resource_type_name: r.resource_type.clone(),
                resource_id: r.id.clone(),
                version_id: None,
                last_modified: None,
                raw_payload: bytes::Bytes::new(),
                payload_format: broker_model::PayloadFormat::Json,
                source_shard_url: shard.base_url.clone(),
                match_mode: broker_model::MatchMode::Match,
            })
            .collect();

        Ok(ShardSearchResult {
            shard_id: shard.id.clone(),
            shard_base_url: shard.base_url.clone(),
            success: true,
            status_code: 200,
            error_message: None,
            response: std::time::Duration::ZERO,
            entries,
            continuation_token,
            unsupported_params: Vec::new(),
            total_count: Some(matched.len() as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paginates_by_offset_token() {
        let records = (0..5).map(|i| FakeRecord::new("Patient", format!("p{i}"))).collect();
        let client = InMemoryUpstreamClient::open(records);
        let shard = ShardEndpoint::new("A", "http://a.example");

        let mut sub_query = SubQuery::new(Some("Patient".into()), 2);
        let page1 = client.search(&shard, &sub_query).await.unwrap();
        assert_eq!(page1.entries.len(), 2);
        assert_eq!(page1.continuation_token.as_deref(), Some("offset:2"));

        sub_query.shard_cursor_token = page1.continuation_token;
        let page2 = client.search(&shard, &sub_query).await.unwrap();
        assert_eq!(page2.entries.len(), 2);
        assert_eq!(page2.continuation_token.as_deref(), Some("offset:4"));
    }

    #[tokio::test]
    async fn poisoned_shard_fails_every_call() {
        let client = InMemoryUpstreamClient::open(vec![FakeRecord::new("Patient", "p1")]);
        client.poison("A");
        let shard = ShardEndpoint::new("A", "http://a.example");
        let sub_query = SubQuery::new(Some("Patient".into()), 10);
        assert!(client.search(&shard, &sub_query).await.is_err());
    }

    #[tokio::test]
    async fn closed_client_fails_calls() {
        let client = InMemoryUpstreamClient::open(vec![]);
        client.close();
        let shard = ShardEndpoint::new("A", "http://a.example");
        let sub_query = SubQuery::new(Some("Patient".into()), 10);
        assert!(client.search(&shard, &sub_query).await.is_err());
    }
}
