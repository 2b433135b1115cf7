//! One upstream record in a response, and the per-shard response wrapper

use bytes::Bytes;

/// Wire format tag for `ResultEntry::raw_payload`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Xml,
}

/// Why an entry is present in the aggregated result
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchMode {
    /// Matched the main search predicate
    Match,
    /// Pulled in via `_include`/`_revinclude`
    Include,
    /// An operation-outcome placeholder (e.g. a truncation warning)
    Outcome,
}

/// One upstream record, as returned by the Upstream Client from a shard
/// payload. `source_shard_url` is stamped by the Aggregator, never by the
/// client that produced the raw payload.
#[derive(Clone, Debug)]
pub struct ResultEntry {
    pub resource_type_name: String,
    pub resource_id: String,
    pub version_id: Option<String>,
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
    pub raw_payload: Bytes,
    pub payload_format: PayloadFormat,
    pub source_shard_url: String,
    pub match_mode: MatchMode,
}

impl ResultEntry {
    /// `(resourceTypeName, resourceId)` identity pair used for
    /// per-shard-scoped dedup during chain/include resolution. Two
    /// entries sharing this pair from *different* shards are still both
    /// returned to the client — see the Data Model's no-cross-shard-dedup
    /// invariant.
    #[must_use]
    pub fn identity(&self) -> (&str, &str) {
        (&self.resource_type_name, &self.resource_id)
    }
}

/// One shard's response to one sub-query
#[derive(Clone, Debug)]
pub struct ShardSearchResult {
    pub shard_id: String,
    pub shard_base_url: String,
    pub success: bool,
    pub status_code: u16,
    pub error_message: Option<String>,
    pub response: std::time::Duration,
    pub entries: Vec<ResultEntry>,
    pub continuation_token: Option<String>,
    pub unsupported_params: Vec<(String, String)>,
    pub total_count: Option<u64>,
}

impl ShardSearchResult {
    #[must_use]
    pub fn failure(shard_id: impl Into<String>, shard_base_url: impl Into<String>, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            shard_base_url: shard_base_url.into(),
            success: false,
            status_code,
            error_message: Some(message.into()),
            response: std::time::Duration::ZERO,
            entries: Vec::new(),
            continuation_token: None,
            unsupported_params: Vec::new(),
            total_count: None,
        }
    }

    /// Whether this shard has more data beyond what it returned
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.success && self.continuation_token.is_none()
    }
}
