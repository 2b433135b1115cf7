//! The distributed continuation-token protocol
//!
//! A composite cursor over every shard queried for a page, base64-URL
//! encoded JSON with snake_case keys per the wire format in spec.md §6.
//! Grounded on the teacher's `ListContinuationToken`
//! (`bin/objectio-gateway/src/scatter_gather.rs`): per-shard cursor map +
//! encode/decode through `base64::engine::general_purpose::URL_SAFE_NO_PAD`,
//! generalized from a single topology-version guard to a TTL guard and
//! from one opaque `last_key` per shard to the full `ShardCursor` shape
//! the broker's fan-out strategies need.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{BrokerError, Result};

pub const TOKEN_VERSION: u32 = 1;

/// Which fan-out strategy produced the page this token continues
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    #[serde(rename = "PARALLEL")]
    Parallel,
    #[serde(rename = "SEQUENTIAL")]
    Sequential,
}

/// One shard's page position
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardCursor {
    pub id: String,
    pub token: Option<String>,
    pub exhausted: bool,
    pub results_returned: u32,
    pub last_sort_value: Option<serde_json::Value>,
}

/// Multi-shard pagination cursor
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DistributedContinuationToken {
    pub version: u32,
    pub page_size: u32,
    pub sort_criteria: Option<String>,
    pub strategy: Strategy,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_sort_values: HashMap<String, serde_json::Value>,
    pub shards: Vec<ShardCursor>,
}

impl DistributedContinuationToken {
    /// Encode to the base64-URL wire form
    ///
    /// # Errors
    /// Returns `BrokerError::Internal` if the token cannot be serialized,
    /// which would indicate a non-JSON-safe `last_sort_value` slipped in.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| BrokerError::internal(format!("token encode: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode from the base64-URL wire form, rejecting tokens older than `ttl`
    ///
    /// # Errors
    /// Returns `BrokerError::ContinuationMalformed` if the string is not
    /// valid base64/JSON, or `BrokerError::ContinuationExpired` if
    /// `created_at` is older than `ttl`.
    pub fn decode(s: &str, ttl: Duration, now: chrono::DateTime<chrono::Utc>) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| BrokerError::ContinuationMalformed(e.to_string()))?;
        let token: Self = serde_json::from_slice(&bytes)
            .map_err(|e| BrokerError::ContinuationMalformed(e.to_string()))?;

        if token.version != TOKEN_VERSION {
            return Err(BrokerError::ContinuationMalformed(format!(
                "unsupported token version {}",
                token.version
            )));
        }

        let age = now.signed_duration_since(token.created_at);
        let ttl_signed = chrono::Duration::from_std(ttl)
            .map_err(|e| BrokerError::internal(format!("ttl overflow: {e}")))?;
        if age > ttl_signed {
            return Err(BrokerError::ContinuationExpired);
        }

        Ok(token)
    }

    /// The cursor for a given shard id, if the previous page queried it
    #[must_use]
    pub fn cursor_for(&self, shard_id: &str) -> Option<&ShardCursor> {
        self.shards.iter().find(|c| c.id == shard_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(created_at: chrono::DateTime<chrono::Utc>) -> DistributedContinuationToken {
        DistributedContinuationToken {
            version: TOKEN_VERSION,
            page_size: 10,
            sort_criteria: Some("-name".into()),
            strategy: Strategy::Parallel,
            created_at,
            last_sort_values: HashMap::from([("name".into(), serde_json::json!("Zed"))]),
            shards: vec![
                ShardCursor { id: "A".into(), token: Some("ctA".into()), exhausted: false, results_returned: 6, last_sort_value: None },
                ShardCursor { id: "B".into(), token: None, exhausted: true, results_returned: 5, last_sort_value: None },
            ],
        }
    }

    #[test]
    fn round_trip_preserves_all_fields() {
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let token = sample(now);
        let encoded = token.encode().unwrap();
        let decoded = DistributedContinuationToken::decode(&encoded, Duration::from_secs(1800), now).unwrap();
        assert_eq!(decoded.page_size, token.page_size);
        assert_eq!(decoded.shards.len(), 2);
        assert_eq!(decoded.cursor_for("A").unwrap().token.as_deref(), Some("ctA"));
        assert!(decoded.cursor_for("B").unwrap().exhausted);
    }

    #[test]
    fn expired_token_is_rejected() {
        let created = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = created + chrono::Duration::minutes(31);
        let token = sample(created);
        let encoded = token.encode().unwrap();
        let err = DistributedContinuationToken::decode(&encoded, Duration::from_secs(1800), now).unwrap_err();
        assert!(matches!(err, BrokerError::ContinuationExpired));
    }

    #[test]
    fn malformed_token_is_rejected() {
        let now = chrono::Utc::now();
        let err = DistributedContinuationToken::decode("not-base64!!", Duration::from_secs(1800), now).unwrap_err();
        assert!(matches!(err, BrokerError::ContinuationMalformed(_)));
    }
}
