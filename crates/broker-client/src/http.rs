//! HTTP-based `UpstreamClient`: `GET {shard.baseUrl}/{resourceType?}?{query-string}`
//!
//! Wire format per spec.md §6: `ct=`, `_count=`, `_sort=`, the extracted
//! predicate parameters, then pass-through unsupported parameters, all
//! URL-encoded. Response bodies are FHIR search-set bundles; parsing them
//! into `ResultEntry` is the one piece of "upstream wire format" the spec
//! treats as interface-only in general, but a concrete client still needs
//! *a* decode path to exist, so a minimal bundle shape is assumed here
//! (`entry[].resource.resourceType/id/meta`) and anything else maps to
//! `ClientError::Protocol`.

use async_trait::async_trait;
use broker_model::{AuthConfig, MatchMode, PayloadFormat, ResultEntry, ShardEndpoint, ShardSearchResult};
use bytes::Bytes;
use reqwest::Client;

use crate::error::ClientError;
use crate::upstream::{SubQuery, UpstreamClient};

pub struct HttpUpstreamClient {
    http: Client,
}

impl HttpUpstreamClient {
    #[must_use]
    pub fn new() -> Self {
        Self { http: Client::new() }
    }
}

impl Default for HttpUpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

/// The request path and query parameters for one shard sub-query.
/// Percent-encoding is left to `reqwest::RequestBuilder::query`, which
/// already carries the `url` crate for exactly this.
fn build_request_target(shard: &ShardEndpoint, sub_query: &SubQuery) -> (String, Vec<(String, String)>) {
    let mut url = shard.base_url.trim_end_matches('/').to_string();
    if let Some(rt) = &sub_query.resource_type {
        url.push('/');
        url.push_str(rt);
    }

    let mut pairs: Vec<(String, String)> = Vec::new();
    if let Some(ct) = &sub_query.shard_cursor_token {
        pairs.push(("ct".into(), ct.clone()));
    }
    pairs.push(("_count".into(), sub_query.page_size.to_string()));
    if !sub_query.sort.is_empty() {
        let signed: Vec<String> = sub_query
            .sort
            .iter()
            .map(|(p, desc)| if *desc { format!("-{p}") } else { p.clone() })
            .collect();
        pairs.push(("_sort".into(), signed.join(",")));
    }
    pairs.extend(sub_query.params.iter().cloned());
    pairs.extend(sub_query.unsupported_params.iter().cloned());

    (url, pairs)
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn search(
        &self,
        shard: &ShardEndpoint,
        sub_query: &SubQuery,
    ) -> Result<ShardSearchResult, ClientError> {
        let (url, pairs) = build_request_target(shard, sub_query);
        let mut request = self.http.get(&url).query(&pairs);

        request = match &shard.auth {
            AuthConfig::None => request,
            AuthConfig::Bearer(token) => request.bearer_auth(token),
            AuthConfig::Basic { username, password } => request.basic_auth(username, Some(password)),
        };
        for (name, value) in &shard.extra_headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(ClientError::Protocol(format!("upstream status {status}")));
        }

        decode_bundle(shard, &body)
    }
}

/// Minimal FHIR search-set bundle decoder: extracts
/// `entry[].resource.{resourceType,id,meta.versionId,meta.lastUpdated}`
/// plus `link[rel=next].url` as the opaque continuation token.
fn decode_bundle(shard: &ShardEndpoint, body: &Bytes) -> Result<ShardSearchResult, ClientError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| ClientError::Protocol(format!("bad bundle json: {e}")))?;

    let entries_json = value.get("entry").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let mut entries = Vec::with_capacity(entries_json.len());
    for entry in &entries_json {
        let resource = entry
            .get("resource")
            .ok_or_else(|| ClientError::Protocol("entry missing resource".into()))?;
        let resource_type_name = resource
            .get("resourceType")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClientError::Protocol("resource missing resourceType".into()))?
            .to_string();
        let resource_id = resource
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClientError::Protocol("resource missing id".into()))?
            .to_string();
        let version_id = resource
            .pointer("/meta/versionId")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let last_modified = resource
            .pointer("/meta/lastUpdated")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));
        let match_mode = match entry.pointer("/search/mode").and_then(|v| v.as_str()) {
            Some("include") => MatchMode::Include,
            Some("outcome") => MatchMode::Outcome,
            _ => MatchMode::Match,
        };

        entries.push(ResultEntry {
            resource_type_name,
            resource_id,
            version_id,
            last_modified,
            raw_payload: Bytes::from(resource.to_string()),
            payload_format: PayloadFormat::Json,
            source_shard_url: shard.base_url.clone(),
            match_mode,
        });
    }

    let continuation_token = value
        .get("link")
        .and_then(|v| v.as_array())
        .and_then(|links| links.iter().find(|l| l.get("relation").and_then(|r| r.as_str()) == Some("next")))
        .and_then(|l| l.get("url"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let total_count = value.get("total").and_then(serde_json::Value::as_u64);

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
        total_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_model::ShardEndpoint;

    #[test]
    fn build_request_target_orders_ct_count_sort_then_params() {
        let shard = ShardEndpoint::new("A", "http://a.example/fhir");
        let mut sub_query = SubQuery::new(Some("Patient".into()), 25);
        sub_query.shard_cursor_token = Some("opaque-1".into());
        sub_query.sort = vec![("name".into(), false), ("birthdate".into(), true)];
        sub_query.params = vec![("name".into(), "John".into())];

        let (url, pairs) = build_request_target(&shard, &sub_query);
        assert_eq!(url, "http://a.example/fhir/Patient");
        assert_eq!(
            pairs,
            vec![
                ("ct".to_string(), "opaque-1".to_string()),
                ("_count".to_string(), "25".to_string()),
                ("_sort".to_string(), "name,-birthdate".to_string()),
                ("name".to_string(), "John".to_string()),
            ]
        );

        let request = Client::new().get(&url).query(&pairs).build().unwrap();
        assert_eq!(
            request.url().as_str(),
            "http://a.example/fhir/Patient?ct=opaque-1&_count=25&_sort=name%2C-birthdate&name=John"
        );
    }

    #[test]
    fn decode_bundle_extracts_entries_and_next_link() {
        let shard = ShardEndpoint::new("A", "http://a.example");
        let body = serde_json::json!({
            "resourceType": "Bundle",
            "total": 1,
            "entry": [{
                "resource": { "resourceType": "Patient", "id": "p1", "meta": { "versionId": "2" } }
            }],
            "link": [{ "relation": "next", "url": "ct-token-2" }]
        });
        let result = decode_bundle(&shard, &Bytes::from(body.to_string())).unwrap();
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].resource_id, "p1");
        assert_eq!(result.continuation_token.as_deref(), Some("ct-token-2"));
        assert_eq!(result.total_count, Some(1));
    }
}
