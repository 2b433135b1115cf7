//! Upstream record-server (shard) configuration

use std::collections::HashMap;
use std::time::Duration;

/// Auth material attached to every outbound sub-query for a shard
#[derive(Clone, Debug, Default)]
pub enum AuthConfig {
    #[default]
    None,
    Bearer(String),
    Basic { username: String, password: String },
}

/// One upstream record server holding a disjoint partition of the corpus
///
/// Immutable during a request; the enabled shard set may only change
/// between requests, via `SearchEngine::set_shards`.
#[derive(Clone, Debug)]
pub struct ShardEndpoint {
    pub id: String,
    pub base_url: String,
    pub enabled: bool,
    pub priority: i32,
    pub timeout: Option<Duration>,
    pub auth: AuthConfig,
    pub extra_headers: HashMap<String, String>,
}

impl ShardEndpoint {
    #[must_use]
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            enabled: true,
            priority: 0,
            timeout: None,
            auth: AuthConfig::None,
            extra_headers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Effective per-shard timeout, falling back to the engine-wide budget
    #[must_use]
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}
