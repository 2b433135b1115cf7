//! Configuration tree for the search broker
//!
//! Shaped like `objectio_common::config::Config`: one nested struct per
//! concern, each with a `Default` impl, loadable through the `config`
//! crate from TOML plus environment overrides in the embedding process.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resolution mode for a pluggable resolver (chain or include)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolutionMode {
    /// Trust each shard to resolve the predicate locally
    Passthrough,
    /// Fan out recursively and coordinate across shards
    Distributed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub search_timeout_sec: u64,
    pub query_timeout_sec: u64,
    pub chain_search_timeout_sec: u64,
    pub distributed_chain_timeout_sec: u64,
    pub distributed_include_timeout_sec: u64,
    pub token_ttl_sec: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            search_timeout_sec: 60,
            query_timeout_sec: 10,
            chain_search_timeout_sec: 15,
            distributed_chain_timeout_sec: 15,
            distributed_include_timeout_sec: 15,
            token_ttl_sec: 30 * 60,
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_sec)
    }

    #[must_use]
    pub fn chain_timeout(&self) -> Duration {
        Duration::from_secs(self.distributed_chain_timeout_sec)
    }

    #[must_use]
    pub fn include_timeout(&self) -> Duration {
        Duration::from_secs(self.distributed_include_timeout_sec)
    }

    #[must_use]
    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_sec)
    }

    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_sec)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_results_per_server: u32,
    pub max_total_results: u32,
    pub max_included_resources_in_bundle: usize,
    pub max_chain_depth: u32,
    pub max_distributed_reference_ids: usize,
    pub distributed_batch_size: usize,
    pub max_concurrent_searches: usize,
    pub max_parallel_servers: usize,
    pub max_page_size: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_results_per_server: 1000,
            max_total_results: 5000,
            max_included_resources_in_bundle: 500,
            max_chain_depth: 3,
            max_distributed_reference_ids: 1000,
            distributed_batch_size: 50,
            max_concurrent_searches: 64,
            max_parallel_servers: 32,
            max_page_size: 200,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub open_duration_sec: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { enabled: true, failure_threshold: 3, open_duration_sec: 30 }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_duration_sec)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub parallel_threshold: u32,
    pub sequential_threshold: u32,
    pub fill_factor: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self { parallel_threshold: 10, sequential_threshold: 20, fill_factor: 0.8 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub chained_search_resolution: ResolutionMode,
    pub include_resolution: ResolutionMode,
    pub include_iteration_cap: u32,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            chained_search_resolution: ResolutionMode::Distributed,
            include_resolution: ResolutionMode::Distributed,
            include_iteration_cap: 5,
        }
    }
}

/// Root configuration for the search broker engine
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BrokerConfig {
    pub timeouts: TimeoutConfig,
    pub limits: LimitsConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub strategy: StrategyConfig,
    pub resolution: ResolutionConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_defaults() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.strategy.parallel_threshold, 10);
        assert_eq!(cfg.strategy.sequential_threshold, 20);
        assert_eq!(cfg.timeouts.token_ttl_sec, 1800);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 3);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = BrokerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: BrokerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.limits.max_page_size, cfg.limits.max_page_size);
    }
}
