//! Process entry point embedding the search engine
//!
//! The HTTP controller is interface-only / out of scope for this repo
//! (spec.md §1); what lives here is the ambient bootstrap every embedding
//! process needs regardless — config loading, logging setup, and a
//! readiness check against the configured shard set — mirroring
//! `bin/objectio-gateway/src/main.rs`'s `Args`/config/tracing wiring
//! without the S3 routing layer that isn't part of this broker.

use anyhow::{Context, Result};
use broker_client::HttpUpstreamClient;
use broker_core::SearchEngine;
use broker_model::{AuthConfig, BrokerConfig, ShardEndpoint};
use clap::Parser;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "broker-gateway")]
#[command(about = "Federated FHIR search broker bootstrap")]
#[command(version)]
struct Args {
    /// Broker + shard configuration file path
    #[arg(short, long, default_value = "/etc/broker/gateway.toml")]
    config: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Deserialize)]
struct ShardSpec {
    id: String,
    base_url: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    bearer_token: Option<String>,
}

const fn default_enabled() -> bool {
    true
}

impl From<ShardSpec> for ShardEndpoint {
    fn from(spec: ShardSpec) -> Self {
        let mut endpoint = ShardEndpoint::new(spec.id, spec.base_url).with_priority(spec.priority);
        if let Some(ms) = spec.timeout_ms {
            endpoint = endpoint.with_timeout(Duration::from_millis(ms));
        }
        if !spec.enabled {
            endpoint = endpoint.disabled();
        }
        if let Some(token) = spec.bearer_token {
            endpoint.auth = AuthConfig::Bearer(token);
        }
        endpoint
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    broker: BrokerConfig,
    shards: Vec<ShardSpec>,
}

fn load_config(path: &str) -> Result<FileConfig> {
    let built = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix("BROKER").separator("__"))
        .build()
        .with_context(|| format!("loading config from {path}"))?;
    built.try_deserialize().context("deserializing broker config")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(config = %args.config, "starting federated search broker");

    let file_config = load_config(&args.config)?;
    let shards: Vec<ShardEndpoint> = file_config.shards.into_iter().map(ShardEndpoint::from).collect();
    info!(shard_count = shards.len(), "loaded shard set");

    let upstream: Arc<dyn broker_client::UpstreamClient> = Arc::new(HttpUpstreamClient::new());
    let engine = SearchEngine::new(file_config.broker, shards, upstream);

    info!(in_flight = engine.in_flight(), "search engine ready");
    Ok(())
}
