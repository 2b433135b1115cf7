//! Federated FHIR search execution engine
//!
//! Wires admission control, strategy selection, chain/include
//! resolution, shard fan-out, and result aggregation behind one
//! [`engine::SearchEngine`]. Layout mirrors the teacher's
//! `bin/objectio-gateway` module split: one file per pipeline stage,
//! each independently testable against a fake `UpstreamClient`.

pub mod aggregator;
pub mod chain;
pub mod engine;
pub mod executor;
pub mod extractor;
pub mod gate;
pub mod include;
pub mod strategy;

pub use aggregator::{Aggregator, AggregatedResult};
pub use chain::{ChainResolution, ChainResolver};
pub use engine::SearchEngine;
pub use executor::{ExecutionOutcome, FanOutExecutor, SubQueryTemplate};
pub use extractor::{extract, Extracted};
pub use gate::{OperationToken, ProtectionGate};
pub use include::{IncludeDirective, IncludeResolution, IncludeResolver};
pub use strategy::StrategyAnalyzer;
