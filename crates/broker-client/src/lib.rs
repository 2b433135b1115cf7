//! Upstream record-server client: per-shard circuit breaker, HTTP
//! transport, and an in-memory fake for tests — all behind one
//! `UpstreamClient` trait.

pub mod breaker;
pub mod error;
pub mod http;
pub mod memory;
pub mod upstream;

pub use breaker::{BreakerRegistry, BreakerSnapshot, BreakerState};
pub use error::ClientError;
pub use http::HttpUpstreamClient;
pub use memory::{FakeRecord, InMemoryUpstreamClient};
pub use upstream::{GuardedClient, SubQuery, SubQueryContext, UpstreamClient};
