//! Protection Gate — admission control before any fan-out
//!
//! The in-flight counter is the one piece of shared mutable state every
//! request touches before doing any I/O, so it is a single `AtomicUsize`
//! CAS loop rather than a lock — the same call-by-call atomicity the
//! teacher gives its breaker transitions, applied here to admission.

use broker_model::{BrokerConfig, BrokerError, Result, SearchRequest, VersionRequirement};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::debug;

/// Proof of admission; must be released on every exit path.
#[derive(Debug)]
pub struct OperationToken {
    gate: Arc<GateInner>,
    started_at: Instant,
    released: bool,
}

impl OperationToken {
    fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

impl Drop for OperationToken {
    fn drop(&mut self) {
        if !self.released {
            self.gate.release(self.elapsed());
        }
    }
}

#[derive(Debug)]
struct GateInner {
    in_flight: AtomicUsize,
    limit: usize,
}

impl GateInner {
    fn release(&self, elapsed: std::time::Duration) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug!(elapsed_ms = elapsed.as_millis(), "operation released");
        #[cfg(feature = "metrics")]
        metrics::histogram!("broker_search_duration_ms").record(elapsed.as_millis() as f64);
    }
}

/// Admission control: validates a request against quotas and mints an
/// `OperationToken` scoping the search.
pub struct ProtectionGate {
    inner: Arc<GateInner>,
    max_page_size: u32,
    max_chain_depth: u32,
}

impl ProtectionGate {
    #[must_use]
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            inner: Arc::new(GateInner {
                in_flight: AtomicUsize::new(0),
                limit: config.limits.max_concurrent_searches,
            }),
            max_page_size: config.limits.max_page_size,
            max_chain_depth: config.limits.max_chain_depth,
        }
    }

    /// `Admit(request) → OperationToken | Rejection`
    ///
    /// # Errors
    /// `BrokerError::RequestTooCostly` for a non-`LATEST` version
    /// requirement, an over-large page size, or a chain deeper than the
    /// configured cap; `BrokerError::Backpressure` when the concurrency
    /// limit is already saturated.
    pub fn admit(&self, request: &SearchRequest) -> Result<OperationToken> {
        if request.version_requirement != VersionRequirement::Latest {
            return Err(BrokerError::request_too_costly("only LATEST version requirement is supported"));
        }
        if request.max_item_count > self.max_page_size {
            return Err(BrokerError::request_too_costly(format!(
                "page size {} exceeds cap {}",
                request.max_item_count, self.max_page_size
            )));
        }
        let declared_depth = request.declared_chain_depth();
        if declared_depth > self.max_chain_depth {
            return Err(BrokerError::request_too_costly(format!(
                "chain depth {declared_depth} exceeds cap {}",
                self.max_chain_depth
            )));
        }

        // CAS loop: only admit while strictly below the limit, bump atomically.
        let mut current = self.inner.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.inner.limit {
                return Err(BrokerError::Backpressure { in_flight: current, limit: self.inner.limit });
            }
            match self.inner.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        #[cfg(feature = "metrics")]
        metrics::gauge!("broker_inflight_searches").set(f64::from(u32::try_from(current + 1).unwrap_or(u32::MAX)));

        Ok(OperationToken { gate: self.inner.clone(), started_at: Instant::now(), released: false })
    }

    /// Current in-flight count, for health/metrics reporting
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }
}

impl OperationToken {
    /// Explicit release, recording elapsed time; idempotent with `Drop`.
    pub fn release(mut self) {
        self.gate.release(self.elapsed());
        self.released = true;
    }
}
