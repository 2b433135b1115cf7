//! Per-shard circuit breaker
//!
//! ```text
//!   CLOSED ─failures ≥ threshold─▶ OPEN
//!   OPEN ─after openDuration─▶ HALF_OPEN
//!   HALF_OPEN ─success─▶ CLOSED
//!   HALF_OPEN ─failure─▶ OPEN (reset openedAt)
//! ```
//!
//! Grounded on the teacher's `OsdPool` (`bin/objectio-gateway/src/osd_pool.rs`):
//! a process-lifetime map keyed by shard/node id, built lazily and shared
//! across every in-flight request. The teacher guards its map with
//! `tokio::sync::RwLock` because connections themselves are async to
//! establish; breaker state transitions are pure CPU-bound CAS, so here
//! the map is a `dashmap::DashMap` and each entry's state is a set of
//! atomics — no lock is held across an await point.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    const fn to_tag(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    const fn from_tag(tag: u8) -> Self {
        match tag {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Point-in-time view of a breaker, for health/metrics reporting
#[derive(Clone, Copy, Debug)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub opened_at_epoch_ms: Option<i64>,
}

struct Breaker {
    state: AtomicU8,
    failure_count: AtomicU32,
    opened_at_epoch_ms: AtomicI64,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(BreakerState::Closed.to_tag()),
            failure_count: AtomicU32::new(0),
            opened_at_epoch_ms: AtomicI64::new(0),
        }
    }
}

/// Concurrent map of per-shard breakers, process-lifetime, shared across requests
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<Breaker>>,
    failure_threshold: u32,
    open_duration: Duration,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self { breakers: DashMap::new(), failure_threshold, open_duration }
    }

    fn entry(&self, shard_id: &str) -> Arc<Breaker> {
        self.breakers
            .entry(shard_id.to_string())
            .or_insert_with(|| Arc::new(Breaker::new()))
            .clone()
    }

    /// Whether a call to this shard should be attempted right now.
    /// In `HALF_OPEN` the call is attempted (it is the probe); only a
    /// shard in `OPEN` within its open window short-circuits.
    pub fn should_attempt(&self, shard_id: &str) -> bool {
        let breaker = self.entry(shard_id);
        let state = BreakerState::from_tag(breaker.state.load(Ordering::Acquire));
        match state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let opened_at = breaker.opened_at_epoch_ms.load(Ordering::Acquire);
                let elapsed = now_epoch_ms().saturating_sub(opened_at);
                if elapsed >= i64::try_from(self.open_duration.as_millis()).unwrap_or(i64::MAX) {
                    // Transition OPEN -> HALF_OPEN via CAS so only one
                    // caller wins the probe slot under contention; losers
                    // still see a state that permits their own attempt.
                    let _ = breaker.state.compare_exchange(
                        BreakerState::Open.to_tag(),
                        BreakerState::HalfOpen.to_tag(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, shard_id: &str) {
        let breaker = self.entry(shard_id);
        breaker.failure_count.store(0, Ordering::Release);
        breaker.state.store(BreakerState::Closed.to_tag(), Ordering::Release);
    }

    pub fn record_failure(&self, shard_id: &str) {
        let breaker = self.entry(shard_id);
        let state = BreakerState::from_tag(breaker.state.load(Ordering::Acquire));
        match state {
            BreakerState::HalfOpen => self.trip(&breaker),
            BreakerState::Closed => {
                let failures = breaker.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.failure_threshold {
                    self.trip(&breaker);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&self, breaker: &Breaker) {
        breaker.state.store(BreakerState::Open.to_tag(), Ordering::Release);
        breaker.opened_at_epoch_ms.store(now_epoch_ms(), Ordering::Release);
    }

    #[must_use]
    pub fn snapshot(&self, shard_id: &str) -> BreakerSnapshot {
        let breaker = self.entry(shard_id);
        let state = BreakerState::from_tag(breaker.state.load(Ordering::Acquire));
        let opened_at = breaker.opened_at_epoch_ms.load(Ordering::Acquire);
        BreakerSnapshot {
            state,
            failure_count: breaker.failure_count.load(Ordering::Acquire),
            opened_at_epoch_ms: if opened_at == 0 { None } else { Some(opened_at) },
        }
    }
}

fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
