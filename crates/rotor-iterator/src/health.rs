//! Per-iterator health counters.
//!
//! Observability only; nothing here feeds back into scheduling decisions.
//! Counters are plain atomics so recording never contends with dispatch.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct IteratorHealth {
    sweeps: AtomicU64,
    dispatched: AtomicU64,
    handler_failures: AtomicU64,
    slow_handlers: AtomicU64,
    delayed_dispatches: AtomicU64,
    lost_races: AtomicU64,
    max_observed_delay_ms: AtomicI64,
}

/// Snapshot of an iterator's health counters, for an external metrics
/// collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub sweeps: u64,
    pub dispatched: u64,
    pub handler_failures: u64,
    pub slow_handlers: u64,
    pub delayed_dispatches: u64,
    pub lost_races: u64,
    pub max_observed_delay_ms: i64,
}

impl IteratorHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow_handler(&self) {
        self.slow_handlers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost_race(&self) {
        self.lost_races.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how far behind its marker an entity was when dispatched.
    /// Returns true when the lag exceeds the acceptable delay.
    pub fn record_lag(&self, lag_ms: i64, acceptable_ms: Option<i64>) -> bool {
        self.max_observed_delay_ms.fetch_max(lag_ms, Ordering::Relaxed);
        let over = acceptable_ms.is_some_and(|limit| lag_ms > limit);
        if over {
            self.delayed_dispatches.fetch_add(1, Ordering::Relaxed);
        }
        over
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            slow_handlers: self.slow_handlers.load(Ordering::Relaxed),
            delayed_dispatches: self.delayed_dispatches.load(Ordering::Relaxed),
            lost_races: self.lost_races.load(Ordering::Relaxed),
            max_observed_delay_ms: self.max_observed_delay_ms.load(Ordering::Relaxed),
        }
    }
}
