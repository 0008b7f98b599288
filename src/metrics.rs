//! Outcome counters, keyed by limiter name.
//!
//! The gate records one outcome per admission check. Sinks are trait objects
//! so callers can bridge to whatever telemetry pipeline they run; the
//! in-memory sink is for tests and local inspection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// What happened to a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    /// Within limits.
    Allowed,
    /// Over the limit.
    Denied,
    /// Store unreachable, request admitted by fail-open policy.
    FailedOpen,
    /// Store unreachable, request refused by fail-closed policy.
    FailedClosed,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Allowed => "allowed",
            OutcomeKind::Denied => "denied",
            OutcomeKind::FailedOpen => "failed_open",
            OutcomeKind::FailedClosed => "failed_closed",
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives one record per admission check.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    fn record(&self, limiter: &str, outcome: OutcomeKind);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _limiter: &str, _outcome: OutcomeKind) {}
}

/// Counting sink backed by a mutex-guarded map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetrics {
    counts: Arc<Mutex<HashMap<(String, OutcomeKind), u64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count for one (limiter, outcome) pair.
    pub fn count(&self, limiter: &str, outcome: OutcomeKind) -> u64 {
        self.lock_counts()
            .get(&(limiter.to_string(), outcome))
            .copied()
            .unwrap_or(0)
    }

    /// Total records for a limiter across all outcomes.
    pub fn total(&self, limiter: &str) -> u64 {
        self.lock_counts()
            .iter()
            .filter(|((name, _), _)| name == limiter)
            .map(|(_, count)| *count)
            .sum()
    }

    fn lock_counts(&self) -> MutexGuard<'_, HashMap<(String, OutcomeKind), u64>> {
        self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record(&self, limiter: &str, outcome: OutcomeKind) {
        *self
            .lock_counts()
            .entry((limiter.to_string(), outcome))
            .or_insert(0) += 1;
    }
}
