//! Leaky bucket: local admission model bounding absolute in-flight count.
//!
//! A bounded FIFO queue drains at a fixed rate. Leak-then-enqueue must be
//! observed as one step by every caller, so the whole operation runs under a
//! single mutex rather than lock-free atomics. Draining is lazy, computed
//! from elapsed time on each call.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;

/// Construction errors; both knobs must be positive.
#[derive(Debug, Clone, PartialEq)]
pub enum LeakyBucketError {
    ZeroCapacity,
    NonPositiveRate { provided: f64 },
}

impl fmt::Display for LeakyBucketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeakyBucketError::ZeroCapacity => write!(f, "capacity must be > 0"),
            LeakyBucketError::NonPositiveRate { provided } => {
                write!(f, "leak rate must be > 0 items/sec (got {})", provided)
            }
        }
    }
}

impl std::error::Error for LeakyBucketError {}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<u64>,
    last_leak_millis: u64,
}

/// Mutex-guarded leaky bucket.
#[derive(Debug)]
pub struct LeakyBucket {
    capacity: usize,
    /// Items drained per second.
    leak_rate: f64,
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl LeakyBucket {
    /// Create an empty bucket. `leak_rate` is items drained per second.
    pub fn new(
        capacity: usize,
        leak_rate: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LeakyBucketError> {
        if capacity == 0 {
            return Err(LeakyBucketError::ZeroCapacity);
        }
        if leak_rate.is_nan() || leak_rate <= 0.0 {
            return Err(LeakyBucketError::NonPositiveRate { provided: leak_rate });
        }
        let now = clock.now_millis();
        Ok(Self {
            capacity,
            leak_rate,
            inner: Mutex::new(Inner { queue: VecDeque::new(), last_leak_millis: now }),
            clock,
        })
    }

    /// Try to enqueue one request; fails when the bucket is still at
    /// capacity after leaking.
    pub fn try_consume(&self) -> bool {
        let now = self.clock.now_millis();
        let mut inner = self.lock_inner();
        Self::leak(&mut inner, now, self.leak_rate);
        if inner.queue.len() >= self.capacity {
            return false;
        }
        inner.queue.push_back(now);
        true
    }

    /// Requests currently held, after lazy draining.
    pub fn depth(&self) -> usize {
        let now = self.clock.now_millis();
        let mut inner = self.lock_inner();
        Self::leak(&mut inner, now, self.leak_rate);
        inner.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drain `floor(elapsed_millis * rate / 1000)` oldest entries, never more
    /// than are present. Advances the leak timestamp only by the time the
    /// drained items account for, unless the queue emptied.
    fn leak(inner: &mut Inner, now: u64, leak_rate: f64) {
        let elapsed = now.saturating_sub(inner.last_leak_millis);
        let to_leak = (elapsed as f64 * leak_rate / 1_000.0).floor() as u64;
        if to_leak == 0 {
            return;
        }
        let drained = (to_leak as usize).min(inner.queue.len());
        inner.queue.drain(..drained);
        if inner.queue.is_empty() {
            // Nothing left to drain; idle time must not bank future leaks.
            inner.last_leak_millis = now;
        } else {
            let consumed_millis = ((to_leak as f64) * 1_000.0 / leak_rate).round() as u64;
            inner.last_leak_millis = inner.last_leak_millis.saturating_add(consumed_millis);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn bucket(capacity: usize, rate: f64) -> (LeakyBucket, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (LeakyBucket::new(capacity, rate, clock.clone()).unwrap(), clock)
    }

    #[test]
    fn rejects_invalid_construction() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        assert_eq!(
            LeakyBucket::new(0, 1.0, clock.clone()).unwrap_err(),
            LeakyBucketError::ZeroCapacity
        );
        assert!(LeakyBucket::new(5, 0.0, clock).is_err());
    }

    #[test]
    fn fills_to_capacity_then_rejects() {
        let (bucket, _clock) = bucket(3, 1.0);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
        assert_eq!(bucket.depth(), 3);
    }

    #[test]
    fn drains_at_fixed_rate() {
        let (bucket, clock) = bucket(3, 1.0);
        for _ in 0..3 {
            assert!(bucket.try_consume());
        }
        clock.advance(2_000);
        assert_eq!(bucket.depth(), 1);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[test]
    fn depth_never_exceeds_capacity_under_burst() {
        let (bucket, clock) = bucket(5, 10.0);
        for _ in 0..100 {
            bucket.try_consume();
            assert!(bucket.depth() <= bucket.capacity());
            clock.advance(7);
        }
    }

    #[test]
    fn idle_time_does_not_bank_leaks() {
        let (bucket, clock) = bucket(2, 1.0);
        // Empty bucket sits idle for an hour; that must not pre-pay drains.
        clock.advance(3_600_000);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
        clock.advance(500);
        assert!(!bucket.try_consume());
        clock.advance(500);
        assert!(bucket.try_consume());
    }

    #[test]
    fn sub_second_rates_accrue() {
        let (bucket, clock) = bucket(1, 0.5);
        assert!(bucket.try_consume());
        clock.advance(1_999);
        assert!(!bucket.try_consume());
        clock.advance(1);
        assert!(bucket.try_consume());
    }
}
