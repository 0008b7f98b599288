//! Token bucket: local, lock-free burst smoothing.
//!
//! State is two atomics (token count, last-refill timestamp) mutated only
//! with compare-and-swap; safe under arbitrary concurrent callers within one
//! process, and deliberately *not* shared across processes. Refill happens
//! lazily on each call as a pure function of elapsed wall-clock time; no
//! background task.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::Clock;

/// Construction errors; both knobs must be positive.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenBucketError {
    ZeroCapacity,
    NonPositiveRate { provided: f64 },
}

impl fmt::Display for TokenBucketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenBucketError::ZeroCapacity => write!(f, "capacity must be > 0"),
            TokenBucketError::NonPositiveRate { provided } => {
                write!(f, "refill rate must be > 0 tokens/sec (got {})", provided)
            }
        }
    }
}

impl std::error::Error for TokenBucketError {}

/// Lock-free token bucket refilled proportionally to elapsed time.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    /// Tokens per second.
    refill_rate: f64,
    tokens: AtomicU64,
    last_refill_millis: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a full bucket. `refill_rate` is tokens per second.
    pub fn new(
        capacity: u64,
        refill_rate: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TokenBucketError> {
        if capacity == 0 {
            return Err(TokenBucketError::ZeroCapacity);
        }
        if refill_rate.is_nan() || refill_rate <= 0.0 {
            return Err(TokenBucketError::NonPositiveRate { provided: refill_rate });
        }
        let now = clock.now_millis();
        Ok(Self {
            capacity,
            refill_rate,
            tokens: AtomicU64::new(capacity),
            last_refill_millis: AtomicU64::new(now),
            clock,
        })
    }

    /// Try to take `permits` tokens without blocking.
    pub fn try_consume(&self, permits: u64) -> bool {
        self.refill();
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(permits)
            })
            .is_ok()
    }

    /// Tokens currently available. Performs the same lazy refill as
    /// `try_consume`, so reading advances bucket state.
    pub fn available(&self) -> u64 {
        self.refill();
        self.tokens.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Credit tokens earned since the last refill. The last-refill timestamp
    /// advances only by the time the granted whole tokens account for, so
    /// fractional accrual carries over instead of being discarded.
    fn refill(&self) {
        let now = self.clock.now_millis();
        let last = self.last_refill_millis.load(Ordering::Acquire);
        let elapsed_millis = now.saturating_sub(last);
        let earned = ((elapsed_millis as f64 / 1_000.0) * self.refill_rate).floor() as u64;
        if earned == 0 {
            return;
        }
        let consumed_millis = ((earned as f64) * 1_000.0 / self.refill_rate).round() as u64;

        // One caller wins the interval and credits it; losers see the
        // advanced timestamp and recompute from there.
        if self
            .last_refill_millis
            .compare_exchange(
                last,
                last.saturating_add(consumed_millis),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let _ = self.tokens.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(earned).min(self.capacity))
            });
        }
    }
}
