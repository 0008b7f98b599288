//! Backoff schedules for retrying store calls.
//!
//! Attempt semantics: attempt `0` is the initial call (no delay); retries
//! start at `attempt = 1`. All arithmetic saturates at [`MAX_BACKOFF`], so a
//! pathological attempt count never panics.
//!
//! ```rust
//! use floodgate::Backoff;
//! use std::time::Duration;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(50))
//!     .with_max(Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(50));
//! assert_eq!(backoff.delay(2), Duration::from_millis(100));
//! assert_eq!(backoff.delay(20), Duration::from_secs(1));
//! ```

use std::fmt;
use std::time::Duration;

/// Ceiling applied when a computed delay would overflow (one minute).
///
/// Rate-limit store calls are short; anything past this means the backend is
/// effectively down and the circuit breaker takes over.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    /// `with_max` is meaningless for a constant schedule.
    ConstantDoesNotSupportMax,
    /// The cap must be at least the base delay.
    MaxLessThanBase { base: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::ConstantDoesNotSupportMax => {
                write!(f, "with_max is only valid for exponential backoff")
            }
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Schedule {
    Constant { delay: Duration },
    Exponential { base: Duration, max: Option<Duration> },
}

/// Delay schedule used between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    schedule: Schedule,
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { schedule: Schedule::Constant { delay } }
    }

    /// Delay doubles with each retry, starting at `base`.
    pub fn exponential(base: Duration) -> Self {
        Self { schedule: Schedule::Exponential { base, max: None } }
    }

    /// Cap the exponential schedule at `max`. Errors on a constant schedule
    /// or when `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        match &mut self.schedule {
            Schedule::Exponential { base, max: slot } => {
                if max < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max });
                }
                *slot = Some(max);
                Ok(self)
            }
            Schedule::Constant { .. } => Err(BackoffError::ConstantDoesNotSupportMax),
        }
    }

    /// Delay before the given attempt (0 = initial call, always zero).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match &self.schedule {
            Schedule::Constant { delay } => *delay,
            Schedule::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let multiplier = 2u128.saturating_pow(exponent);
                let nanos = base.as_nanos().saturating_mul(multiplier);
                let raw = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
                max.map(|m| raw.min(m)).unwrap_or(raw).min(MAX_BACKOFF)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::exponential(Duration::from_millis(50))
    }
}
