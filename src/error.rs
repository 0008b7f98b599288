//! Error taxonomy for rate-limit checks.
//!
//! A denied request is *not* an error; algorithms report it as
//! [`Verdict::Denied`](crate::limiter::Verdict) so it can never be retried by
//! accident. Errors here describe the limiter's own machinery failing.

use std::time::Duration;
use thiserror::Error;

/// Failures talking to the shared counter store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Transient I/O or connection failure; eligible for retry.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The bounded wait for a distributed lock expired. A coordination
    /// failure, not a denial; handled by the fail-open/fail-closed policy.
    #[error("timed out after {waited:?} waiting for lock on `{key}`")]
    LockTimeout { key: String, waited: Duration },
}

impl StoreError {
    /// Whether a retry could plausibly succeed. Lock timeouts already
    /// consumed their wait budget and are not retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Terminal failure of a resilience-wrapped limiter call.
#[derive(Debug, Clone, Error)]
pub enum LimitError {
    /// The store call failed and was not (or could not be) retried.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The circuit breaker is open; the store was not contacted.
    #[error("circuit breaker open ({failures} consecutive failures, open for {open_for:?})")]
    CircuitOpen { failures: usize, open_for: Duration },

    /// Every retry attempt failed with a transient store error.
    #[error("retry budget exhausted after {attempts} attempts; last error: {last}")]
    RetryExhausted { attempts: usize, last: StoreError },
}

impl LimitError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, LimitError::CircuitOpen { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, LimitError::RetryExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_transient() {
        assert!(StoreError::Unavailable("boom".into()).is_transient());
        let timeout = StoreError::LockTimeout {
            key: "auth:1.2.3.4".into(),
            waited: Duration::from_secs(3),
        };
        assert!(!timeout.is_transient());
    }

    #[test]
    fn display_carries_context() {
        let err = LimitError::RetryExhausted {
            attempts: 3,
            last: StoreError::Unavailable("connection refused".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("connection refused"));

        let open = LimitError::CircuitOpen { failures: 5, open_for: Duration::from_secs(2) };
        assert!(open.to_string().contains("5 consecutive failures"));
    }

    #[test]
    fn predicates_discriminate_variants() {
        let open = LimitError::CircuitOpen { failures: 1, open_for: Duration::ZERO };
        assert!(open.is_circuit_open());
        assert!(!open.is_retry_exhausted());

        let exhausted = LimitError::RetryExhausted {
            attempts: 2,
            last: StoreError::Unavailable("x".into()),
        };
        assert!(exhausted.is_retry_exhausted());
    }
}
