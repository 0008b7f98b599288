//! Bounded retry for transient store failures.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial call + retries).
//! - Only transient store errors ([`StoreError::is_transient`]) are retried;
//!   lock timeouts and circuit-open rejections return immediately.
//! - A `Denied` verdict is an `Ok` value and is therefore never retried.
//! - Delays come from [`Backoff`] randomized by [`Jitter`], applied through a
//!   [`Sleeper`] so tests run without real waiting.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::{LimitError, StoreError};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Retry policy for store-touching limiter calls.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish()
    }
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryBuildError {
    ZeroAttempts,
}

impl std::fmt::Display for RetryBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryBuildError::ZeroAttempts => write!(f, "max_attempts must be > 0"),
        }
    }
}

impl std::error::Error for RetryBuildError {}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::constant(Duration::ZERO),
            jitter: Jitter::None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Execute `operation`, retrying transient failures up to the budget.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, LimitError>
    where
        T: Send,
        Fut: Future<Output = Result<T, LimitError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut last: Option<StoreError> = None;
        for attempt in 0..self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(LimitError::Store(err)) if err.is_transient() => {
                    tracing::debug!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "transient store failure"
                    );
                    last = Some(err);
                    if attempt + 1 >= self.max_attempts {
                        break;
                    }
                    let delay = self.jitter.apply(self.backoff.delay(attempt + 1));
                    self.sleeper.sleep(delay).await;
                }
                // Lock timeouts, circuit-open, prior exhaustion: not ours.
                Err(other) => return Err(other),
            }
        }
        // `last` is always set here: the loop only breaks after recording a
        // transient error, and max_attempts > 0 guarantees one iteration.
        Err(LimitError::RetryExhausted {
            attempts: self.max_attempts,
            last: last.unwrap_or_else(|| StoreError::Unavailable("no attempt recorded".into())),
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::new().build().unwrap_or_else(|_| RetryPolicy::no_retries())
    }
}

/// Builder with validation.
pub struct RetryPolicyBuilder {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            jitter: Jitter::Full,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> Result<RetryPolicy, RetryBuildError> {
        if self.max_attempts == 0 {
            return Err(RetryBuildError::ZeroAttempts);
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            sleeper: self.sleeper,
        })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
