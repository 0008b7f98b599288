//! Fixed-window counter behind a distributed lock.
//!
//! Fallback coordination for stores without a scripted-execution primitive:
//! a per-key mutual-exclusion lock makes the read-reset-or-increment step
//! atomic across processes. Known approximation: windows are fixed, not
//! sliding, so a burst straddling a window edge can pass up to twice the
//! limit. Prefer [`SlidingWindow`](crate::sliding_window::SlidingWindow)
//! where scripting is available.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::limiter::{KeyedLimiter, Verdict};
use crate::registry::LimiterConfig;
use crate::store::CounterStore;

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(3);

/// Fixed-window limiter: atomic counter guarded by a per-key lock.
pub struct FixedWindow<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    lock_ttl: Duration,
    lock_wait: Duration,
}

impl<S: CounterStore> FixedWindow<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, lock_ttl: DEFAULT_LOCK_TTL, lock_wait: DEFAULT_LOCK_WAIT }
    }

    /// Bound the wait for the per-key lock. The lock's own TTL stays above
    /// the wait so a crashed holder cannot wedge the key.
    pub fn with_lock_bounds(mut self, ttl: Duration, max_wait: Duration) -> Self {
        self.lock_ttl = ttl;
        self.lock_wait = max_wait;
        self
    }

    async fn admit(&self, key: &str, config: &LimiterConfig) -> Result<Verdict, StoreError> {
        let now = self.clock.now_millis();
        let window_millis = config.window.as_millis() as u64;
        // Counter outlives the window slightly so a straggling read still
        // sees the closing state instead of a fresh slot.
        let ttl = config.window.saturating_add(Duration::from_secs(1));

        let verdict = match self.store.read_counter(key).await? {
            Some((count, window_start))
                if now.saturating_sub(window_start) < window_millis =>
            {
                if count < u64::from(config.limit) {
                    self.store.write_counter(key, count + 1, window_start, ttl).await?;
                    let remaining = u64::from(config.limit).saturating_sub(count + 1);
                    Verdict::Allowed { remaining: remaining.min(u32::MAX as u64) as u32 }
                } else {
                    let window_end = window_start.saturating_add(window_millis);
                    Verdict::Denied {
                        retry_after: Duration::from_millis(window_end.saturating_sub(now)),
                    }
                }
            }
            // Missing or elapsed: start a fresh window with this event.
            _ => {
                self.store.write_counter(key, 1, now, ttl).await?;
                Verdict::Allowed { remaining: config.limit.saturating_sub(1) }
            }
        };
        Ok(verdict)
    }
}

#[async_trait]
impl<S: CounterStore> KeyedLimiter for FixedWindow<S> {
    /// Lock-acquisition timeout surfaces as [`StoreError::LockTimeout`]:
    /// a coordination failure for the fail policy to resolve, never a
    /// silent deny.
    async fn try_acquire(
        &self,
        key: &str,
        config: &LimiterConfig,
    ) -> Result<Verdict, StoreError> {
        let lock_key = format!("{}.lock", key);
        let token = self.store.acquire_lock(&lock_key, self.lock_ttl, self.lock_wait).await?;

        let outcome = self.admit(key, config).await;

        // Release on every path; a failed release is reclaimed by the TTL.
        if let Err(err) = self.store.release_lock(&lock_key, &token).await {
            tracing::warn!(key, error = %err, "failed to release rate-limit lock");
        }
        outcome
    }
}
