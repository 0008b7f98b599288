//! Sliding-window counter, the primary distributed algorithm.
//!
//! Each admitted event is a timestamped entry in a per-key ordered set; the
//! store's atomic script purges expired entries, counts survivors, and admits
//! in one server-side step, so concurrent callers on the same key are
//! serialized by the store and can never both claim the last vacancy.
//!
//! `now` comes from the calling process, not the store: modest client clock
//! drift shifts window boundaries by that drift. Not corrected.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::limiter::{KeyedLimiter, Verdict};
use crate::registry::LimiterConfig;
use crate::store::CounterStore;

/// Sliding-window limiter over a shared counter store.
pub struct SlidingWindow<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: CounterStore> SlidingWindow<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Best-effort permits left in the window. Non-atomic with respect to
    /// `try_acquire`, so the answer can be stale by the time it is read;
    /// it never grants or revokes a permit.
    pub async fn remaining_permits(
        &self,
        key: &str,
        config: &LimiterConfig,
    ) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let occupancy = self
            .store
            .window_occupancy(key, now, config.window.as_millis() as u64)
            .await?;
        Ok(u64::from(config.limit).saturating_sub(occupancy))
    }
}

#[async_trait]
impl<S: CounterStore> KeyedLimiter for SlidingWindow<S> {
    async fn try_acquire(
        &self,
        key: &str,
        config: &LimiterConfig,
    ) -> Result<Verdict, StoreError> {
        let now = self.clock.now_millis();
        let window_millis = config.window.as_millis() as u64;
        let reply = self
            .store
            .check_window(key, now, window_millis, config.limit)
            .await?;

        if reply.admitted {
            // occupancy is the count before our entry was added.
            let used = reply.occupancy.saturating_add(1);
            let remaining = u64::from(config.limit).saturating_sub(used);
            return Ok(Verdict::Allowed { remaining: remaining.min(u32::MAX as u64) as u32 });
        }

        // The oldest surviving entry frees a slot when it ages out of the
        // window; without one, fall back to the full window.
        let retry_after = reply
            .oldest_entry_millis
            .map(|oldest| {
                Duration::from_millis(oldest.saturating_add(window_millis).saturating_sub(now))
            })
            .unwrap_or(config.window);
        Ok(Verdict::Denied { retry_after })
    }
}
