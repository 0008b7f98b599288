//! Shared counter store contract.
//!
//! The distributed algorithms never issue read-then-write sequences against
//! shared keys from application code; every mutation goes through one of the
//! atomic operations below. This is the seam that keeps the sliding window
//! linearizable per key: [`CounterStore::check_window`] runs purge, count,
//! admit, and TTL refresh as a single server-side unit, so two racing callers
//! can never both observe the last vacancy.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Result of one atomic sliding-window check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowReply {
    /// Whether an entry was admitted (and recorded) by this call.
    pub admitted: bool,
    /// Entries alive in the window *before* this call's entry was added.
    pub occupancy: u64,
    /// Timestamp of the oldest surviving entry, when any exist. Lets the
    /// caller estimate when the next permit frees up.
    pub oldest_entry_millis: Option<u64>,
}

/// Opaque fencing token proving lock ownership; release is a no-op for
/// anyone holding a stale token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub(crate) u64);

/// Contract the limiting algorithms need from the shared store.
///
/// Implementations must make each method atomic with respect to concurrent
/// calls on the same key. [`MemoryStore`] does this with one process-wide
/// mutex; [`RedisStore`] with server-side Lua scripts.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomic sliding-window step: drop entries scored before
    /// `now - window_millis`, count survivors, admit and record an entry at
    /// `now` iff the count is below `limit`, and refresh the key's TTL to at
    /// least `window_millis` either way.
    async fn check_window(
        &self,
        key: &str,
        now_millis: u64,
        window_millis: u64,
        limit: u32,
    ) -> Result<WindowReply, StoreError>;

    /// Best-effort count of live entries in the window. Read-only with
    /// respect to admission state, and not atomic w.r.t. `check_window`.
    async fn window_occupancy(
        &self,
        key: &str,
        now_millis: u64,
        window_millis: u64,
    ) -> Result<u64, StoreError>;

    /// Acquire a mutual-exclusion lock on `key`, waiting up to `max_wait`.
    /// The lock self-expires after `ttl` so a crashed holder cannot wedge the
    /// key. Timing out yields [`StoreError::LockTimeout`].
    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> Result<LockToken, StoreError>;

    /// Release a held lock. Stale tokens are ignored.
    async fn release_lock(&self, key: &str, token: &LockToken) -> Result<(), StoreError>;

    /// Read the fixed-window slot for `key`: `(count, window_start_millis)`.
    /// Only meaningful while holding the key's lock.
    async fn read_counter(&self, key: &str) -> Result<Option<(u64, u64)>, StoreError>;

    /// Overwrite the fixed-window slot with a fresh TTL. Only meaningful
    /// while holding the key's lock.
    async fn write_counter(
        &self,
        key: &str,
        count: u64,
        window_start_millis: u64,
        ttl: Duration,
    ) -> Result<(), StoreError>;
}
