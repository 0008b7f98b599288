//! In-process [`CounterStore`] backend.
//!
//! One mutex over all state gives the same atomicity the Redis scripts give:
//! each trait method is a single critical section. Suitable for tests and for
//! single-instance deployments where cross-process coordination is not
//! needed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::store::{CounterStore, LockToken, WindowReply};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, Default)]
struct WindowSlot {
    /// Entry timestamps, ascending.
    entries: Vec<u64>,
    expires_at: u64,
}

#[derive(Debug)]
struct CounterSlot {
    count: u64,
    window_start: u64,
    expires_at: u64,
}

#[derive(Debug)]
struct LockSlot {
    token: u64,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct State {
    windows: HashMap<String, WindowSlot>,
    counters: HashMap<String, CounterSlot>,
    locks: HashMap<String, LockSlot>,
}

/// In-memory counter store. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    next_token: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use an injected clock for lock/counter TTL bookkeeping (tests).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            next_token: Arc::new(AtomicU64::new(1)),
            clock,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        // Lock poisoning only happens if a store method panicked; the state
        // is still structurally sound, so keep serving.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_take_lock(&self, key: &str, ttl: Duration) -> Option<LockToken> {
        let now = self.clock.now_millis();
        let mut state = self.lock_state();
        match state.locks.get(key) {
            Some(slot) if slot.expires_at > now => None,
            _ => {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                state.locks.insert(
                    key.to_string(),
                    LockSlot { token, expires_at: now.saturating_add(ttl.as_millis() as u64) },
                );
                Some(LockToken(token))
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn check_window(
        &self,
        key: &str,
        now_millis: u64,
        window_millis: u64,
        limit: u32,
    ) -> Result<WindowReply, StoreError> {
        let cutoff = now_millis.saturating_sub(window_millis);
        let mut state = self.lock_state();
        let slot = state.windows.entry(key.to_string()).or_default();

        if slot.expires_at != 0 && slot.expires_at <= now_millis {
            slot.entries.clear();
        }
        slot.entries.retain(|&ts| ts >= cutoff);

        let occupancy = slot.entries.len() as u64;
        let admitted = occupancy < u64::from(limit);
        if admitted {
            // ManualClock can stand still, so an equal timestamp is possible;
            // position the entry to keep the vector ascending.
            let at = slot.entries.partition_point(|&ts| ts <= now_millis);
            slot.entries.insert(at, now_millis);
        }
        slot.expires_at = now_millis.saturating_add(window_millis);

        Ok(WindowReply {
            admitted,
            occupancy,
            oldest_entry_millis: slot.entries.first().copied(),
        })
    }

    async fn window_occupancy(
        &self,
        key: &str,
        now_millis: u64,
        window_millis: u64,
    ) -> Result<u64, StoreError> {
        let cutoff = now_millis.saturating_sub(window_millis);
        let state = self.lock_state();
        Ok(state
            .windows
            .get(key)
            .map(|slot| slot.entries.iter().filter(|&&ts| ts >= cutoff).count() as u64)
            .unwrap_or(0))
    }

    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> Result<LockToken, StoreError> {
        let started = tokio::time::Instant::now();
        loop {
            if let Some(token) = self.try_take_lock(key, ttl) {
                return Ok(token);
            }
            if started.elapsed() >= max_wait {
                return Err(StoreError::LockTimeout {
                    key: key.to_string(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    async fn release_lock(&self, key: &str, token: &LockToken) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        if state.locks.get(key).is_some_and(|slot| slot.token == token.0) {
            state.locks.remove(key);
        }
        Ok(())
    }

    async fn read_counter(&self, key: &str) -> Result<Option<(u64, u64)>, StoreError> {
        let now = self.clock.now_millis();
        let state = self.lock_state();
        Ok(state
            .counters
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| (slot.count, slot.window_start)))
    }

    async fn write_counter(
        &self,
        key: &str,
        count: u64,
        window_start_millis: u64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.lock_state();
        state.counters.insert(
            key.to_string(),
            CounterSlot {
                count,
                window_start: window_start_millis,
                expires_at: now.saturating_add(ttl.as_millis() as u64),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn window_admits_up_to_limit_then_denies() {
        let store = MemoryStore::new();
        for i in 0..3 {
            let reply = store.check_window("k", 1_000, 60_000, 3).await.unwrap();
            assert!(reply.admitted, "entry {} should be admitted", i);
            assert_eq!(reply.occupancy, i);
        }
        let reply = store.check_window("k", 1_000, 60_000, 3).await.unwrap();
        assert!(!reply.admitted);
        assert_eq!(reply.occupancy, 3);
        assert_eq!(reply.oldest_entry_millis, Some(1_000));
    }

    #[tokio::test]
    async fn window_purges_expired_entries() {
        let store = MemoryStore::new();
        assert!(store.check_window("k", 1_000, 5_000, 1).await.unwrap().admitted);
        assert!(!store.check_window("k", 2_000, 5_000, 1).await.unwrap().admitted);
        // 1_000 falls out of the window at 6_001.
        assert!(store.check_window("k", 6_100, 5_000, 1).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn occupancy_is_read_only() {
        let store = MemoryStore::new();
        store.check_window("k", 1_000, 10_000, 5).await.unwrap();
        assert_eq!(store.window_occupancy("k", 1_000, 10_000).await.unwrap(), 1);
        assert_eq!(store.window_occupancy("k", 1_000, 10_000).await.unwrap(), 1);
        assert_eq!(store.window_occupancy("missing", 1_000, 10_000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);
        let token = store.acquire_lock("L", ttl, Duration::ZERO).await.unwrap();

        let contender = store.acquire_lock("L", ttl, Duration::ZERO).await;
        assert!(matches!(contender, Err(StoreError::LockTimeout { .. })));

        store.release_lock("L", &token).await.unwrap();
        store.acquire_lock("L", ttl, Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn stale_token_does_not_release() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);
        let first = store.acquire_lock("L", ttl, Duration::ZERO).await.unwrap();
        store.release_lock("L", &first).await.unwrap();
        let second = store.acquire_lock("L", ttl, Duration::ZERO).await.unwrap();

        // Releasing with the first (stale) token must not free the lock.
        store.release_lock("L", &first).await.unwrap();
        assert!(store.acquire_lock("L", ttl, Duration::ZERO).await.is_err());

        store.release_lock("L", &second).await.unwrap();
    }

    #[tokio::test]
    async fn expired_lock_can_be_retaken() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::with_clock(clock.clone());
        let _held = store
            .acquire_lock("L", Duration::from_millis(100), Duration::ZERO)
            .await
            .unwrap();
        clock.advance(150);
        store
            .acquire_lock("L", Duration::from_millis(100), Duration::ZERO)
            .await
            .expect("ttl should have reclaimed the lock");
    }

    #[tokio::test]
    async fn counter_round_trip_and_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::with_clock(clock.clone());
        store.write_counter("c", 4, 123, Duration::from_millis(500)).await.unwrap();
        assert_eq!(store.read_counter("c").await.unwrap(), Some((4, 123)));
        clock.advance(600);
        assert_eq!(store.read_counter("c").await.unwrap(), None);
    }
}
