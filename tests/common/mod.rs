#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use floodgate::{
    CounterStore, LimiterConfig, LimiterRegistry, LockToken, MemoryStore, StoreError, WindowReply,
};

/// Counter store with failure injection: fail the next N calls, or go down
/// entirely until told otherwise. Healthy calls delegate to a real
/// [`MemoryStore`], so recovery scenarios keep their window state.
#[derive(Debug, Clone)]
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    fail_next: Arc<AtomicUsize>,
    down: Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_next: Arc::new(AtomicUsize::new(0)),
            down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fail the next `n` store calls with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Take the store down (or bring it back) for every call.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is down".into()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn check_window(
        &self,
        key: &str,
        now_millis: u64,
        window_millis: u64,
        limit: u32,
    ) -> Result<WindowReply, StoreError> {
        self.check()?;
        self.inner.check_window(key, now_millis, window_millis, limit).await
    }

    async fn window_occupancy(
        &self,
        key: &str,
        now_millis: u64,
        window_millis: u64,
    ) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.window_occupancy(key, now_millis, window_millis).await
    }

    async fn acquire_lock(
        &self,
        key: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> Result<LockToken, StoreError> {
        self.check()?;
        self.inner.acquire_lock(key, ttl, max_wait).await
    }

    async fn release_lock(&self, key: &str, token: &LockToken) -> Result<(), StoreError> {
        self.check()?;
        self.inner.release_lock(key, token).await
    }

    async fn read_counter(&self, key: &str) -> Result<Option<(u64, u64)>, StoreError> {
        self.check()?;
        self.inner.read_counter(key).await
    }

    async fn write_counter(
        &self,
        key: &str,
        count: u64,
        window_start_millis: u64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.write_counter(key, count, window_start_millis, ttl).await
    }
}

/// Route crate logs through the test harness so failures come with context.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Registry used across the integration scenarios: strict `auth` budget plus
/// a permissive `default`.
pub fn standard_registry() -> LimiterRegistry {
    LimiterRegistry::new()
        .register("auth", LimiterConfig::new(Duration::from_secs(60), 5, "rl"))
        .expect("valid auth entry")
        .register("default", LimiterConfig::new(Duration::from_secs(60), 100, "rl"))
        .expect("valid default entry")
}
