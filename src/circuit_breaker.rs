//! Circuit breaker guarding calls to the shared counter store.
//!
//! Lock-free atomics state machine. Closed counts consecutive store
//! failures; at the threshold it opens and short-circuits every call until
//! the cooldown elapses, then lets a bounded number of half-open probes
//! through. A successful probe closes the circuit, a failed one reopens it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::{LimitError, StoreError};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Validated breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: usize,
    /// How long to stay open before probing.
    pub cooldown: Duration,
    /// Concurrent probes allowed while half-open.
    pub half_open_max_probes: usize,
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), BreakerConfigError> {
        if self.failure_threshold == 0 {
            return Err(BreakerConfigError::ZeroFailureThreshold);
        }
        if self.cooldown.is_zero() {
            return Err(BreakerConfigError::ZeroCooldown);
        }
        if self.half_open_max_probes == 0 {
            return Err(BreakerConfigError::ZeroProbeLimit);
        }
        Ok(())
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_max_probes: 1,
        }
    }
}

/// Breaker configuration errors; surfaced at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerConfigError {
    ZeroFailureThreshold,
    ZeroCooldown,
    ZeroProbeLimit,
}

impl std::fmt::Display for BreakerConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerConfigError::ZeroFailureThreshold => {
                write!(f, "failure_threshold must be > 0")
            }
            BreakerConfigError::ZeroCooldown => write!(f, "cooldown must be > 0"),
            BreakerConfigError::ZeroProbeLimit => {
                write!(f, "half_open_max_probes must be > 0")
            }
        }
    }
}

impl std::error::Error for BreakerConfigError {}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    opened_at_millis: AtomicU64,
    probes_in_flight: AtomicUsize,
}

/// Circuit breaker for store calls. Clones share state, so every handle
/// observes the same transitions.
#[derive(Debug, Clone)]
pub struct Breaker {
    shared: Arc<Shared>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl Breaker {
    pub fn new(config: BreakerConfig) -> Result<Self, BreakerConfigError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(STATE_CLOSED),
                consecutive_failures: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                probes_in_flight: AtomicUsize::new(0),
            }),
            config,
            clock: Arc::new(SystemClock),
        })
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> BreakerState {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// Run a store call under breaker protection. An open circuit rejects
    /// with [`LimitError::CircuitOpen`] without touching the store.
    pub async fn call<T, Fut, Op>(&self, operation: Op) -> Result<T, LimitError>
    where
        T: Send,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        // Decrements the probe count even if the future is dropped mid-call.
        struct ProbeGuard<'a> {
            shared: &'a Shared,
            armed: bool,
        }
        impl Drop for ProbeGuard<'_> {
            fn drop(&mut self) {
                if self.armed {
                    self.shared.probes_in_flight.fetch_sub(1, Ordering::Release);
                }
            }
        }
        let mut probe: Option<ProbeGuard<'_>> = None;

        loop {
            match self.shared.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_at = self.shared.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    if elapsed < self.config.cooldown.as_millis() as u64 {
                        return Err(self.rejection(elapsed));
                    }
                    // Cooldown over; first caller through flips to half-open.
                    match self.shared.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            tracing::info!("counter store circuit half-open, probing");
                            self.shared.probes_in_flight.store(1, Ordering::Release);
                            probe = Some(ProbeGuard { shared: &self.shared, armed: true });
                            break;
                        }
                        Err(_) => continue, // lost the race; re-evaluate
                    }
                }
                STATE_HALF_OPEN => {
                    let in_flight =
                        self.shared.probes_in_flight.fetch_add(1, Ordering::AcqRel);
                    if in_flight >= self.config.half_open_max_probes {
                        self.shared.probes_in_flight.fetch_sub(1, Ordering::Release);
                        let opened_at =
                            self.shared.opened_at_millis.load(Ordering::Acquire);
                        let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                        return Err(self.rejection(elapsed));
                    }
                    probe = Some(ProbeGuard { shared: &self.shared, armed: true });
                    break;
                }
                _ => break, // closed: normal operation
            }
        }

        let result = operation().await;
        drop(probe);

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result.map_err(LimitError::Store)
    }

    fn rejection(&self, elapsed_millis: u64) -> LimitError {
        LimitError::CircuitOpen {
            failures: self.shared.consecutive_failures.load(Ordering::Acquire),
            open_for: Duration::from_millis(elapsed_millis),
        }
    }

    fn on_success(&self) {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.shared.consecutive_failures.store(0, Ordering::Release);
                    self.shared.probes_in_flight.store(0, Ordering::Release);
                    tracing::info!("counter store circuit closed");
                }
            }
            STATE_CLOSED => {
                self.shared.consecutive_failures.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let failures = self.shared.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        match self.shared.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.shared.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    self.shared.probes_in_flight.store(0, Ordering::Release);
                    tracing::warn!(failures, "counter store probe failed, circuit reopened");
                }
            }
            STATE_CLOSED if failures >= self.config.failure_threshold => {
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_CLOSED,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.shared.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::error!(
                        failures,
                        threshold = self.config.failure_threshold,
                        "counter store circuit opened"
                    );
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn breaker(threshold: usize, cooldown_millis: u64) -> (Breaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = Breaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_millis),
            half_open_max_probes: 1,
        })
        .unwrap()
        .with_clock(clock.clone());
        (breaker, clock)
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable("refused".into())
    }

    #[test]
    fn rejects_zero_config_values() {
        let zero_threshold = BreakerConfig { failure_threshold: 0, ..BreakerConfig::default() };
        assert_eq!(
            Breaker::new(zero_threshold).unwrap_err(),
            BreakerConfigError::ZeroFailureThreshold
        );
        let zero_cooldown = BreakerConfig { cooldown: Duration::ZERO, ..BreakerConfig::default() };
        assert_eq!(Breaker::new(zero_cooldown).unwrap_err(), BreakerConfigError::ZeroCooldown);
        let zero_probes =
            BreakerConfig { half_open_max_probes: 0, ..BreakerConfig::default() };
        assert_eq!(Breaker::new(zero_probes).unwrap_err(), BreakerConfigError::ZeroProbeLimit);
    }

    #[tokio::test]
    async fn starts_closed_and_passes_calls() {
        let (breaker, _clock) = breaker(3, 1_000);
        let value = breaker.call(|| async { Ok::<_, StoreError>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_and_short_circuits() {
        let (breaker, _clock) = breaker(3, 1_000);
        for _ in 0..3 {
            let _ = breaker.call(|| async { Err::<(), _>(unavailable()) }).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result = breaker
            .call(|| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, StoreError>(())
                }
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0, "open circuit must not call the store");
    }

    #[tokio::test]
    async fn success_in_closed_state_resets_the_streak() {
        let (breaker, _clock) = breaker(3, 1_000);
        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<(), _>(unavailable()) }).await;
        }
        breaker.call(|| async { Ok::<_, StoreError>(()) }).await.unwrap();
        for _ in 0..2 {
            let result = breaker.call(|| async { Err::<(), _>(unavailable()) }).await;
            assert!(matches!(result, Err(LimitError::Store(_))));
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn successful_probe_closes_after_cooldown() {
        let (breaker, clock) = breaker(1, 1_000);
        let _ = breaker.call(|| async { Err::<(), _>(unavailable()) }).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        clock.advance(1_500);
        breaker.call(|| async { Ok::<_, StoreError>(()) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let (breaker, clock) = breaker(1, 1_000);
        let _ = breaker.call(|| async { Err::<(), _>(unavailable()) }).await;
        clock.advance(1_500);
        let _ = breaker.call(|| async { Err::<(), _>(unavailable()) }).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        let result = breaker.call(|| async { Ok::<_, StoreError>(()) }).await;
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn half_open_bounds_concurrent_probes() {
        let (breaker, clock) = breaker(1, 100);
        let _ = breaker.call(|| async { Err::<(), _>(unavailable()) }).await;
        clock.advance(200);

        let barrier = Arc::new(tokio::sync::Barrier::new(3));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let breaker = breaker.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                breaker
                    .call(|| async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, StoreError>(())
                    })
                    .await
            }));
        }
        let results = futures::future::join_all(handles).await;
        let successes =
            results.iter().filter(|r| r.as_ref().expect("join").is_ok()).count();
        assert_eq!(successes, 1, "only one probe may pass while half-open");
    }
}
