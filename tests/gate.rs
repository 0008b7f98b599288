mod common;

use std::sync::Arc;
use std::time::Duration;

use floodgate::{
    Backoff, BreakerConfig, BreakerState, InMemoryMetrics, InstantSleeper, Jitter, ManualClock,
    MemoryStore, Outcome, OutcomeKind, RateLimitGate, RetryPolicy,
};

use common::{init_tracing, standard_registry, FlakyStore};

fn fast_retry(attempts: usize) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(attempts)
        .backoff(Backoff::constant(Duration::from_millis(1)))
        .jitter(Jitter::None)
        .sleeper(Arc::new(InstantSleeper))
        .build()
        .expect("valid retry policy")
}

struct Fixture {
    gate: RateLimitGate<FlakyStore>,
    store: FlakyStore,
    clock: Arc<ManualClock>,
    metrics: InMemoryMetrics,
}

fn fixture(fail_open: bool) -> Fixture {
    init_tracing();
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = FlakyStore::new(Arc::new(MemoryStore::with_clock(clock.clone())));
    let metrics = InMemoryMetrics::new();
    let gate = RateLimitGate::builder(Arc::new(store.clone()))
        .registry(standard_registry())
        .retry(fast_retry(3))
        .breaker_config(BreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_max_probes: 1,
        })
        .fail_open(fail_open)
        .clock(clock.clone())
        .metrics(Arc::new(metrics.clone()))
        .build()
        .expect("gate builds");
    Fixture { gate, store, clock, metrics }
}

#[tokio::test]
async fn budget_is_enforced_and_window_slides() {
    let f = fixture(true);
    for _ in 0..5 {
        assert_eq!(f.gate.check("auth", "user1").await, Outcome::Allowed);
    }
    match f.gate.check("auth", "user1").await {
        Outcome::Denied { retry_after } => {
            assert!(retry_after <= Duration::from_secs(60));
            assert!(retry_after > Duration::ZERO);
        }
        other => panic!("expected Denied, got {:?}", other),
    }

    // Another identity is unaffected.
    assert_eq!(f.gate.check("auth", "user2").await, Outcome::Allowed);

    // After the window passes the original identity has budget again.
    f.clock.advance(61_000);
    assert_eq!(f.gate.check("auth", "user1").await, Outcome::Allowed);

    assert_eq!(f.metrics.count("auth", OutcomeKind::Allowed), 7);
    assert_eq!(f.metrics.count("auth", OutcomeKind::Denied), 1);
}

#[tokio::test]
async fn transient_blip_is_retried_without_losing_the_verdict() {
    let f = fixture(true);
    // Two injected failures, third attempt lands on a healthy store.
    f.store.fail_next(2);
    assert_eq!(f.gate.check("auth", "user1").await, Outcome::Allowed);
    // The verdict came from the store, so it counts as Allowed, not FailedOpen.
    assert_eq!(f.metrics.count("auth", OutcomeKind::Allowed), 1);
    assert_eq!(f.metrics.count("auth", OutcomeKind::FailedOpen), 0);
    // And it consumed budget like any admission.
    assert_eq!(f.gate.remaining_permits("auth", "user1").await.unwrap(), 4);
}

#[tokio::test]
async fn fail_open_admits_every_check_and_counts_each_one() {
    let f = fixture(true);
    f.store.set_down(true);
    for _ in 0..4 {
        assert_eq!(f.gate.check("auth", "user1").await, Outcome::Allowed);
    }
    assert_eq!(f.metrics.count("auth", OutcomeKind::FailedOpen), 4);
    assert_eq!(f.metrics.count("auth", OutcomeKind::Allowed), 0);
    assert_eq!(f.metrics.count("auth", OutcomeKind::Denied), 0);
}

#[tokio::test]
async fn fail_closed_reports_unavailable_never_denied() {
    let f = fixture(false);
    f.store.set_down(true);
    for _ in 0..3 {
        assert_eq!(f.gate.check("auth", "user1").await, Outcome::Unavailable);
    }
    assert_eq!(f.metrics.count("auth", OutcomeKind::FailedClosed), 3);
    assert_eq!(f.metrics.count("auth", OutcomeKind::Denied), 0);
    assert_eq!(f.metrics.count("auth", OutcomeKind::Allowed), 0);
}

#[tokio::test]
async fn breaker_opens_under_outage_and_recovers_with_the_store() {
    let f = fixture(true);
    f.store.set_down(true);

    // Two checks of three attempts each push the failure streak past five.
    f.gate.check("auth", "user1").await;
    f.gate.check("auth", "user1").await;
    assert_eq!(f.gate.breaker_state(), BreakerState::Open);

    // While open, checks resolve by policy without touching the store.
    assert_eq!(f.gate.check("auth", "user1").await, Outcome::Allowed);

    // Store comes back; after the cooldown one probe closes the circuit.
    f.store.set_down(false);
    f.clock.advance(31_000);
    assert_eq!(f.gate.check("auth", "user1").await, Outcome::Allowed);
    assert_eq!(f.gate.breaker_state(), BreakerState::Closed);

    // Normal limiting resumes, remembering the probe's admission.
    for _ in 0..4 {
        assert_eq!(f.gate.check("auth", "user1").await, Outcome::Allowed);
    }
    assert!(matches!(f.gate.check("auth", "user1").await, Outcome::Denied { .. }));
}

#[tokio::test]
async fn unknown_limiter_name_uses_the_default_budget() {
    let f = fixture(true);
    for _ in 0..100 {
        assert_eq!(f.gate.check("captcha", "1.2.3.4").await, Outcome::Allowed);
    }
    assert!(matches!(f.gate.check("captcha", "1.2.3.4").await, Outcome::Denied { .. }));
    assert_eq!(f.metrics.count("captcha", OutcomeKind::Allowed), 100);
}

#[tokio::test]
async fn remaining_permits_is_read_only() {
    let f = fixture(true);
    f.gate.check("auth", "user1").await;
    for _ in 0..10 {
        assert_eq!(f.gate.remaining_permits("auth", "user1").await.unwrap(), 4);
    }
}
