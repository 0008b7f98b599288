//! The inbound facade: limiter admission wrapped in the resilience shell.
//!
//! One call composes the store key, runs the configured algorithm under
//! retry, circuit breaker, and a per-attempt timeout, and translates whatever
//! comes back into an [`Outcome`] the caller can map straight onto a
//! response. Store trouble never surfaces as an error here: the
//! fail-open/fail-closed policy resolves it, exactly once, in this module.

use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{Backoff, BackoffError};
use crate::circuit_breaker::{Breaker, BreakerConfig, BreakerConfigError};
use crate::clock::{Clock, SystemClock};
use crate::config::{Settings, Strategy};
use crate::error::{LimitError, StoreError};
use crate::fixed_window::FixedWindow;
use crate::limiter::{KeyedLimiter, Verdict};
use crate::metrics::{MetricsSink, NoopMetrics, OutcomeKind};
use crate::registry::{CheckRequest, LimiterConfig, LimiterRegistry, RegistryError, KEY_SEPARATOR};
use crate::retry::{RetryBuildError, RetryPolicy};
use crate::sliding_window::SlidingWindow;
use crate::store::CounterStore;

/// What the caller should do with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Within limits; let it through.
    Allowed,
    /// Over the limit; refuse it (HTTP 429 territory).
    Denied { retry_after: Duration },
    /// The limiter itself is unavailable and policy is fail-closed
    /// (HTTP 503 territory). Distinct from `Denied` so operators can tell
    /// limited users from a broken limiter.
    Unavailable,
}

impl Outcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Outcome::Allowed)
    }
}

/// Errors assembling a gate. All caught at startup.
#[derive(Debug)]
pub enum GateBuildError {
    Registry(RegistryError),
    Breaker(BreakerConfigError),
    Backoff(BackoffError),
    Retry(RetryBuildError),
    /// No limiter entries at all: every check would fail to resolve.
    EmptyRegistry,
}

impl std::fmt::Display for GateBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateBuildError::Registry(err) => write!(f, "{}", err),
            GateBuildError::Breaker(err) => write!(f, "{}", err),
            GateBuildError::Backoff(err) => write!(f, "{}", err),
            GateBuildError::Retry(err) => write!(f, "{}", err),
            GateBuildError::EmptyRegistry => {
                write!(f, "gate needs at least one limiter entry")
            }
        }
    }
}

impl std::error::Error for GateBuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GateBuildError::Registry(err) => Some(err),
            GateBuildError::Breaker(err) => Some(err),
            GateBuildError::Backoff(err) => Some(err),
            GateBuildError::Retry(err) => Some(err),
            GateBuildError::EmptyRegistry => None,
        }
    }
}

impl From<RegistryError> for GateBuildError {
    fn from(err: RegistryError) -> Self {
        GateBuildError::Registry(err)
    }
}

impl From<BreakerConfigError> for GateBuildError {
    fn from(err: BreakerConfigError) -> Self {
        GateBuildError::Breaker(err)
    }
}

impl From<BackoffError> for GateBuildError {
    fn from(err: BackoffError) -> Self {
        GateBuildError::Backoff(err)
    }
}

impl From<RetryBuildError> for GateBuildError {
    fn from(err: RetryBuildError) -> Self {
        GateBuildError::Retry(err)
    }
}

enum Algorithm<S> {
    Sliding(SlidingWindow<S>),
    Fixed(FixedWindow<S>),
}

impl<S: CounterStore> Algorithm<S> {
    async fn try_acquire(
        &self,
        key: &str,
        config: &LimiterConfig,
    ) -> Result<Verdict, StoreError> {
        match self {
            Algorithm::Sliding(window) => window.try_acquire(key, config).await,
            Algorithm::Fixed(window) => window.try_acquire(key, config).await,
        }
    }
}

impl<S> std::fmt::Debug for RateLimitGate<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitGate")
            .field("call_timeout", &self.call_timeout)
            .field("fail_open", &self.fail_open)
            .finish_non_exhaustive()
    }
}

/// Rate-limit facade over a shared counter store.
pub struct RateLimitGate<S> {
    registry: LimiterRegistry,
    algorithm: Algorithm<S>,
    store: Arc<S>,
    breaker: Breaker,
    retry: RetryPolicy,
    call_timeout: Duration,
    fail_open: bool,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl<S: CounterStore> RateLimitGate<S> {
    pub fn builder(store: Arc<S>) -> GateBuilder<S> {
        GateBuilder::new(store)
    }

    /// Assemble a gate from declarative [`Settings`].
    pub fn from_settings(store: Arc<S>, settings: &Settings) -> Result<Self, GateBuildError> {
        let backoff = Backoff::exponential(Duration::from_millis(settings.retry.backoff_base_ms))
            .with_max(Duration::from_millis(settings.retry.backoff_cap_ms))?;
        let retry = RetryPolicy::builder()
            .max_attempts(settings.retry.max_attempts)
            .backoff(backoff)
            .build()?;

        GateBuilder::new(store)
            .registry(settings.registry()?)
            .strategy(settings.strategy)
            .breaker_config(settings.breaker_config()?)
            .retry(retry)
            .call_timeout(settings.call_timeout())
            .fail_open(settings.fail_open)
            .lock_bounds(settings.lock_ttl(), settings.lock_wait())
            .build()
    }

    /// Run an admission check and resolve every failure into an [`Outcome`].
    pub async fn check(&self, limiter: &str, identifier: &str) -> Outcome {
        self.check_request(&CheckRequest::new(limiter, identifier)).await
    }

    /// Legacy entry point for callers still composing flat keys.
    pub async fn check_key(&self, key: &str) -> Outcome {
        self.check_request(&CheckRequest::parse_key(key)).await
    }

    pub async fn check_request(&self, request: &CheckRequest) -> Outcome {
        let Some(config) = self.registry.config_for(&request.limiter) else {
            // Misconfiguration discovered at request time. No store was
            // touched, but the caller still needs an answer; the fail
            // policy decides it.
            tracing::error!(
                limiter = %request.limiter,
                "no configuration and no `default` entry for limiter"
            );
            return self.resolve_failure(
                &request.limiter,
                &LimitError::Store(StoreError::Unavailable(format!(
                    "limiter `{}` is not configured",
                    request.limiter
                ))),
            );
        };
        let key = self.compose_key(config, request);

        match self.guarded_acquire(&key, config).await {
            Ok(Verdict::Allowed { remaining }) => {
                tracing::debug!(limiter = %request.limiter, key = %key, remaining, "allowed");
                self.metrics.record(&request.limiter, OutcomeKind::Allowed);
                Outcome::Allowed
            }
            Ok(Verdict::Denied { retry_after }) => {
                tracing::debug!(
                    limiter = %request.limiter,
                    key = %key,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "denied"
                );
                self.metrics.record(&request.limiter, OutcomeKind::Denied);
                Outcome::Denied { retry_after }
            }
            Err(err) => self.resolve_failure(&request.limiter, &err),
        }
    }

    /// Best-effort permits left for one identity. Diagnostic only; the
    /// answer can be stale by the time it is read.
    pub async fn remaining_permits(
        &self,
        limiter: &str,
        identifier: &str,
    ) -> Result<u64, LimitError> {
        let request = CheckRequest::new(limiter, identifier);
        let config = self.registry.config_for(&request.limiter).ok_or_else(|| {
            LimitError::Store(StoreError::Unavailable(format!(
                "limiter `{}` is not configured",
                request.limiter
            )))
        })?;
        let key = self.compose_key(config, &request);
        let now = self.clock.now_millis();
        match &self.algorithm {
            Algorithm::Sliding(window) => Ok(window.remaining_permits(&key, config).await?),
            Algorithm::Fixed(_) => {
                let window_millis = config.window.as_millis() as u64;
                let used = match self.store.read_counter(&key).await? {
                    Some((count, start)) if now.saturating_sub(start) < window_millis => count,
                    _ => 0,
                };
                Ok(u64::from(config.limit).saturating_sub(used))
            }
        }
    }

    pub fn breaker_state(&self) -> crate::circuit_breaker::BreakerState {
        self.breaker.state()
    }

    fn compose_key(&self, config: &LimiterConfig, request: &CheckRequest) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            config.key_prefix,
            request.limiter,
            request.identifier,
            sep = KEY_SEPARATOR
        )
    }

    async fn guarded_acquire(
        &self,
        key: &str,
        config: &LimiterConfig,
    ) -> Result<Verdict, LimitError> {
        self.retry.execute(|| self.guarded_attempt(key, config)).await
    }

    /// One attempt: breaker around a time-bounded algorithm call.
    async fn guarded_attempt(
        &self,
        key: &str,
        config: &LimiterConfig,
    ) -> Result<Verdict, LimitError> {
        self.breaker
            .call(|| async move {
                match tokio::time::timeout(
                    self.call_timeout,
                    self.algorithm.try_acquire(key, config),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Unavailable(format!(
                        "store call exceeded {:?}",
                        self.call_timeout
                    ))),
                }
            })
            .await
    }

    /// The single place a terminal limiter failure becomes an [`Outcome`].
    fn resolve_failure(&self, limiter: &str, err: &LimitError) -> Outcome {
        if self.fail_open {
            tracing::warn!(limiter, error = %err, "rate limiter unavailable, failing open");
            self.metrics.record(limiter, OutcomeKind::FailedOpen);
            Outcome::Allowed
        } else {
            tracing::error!(limiter, error = %err, "rate limiter unavailable, failing closed");
            self.metrics.record(limiter, OutcomeKind::FailedClosed);
            Outcome::Unavailable
        }
    }
}

/// Builder for [`RateLimitGate`]. Validation happens in `build`.
pub struct GateBuilder<S> {
    store: Arc<S>,
    registry: LimiterRegistry,
    strategy: Strategy,
    breaker_config: BreakerConfig,
    retry: RetryPolicy,
    call_timeout: Duration,
    fail_open: bool,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    lock_ttl: Duration,
    lock_wait: Duration,
    required: Vec<String>,
}

impl<S: CounterStore> GateBuilder<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            registry: LimiterRegistry::new(),
            strategy: Strategy::SlidingWindow,
            breaker_config: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(1),
            fail_open: true,
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(SystemClock),
            lock_ttl: Duration::from_secs(10),
            lock_wait: Duration::from_secs(3),
            required: Vec::new(),
        }
    }

    pub fn registry(mut self, registry: LimiterRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fixed-window lock self-expiry and acquisition budget.
    pub fn lock_bounds(mut self, ttl: Duration, max_wait: Duration) -> Self {
        self.lock_ttl = ttl;
        self.lock_wait = max_wait;
        self
    }

    /// Limiter names the application will reference; resolution is checked
    /// at build so a typo fails at startup, not under traffic.
    pub fn require(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.required.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Result<RateLimitGate<S>, GateBuildError> {
        if self.registry.is_empty() {
            return Err(GateBuildError::EmptyRegistry);
        }
        self.registry.validate(self.required.iter().map(String::as_str))?;
        let breaker = Breaker::new(self.breaker_config)?.with_clock(self.clock.clone());
        let algorithm = match self.strategy {
            Strategy::SlidingWindow => {
                Algorithm::Sliding(SlidingWindow::new(self.store.clone(), self.clock.clone()))
            }
            Strategy::FixedWindow => Algorithm::Fixed(
                FixedWindow::new(self.store.clone(), self.clock.clone())
                    .with_lock_bounds(self.lock_ttl, self.lock_wait),
            ),
        };
        Ok(RateLimitGate {
            registry: self.registry,
            algorithm,
            store: self.store,
            breaker,
            retry: self.retry,
            call_timeout: self.call_timeout,
            fail_open: self.fail_open,
            metrics: self.metrics,
            clock: self.clock,
        })
    }
}
