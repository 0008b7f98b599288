//! Declarative settings for the gate, loadable from JSON.
//!
//! Everything here is plain data. Durations are carried as integer
//! milliseconds so configuration files stay unit-explicit, and conversion
//! into the runtime types (registry, retry policy, breaker config) happens
//! once at startup where validation errors can still abort the process.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{BreakerConfig, BreakerConfigError};
use crate::registry::{LimiterConfig, LimiterRegistry, RegistryError};

/// Which store-backed admission algorithm the gate runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Rolling window over a sorted event log. Smooth, no boundary bursts.
    #[default]
    SlidingWindow,
    /// Lock-guarded counter that resets at window boundaries. Cheaper, but a
    /// burst can straddle the boundary.
    FixedWindow,
}

/// One named limiter entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LimiterSettings {
    pub window_ms: u64,
    pub limit: u32,
    #[serde(default = "default_prefix")]
    pub key_prefix: String,
}

fn default_prefix() -> String {
    "rl".to_string()
}

/// Retry knobs for transient store failures.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_attempts: 3, backoff_base_ms: 50, backoff_cap_ms: 2_000 }
    }
}

/// Circuit breaker knobs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BreakerSettings {
    pub failure_threshold: usize,
    pub cooldown_ms: u64,
    pub half_open_max_probes: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown_ms: 30_000, half_open_max_probes: 1 }
    }
}

/// Top-level gate settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub limiters: HashMap<String, LimiterSettings>,
    /// Admit requests when the store is terminally unreachable. On by
    /// default: an unreachable limiter should degrade to "no limiting",
    /// not to an outage.
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
    /// Per-attempt budget for one store round trip.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Fixed-window lock self-expiry.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    /// Fixed-window lock acquisition budget.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
}

fn default_fail_open() -> bool {
    true
}

fn default_call_timeout_ms() -> u64 {
    1_000
}

fn default_lock_ttl_ms() -> u64 {
    10_000
}

fn default_lock_wait_ms() -> u64 {
    3_000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            limiters: HashMap::new(),
            fail_open: default_fail_open(),
            strategy: Strategy::default(),
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            call_timeout_ms: default_call_timeout_ms(),
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_wait_ms: default_lock_wait_ms(),
        }
    }
}

impl Settings {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Build the limiter registry, validating every entry.
    pub fn registry(&self) -> Result<LimiterRegistry, RegistryError> {
        let mut registry = LimiterRegistry::new();
        for (name, entry) in &self.limiters {
            registry = registry.register(
                name.clone(),
                LimiterConfig::new(
                    Duration::from_millis(entry.window_ms),
                    entry.limit,
                    entry.key_prefix.clone(),
                ),
            )?;
        }
        Ok(registry)
    }

    /// Build the breaker configuration, validating the knobs.
    pub fn breaker_config(&self) -> Result<BreakerConfig, BreakerConfigError> {
        let config = BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            cooldown: Duration::from_millis(self.breaker.cooldown_ms),
            half_open_max_probes: self.breaker.half_open_max_probes,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}
