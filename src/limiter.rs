//! Core contract implemented by every distributed limiting algorithm.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;
use crate::registry::LimiterConfig;

/// What an algorithm decided for one admission attempt.
///
/// Denial is a value, not an error: the resilience shell retries store
/// failures but can never retry its way past a `Denied`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The event was admitted and recorded.
    Allowed {
        /// Permits left in the window after this admission. Approximate for
        /// algorithms where concurrent admissions race the count.
        remaining: u32,
    },
    /// The event was rejected; nothing was recorded.
    Denied {
        /// Estimated wait until a permit frees up.
        retry_after: Duration,
    },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed { .. })
    }
}

/// A rate-limiting algorithm coordinated through the shared counter store.
///
/// `key` is the fully composed rate-limit key; `config` supplies the window
/// and permit limit resolved for the limiter name by the registry.
#[async_trait]
pub trait KeyedLimiter: Send + Sync {
    async fn try_acquire(&self, key: &str, config: &LimiterConfig)
        -> Result<Verdict, StoreError>;
}
