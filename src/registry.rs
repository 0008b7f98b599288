//! Named limiter configurations and the key conventions tying them together.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Separator between the limiter name and the caller identity in a composed
/// key. Must not appear in limiter names, or keys for different limiters
/// could collide.
pub const KEY_SEPARATOR: char = ':';

/// Limiter name used when a caller did not (or could not) name one.
pub const DEFAULT_LIMITER: &str = "default";

/// Immutable settings for one named limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    /// Length of the admission window.
    pub window: Duration,
    /// Events admitted per window.
    pub limit: u32,
    /// Namespacing prefix for store keys.
    pub key_prefix: String,
}

impl LimiterConfig {
    pub fn new(window: Duration, limit: u32, key_prefix: impl Into<String>) -> Self {
        Self { window, limit, key_prefix: key_prefix.into() }
    }
}

/// Errors detected while assembling the registry. These surface at startup,
/// never at request time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A limiter name contains the key separator.
    InvalidName { name: String },
    /// The window must be non-zero.
    ZeroWindow { name: String },
    /// The permit limit must be non-zero.
    ZeroLimit { name: String },
    /// A limiter the application wires up has no entry and no default exists.
    Unconfigured { name: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::InvalidName { name } => {
                write!(f, "limiter name `{}` must not contain `{}`", name, KEY_SEPARATOR)
            }
            RegistryError::ZeroWindow { name } => {
                write!(f, "limiter `{}` has a zero-length window", name)
            }
            RegistryError::ZeroLimit { name } => {
                write!(f, "limiter `{}` has a zero permit limit", name)
            }
            RegistryError::Unconfigured { name } => {
                write!(f, "limiter `{}` has no configuration and no `default` entry exists", name)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Maps limiter names to their configuration, with a `"default"` fallback.
#[derive(Debug, Clone, Default)]
pub struct LimiterRegistry {
    entries: HashMap<String, LimiterConfig>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named limiter, validating the entry.
    pub fn register(
        mut self,
        name: impl Into<String>,
        config: LimiterConfig,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        if name.contains(KEY_SEPARATOR) {
            return Err(RegistryError::InvalidName { name });
        }
        if config.window.is_zero() {
            return Err(RegistryError::ZeroWindow { name });
        }
        if config.limit == 0 {
            return Err(RegistryError::ZeroLimit { name });
        }
        self.entries.insert(name, config);
        Ok(self)
    }

    /// Resolve a limiter name, falling back to the `"default"` entry.
    pub fn config_for(&self, name: &str) -> Option<&LimiterConfig> {
        self.entries.get(name).or_else(|| self.entries.get(DEFAULT_LIMITER))
    }

    /// Fail fast when any limiter the application actually references would
    /// resolve to nothing at request time.
    pub fn validate<'a>(
        &self,
        referenced: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), RegistryError> {
        for name in referenced {
            if self.config_for(name).is_none() {
                return Err(RegistryError::Unconfigured { name: name.to_string() });
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Explicit request identity, replacing the fragile "split the key on the
/// first separator" convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    pub limiter: String,
    pub identifier: String,
}

impl CheckRequest {
    pub fn new(limiter: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self { limiter: limiter.into(), identifier: identifier.into() }
    }

    /// Legacy parsing for callers still composing flat keys: first
    /// `:`-delimited segment is the limiter name, the rest the identifier.
    ///
    /// A key with no separator is a caller bug; it is filed under the
    /// `"default"` limiter (merging its budget with every other prefix-less
    /// caller) and logged so it can be found and fixed.
    pub fn parse_key(key: &str) -> Self {
        match key.split_once(KEY_SEPARATOR) {
            Some((limiter, identifier)) if !limiter.is_empty() => {
                Self::new(limiter, identifier)
            }
            _ => {
                tracing::warn!(
                    key,
                    "rate-limit key has no limiter prefix; treating whole key as an \
                     identifier under the `default` limiter"
                );
                Self::new(DEFAULT_LIMITER, key)
            }
        }
    }
}
