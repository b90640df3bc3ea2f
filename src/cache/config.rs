//! Cache configuration.
//!
//! Controls how long an unwatched entry stays cached. The binary resolves it
//! from `cache.timeout_ms` in its layered settings:
//!
//! ```toml
//! [cache]
//! timeout_ms = 200
//! ```

use std::time::Duration;

/// Milliseconds an entry survives after its last listener leaves.
pub const DEFAULT_CACHE_TIMEOUT_MS: u64 = 200;

/// Per-instance cache options.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long an entry remains cached after its last listener deregisters.
    pub cache_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_timeout: Duration::from_millis(DEFAULT_CACHE_TIMEOUT_MS),
        }
    }
}

impl CacheConfig {
    /// Build a configuration with the given eviction grace period.
    pub fn with_timeout(cache_timeout: Duration) -> Self {
        Self { cache_timeout }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            cache_timeout: settings.timeout,
        }
    }
}
