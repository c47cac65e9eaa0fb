//! Cache configuration.
//!
//! Loaded from environment variables with defaults suited to an
//! interactive client.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for the read cache and mutation pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries unused for this long are evicted.
    pub gc_time: Duration,

    /// How often the janitor looks for idle entries.
    pub sweep_interval: Duration,

    /// Pause between a settled mutation and its continuation (navigation).
    /// Only the ordering is guaranteed; the length is cosmetic.
    pub navigate_delay: Duration,

    /// Pause between the sign-out notice and clearing the cache.
    pub sign_out_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            gc_time: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            navigate_delay: Duration::from_millis(200),
            sign_out_delay: Duration::from_millis(500),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create CacheConfig from environment variables.
    ///
    /// Environment variables:
    /// - `FOLIO_CACHE_GC_TIME_SECS`: Idle time before eviction (default: 300)
    /// - `FOLIO_CACHE_SWEEP_INTERVAL_SECS`: Janitor period (default: 60)
    /// - `FOLIO_NAVIGATE_DELAY_MS`: Delay before post-mutation navigation (default: 200)
    /// - `FOLIO_SIGN_OUT_DELAY_MS`: Delay before clearing on sign-out (default: 500)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let gc_time = env_parse("FOLIO_CACHE_GC_TIME_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.gc_time);

        let sweep_interval = env_parse("FOLIO_CACHE_SWEEP_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);

        let navigate_delay = env_parse("FOLIO_NAVIGATE_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.navigate_delay);

        let sign_out_delay = env_parse("FOLIO_SIGN_OUT_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.sign_out_delay);

        Self {
            gc_time,
            sweep_interval,
            navigate_delay,
            sign_out_delay,
        }
    }

    /// Set the idle eviction time.
    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    /// Set the janitor period.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the post-mutation navigation delay.
    pub fn with_navigate_delay(mut self, delay: Duration) -> Self {
        self.navigate_delay = delay;
        self
    }

    /// Set the sign-out delay.
    pub fn with_sign_out_delay(mut self, delay: Duration) -> Self {
        self.sign_out_delay = delay;
        self
    }

    /// Reject values that would make the janitor spin.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "sweep_interval".to_string(),
                value: "0".to_string(),
                reason: "janitor period must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn env_parse(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
