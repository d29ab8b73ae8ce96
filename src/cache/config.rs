//! Cache configuration.
//!
//! Controls freshness and garbage collection of the entity store via the
//! `[cache]` and `[calendar]` sections of `daybook.toml`.

use std::time::Duration;

use chrono_tz::Tz;

// Default values for cache configuration
const DEFAULT_STALE_TIME_SECS: u64 = 300;
const DEFAULT_GC_DELAY_SECS: u64 = 300;
const DEFAULT_GC_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a fetched entry counts as fresh.
    pub stale_time: Duration,
    /// How long an unobserved entry survives before eviction.
    pub gc_delay: Duration,
    /// Cadence of the background eviction sweep.
    pub gc_interval: Duration,
    /// Timezone used to bucket tasks into days and months.
    pub timezone: Tz,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(DEFAULT_STALE_TIME_SECS),
            gc_delay: Duration::from_secs(DEFAULT_GC_DELAY_SECS),
            gc_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_SECS),
            timezone: Tz::UTC,
        }
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            stale_time: settings.cache.stale_time,
            gc_delay: settings.cache.gc_delay,
            gc_interval: settings.cache.gc_interval,
            timezone: settings.calendar.timezone,
        }
    }
}

impl CacheConfig {
    /// Entries are never considered fresh; every `ensure` refetches.
    pub fn always_stale(mut self) -> Self {
        self.stale_time = Duration::ZERO;
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }
}
