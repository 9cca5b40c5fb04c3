//! Configuration Module
//!
//! Handles loading and managing cache configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineOptions;

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Name of this cache instance, used as the record-file stem
    pub name: String,
    /// Directory for the engine's checkpoint files
    pub storage_path: PathBuf,
    /// Engine index size hint (power of two)
    pub index_capacity: usize,
    /// Bytes of records the engine keeps resident
    pub memory_budget: usize,
    /// Pause between expiry sweeps, zero disables the sweeper
    pub sweep_interval: Duration,
    /// Name of the payload codec to resolve from the registry
    pub codec: String,
    /// Discard storage on close instead of checkpointing it
    pub delete_on_close: bool,
    /// Reload the last checkpoint when opening
    pub try_recover_latest: bool,
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_NAME` - Instance name (default: cache)
    /// - `CACHE_STORAGE_PATH` - Storage directory (default: ./expiring-kv/{pid}-hlog)
    /// - `CACHE_INDEX_CAPACITY` - Engine index size (default: 131072)
    /// - `CACHE_MEMORY_BUDGET` - Resident bytes (default: 16 MiB)
    /// - `CACHE_SWEEP_INTERVAL_MS` - Sweep interval, zero or negative disables (default: 300000)
    /// - `CACHE_CODEC` - Payload codec name (default: json)
    /// - `CACHE_DELETE_ON_CLOSE` - Discard storage on close (default: true)
    /// - `CACHE_TRY_RECOVER_LATEST` - Recover last checkpoint (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            name: env::var("CACHE_NAME").unwrap_or(defaults.name),
            storage_path: env::var("CACHE_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_path),
            index_capacity: parse_env("CACHE_INDEX_CAPACITY").unwrap_or(defaults.index_capacity),
            memory_budget: parse_env("CACHE_MEMORY_BUDGET").unwrap_or(defaults.memory_budget),
            sweep_interval: parse_env::<i64>("CACHE_SWEEP_INTERVAL_MS")
                .map(sweep_interval_from_millis)
                .unwrap_or(defaults.sweep_interval),
            codec: env::var("CACHE_CODEC").unwrap_or(defaults.codec),
            delete_on_close: parse_env("CACHE_DELETE_ON_CLOSE").unwrap_or(defaults.delete_on_close),
            try_recover_latest: parse_env("CACHE_TRY_RECOVER_LATEST")
                .unwrap_or(defaults.try_recover_latest),
        }
    }

    /// Engine options derived from this configuration.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            name: self.name.clone(),
            storage_path: Some(self.storage_path.clone()),
            index_capacity: self.index_capacity,
            memory_budget: self.memory_budget,
            delete_on_close: self.delete_on_close,
            try_recover_latest: self.try_recover_latest,
        }
    }

    pub fn sweeper_enabled(&self) -> bool {
        !self.sweep_interval.is_zero()
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "cache".to_string(),
            storage_path: PathBuf::from("expiring-kv").join(format!("{}-hlog", std::process::id())),
            index_capacity: 1 << 17,
            memory_budget: 16 * 1024 * 1024,
            sweep_interval: Duration::from_secs(5 * 60),
            codec: "json".to_string(),
            delete_on_close: true,
            try_recover_latest: false,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Zero or negative intervals disable sweeping.
fn sweep_interval_from_millis(millis: i64) -> Duration {
    u64::try_from(millis).map_or(Duration::ZERO, Duration::from_millis)
}
