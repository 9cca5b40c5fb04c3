//! Cache Statistics Module
//!
//! Tracks hits, misses, lazy expiry and sweeper activity.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// == Cache Stats ==
/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Reads that returned a value
    pub hits: u64,
    /// Reads that found nothing or an expired record
    pub misses: u64,
    /// Expired records removed by a read
    pub expired_on_read: u64,
    /// Completed sweep cycles
    pub sweep_cycles: u64,
    /// Expired records removed by sweeps
    pub swept: u64,
    /// Sweep cycles that ended in an error
    pub sweep_failures: u64,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no reads have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// == Stats Counters ==
/// Live counters shared by the facade and the sweeper.
#[derive(Debug, Default)]
pub struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired_on_read: AtomicU64,
    sweep_cycles: AtomicU64,
    swept: AtomicU64,
    sweep_failures: AtomicU64,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// An expired record found by a read; also counts as a miss.
    pub fn record_expired_on_read(&self) {
        self.expired_on_read.fetch_add(1, Ordering::Relaxed);
        self.record_miss();
    }

    pub fn record_sweep(&self, removed: usize) {
        self.sweep_cycles.fetch_add(1, Ordering::Relaxed);
        self.swept.fetch_add(removed as u64, Ordering::Relaxed);
    }

    /// A sweep cancelled before the last key: its removals count, the
    /// cycle does not.
    pub fn record_interrupted_sweep(&self, removed: usize) {
        self.swept.fetch_add(removed as u64, Ordering::Relaxed);
    }

    pub fn record_sweep_failure(&self) {
        self.sweep_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired_on_read: self.expired_on_read.load(Ordering::Relaxed),
            sweep_cycles: self.sweep_cycles.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
            sweep_failures: self.sweep_failures.load(Ordering::Relaxed),
        }
    }
}
