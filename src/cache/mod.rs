//! Cache Module
//!
//! The typed cache facade and its statistics.

mod facade;
mod stats;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use facade::{Cache, CacheBuilder, ObjectCache};
pub use stats::{CacheStats, StatsCounters};
