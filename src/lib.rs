//! Expiring KV - A TTL cache over an embedded key-value engine
//!
//! Values are wrapped in a small binary envelope carrying an optional
//! absolute expiry, stored through pooled engine sessions and reclaimed
//! lazily on read or by a background sweeper.

pub mod cache;
pub mod clock;
pub mod codec;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod pool;
pub mod tasks;

pub use cache::{Cache, CacheBuilder, CacheStats, ObjectCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{CodecRegistry, PayloadCodec};
pub use config::CacheConfig;
pub use engine::{Engine, EngineOptions, EngineSession, MemoryEngine};
pub use error::{CacheError, Result};
