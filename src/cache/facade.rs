//! Cache Facade Module
//!
//! The public Get/Set/Delete/GetOrAdd surface over a pooled engine, in
//! blocking and async flavours. Every operation borrows exactly one session
//! for its duration.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, StatsCounters};
use crate::clock::{expiry_after, Clock, SystemClock};
use crate::codec::{CodecRegistry, PayloadCodec};
use crate::config::CacheConfig;
use crate::engine::{Engine, EngineSession, MemoryEngine};
use crate::envelope::{Envelope, EnvelopeHeader};
use crate::error::{CacheError, CodecError, Result};
use crate::pool::HandlePool;
use crate::tasks::{self, ExpirySweeper, SweeperState};

/// Outcome of decoding a stored record for a read.
enum Lookup<T> {
    Hit(T),
    Miss,
    Expired,
}

// == Cache Builder ==
/// Resolves the codec, opens or adopts the engine and starts the sweeper.
pub struct CacheBuilder<T, E: Engine = MemoryEngine> {
    config: CacheConfig,
    codecs: CodecRegistry<T>,
    clock: Arc<dyn Clock>,
    engine: Option<Arc<E>>,
}

impl<T> CacheBuilder<T, MemoryEngine> {
    /// Builder over an explicit registry, for payloads without serde support.
    pub fn new(config: CacheConfig, codecs: CodecRegistry<T>) -> Self {
        Self {
            config,
            codecs,
            clock: Arc::new(SystemClock),
            engine: None,
        }
    }
}

impl<T, E: Engine> CacheBuilder<T, E> {
    /// Adds a codec to the registry; select it with `CacheConfig::codec`.
    pub fn register_codec<C>(mut self, codec: C) -> Self
    where
        C: PayloadCodec<T> + 'static,
    {
        self.codecs = self.codecs.register(codec);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Uses an engine the caller owns. The cache will never checkpoint or
    /// close it.
    pub fn with_engine<F: Engine>(self, engine: Arc<F>) -> CacheBuilder<T, F> {
        CacheBuilder {
            config: self.config,
            codecs: self.codecs,
            clock: self.clock,
            engine: Some(engine),
        }
    }

    pub fn build(self) -> Result<Cache<T, E>> {
        let codec = self.codecs.resolve(&self.config.codec)?;

        let (engine, owns_engine) = match self.engine {
            Some(engine) => (engine, false),
            None => (Arc::new(E::open(self.config.engine_options())?), true),
        };

        let pool = HandlePool::new(engine);
        let stats = Arc::new(StatsCounters::new());
        let sweeper = match ExpirySweeper::start(
            pool.clone(),
            self.clock.clone(),
            stats.clone(),
            self.config.sweep_interval,
        ) {
            Ok(sweeper) => sweeper,
            Err(e) => {
                if owns_engine {
                    pool.engine().close()?;
                }
                return Err(e);
            }
        };

        info!(
            name = %self.config.name,
            codec = %self.config.codec,
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            owns_engine,
            "Cache opened"
        );

        Ok(Cache {
            name: self.config.name,
            pool,
            codec,
            clock: self.clock,
            stats,
            sweeper: Mutex::new(sweeper),
            owns_engine,
            delete_on_close: self.config.delete_on_close,
            closed: AtomicBool::new(false),
        })
    }
}

// == Cache ==
/// TTL cache over an embedded key-value engine.
///
/// `get_or_add` is not atomic: concurrent misses on one key may each run the
/// factory, and the last write wins.
pub struct Cache<T, E: Engine = MemoryEngine> {
    name: String,
    pool: Arc<HandlePool<E>>,
    codec: Arc<dyn PayloadCodec<T>>,
    clock: Arc<dyn Clock>,
    stats: Arc<StatsCounters>,
    sweeper: Mutex<Option<ExpirySweeper>>,
    owns_engine: bool,
    delete_on_close: bool,
    closed: AtomicBool,
}

/// The untyped cache: any serde value, stored as a dynamic JSON tree.
pub type ObjectCache<E = MemoryEngine> = Cache<serde_json::Value, E>;

impl<T> Cache<T, MemoryEngine>
where
    T: Serialize + DeserializeOwned,
{
    /// Builder with the default serde codecs registered.
    pub fn builder(config: CacheConfig) -> CacheBuilder<T, MemoryEngine> {
        CacheBuilder::new(config, CodecRegistry::with_defaults())
    }

    /// Opens a cache with default codecs and the system clock.
    pub fn open(config: CacheConfig) -> Result<Self> {
        Self::builder(config).build()
    }
}

impl<T, E: Engine> Cache<T, E> {
    // == Get ==
    /// Returns the value stored under `key`, or None when absent or expired.
    ///
    /// An expired record is deleted before returning.
    pub fn get(&self, key: &str) -> Result<Option<T>> {
        validate_key(key)?;

        let mut handle = self.pool.acquire()?;
        let record = handle.read_blocking(key)?;
        match self.lookup(record)? {
            Lookup::Hit(value) => Ok(Some(value)),
            Lookup::Miss => Ok(None),
            Lookup::Expired => {
                handle.delete(key)?;
                handle.complete_pending(true)?;
                debug!(key, "Removed expired entry on read");
                Ok(None)
            }
        }
    }

    // == Set ==
    /// Stores `value` under `key`, overwriting any previous record.
    ///
    /// # Arguments
    /// * `key` - Non-empty key
    /// * `value` - The value to store
    /// * `expiry` - Optional time to live, must be positive
    ///
    /// `value` is always written as a body, even when `T` itself models
    /// absence (a `None` in a `Cache<Option<U>>` is stored as the codec's
    /// encoding of `None`). Use [`set_absent`](Self::set_absent) for a record
    /// without a body.
    pub fn set(&self, key: &str, value: &T, expiry: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        validate_expiry(expiry)?;

        let record = self.encode(Some(value), expiry)?;
        let mut handle = self.pool.acquire()?;
        handle.upsert(key, record)?;
        handle.complete_pending(true)?;
        Ok(())
    }

    /// Stores a record with no body under `key`, overwriting any previous
    /// record. Reads return None; the key still shows up in `inspect` until
    /// it expires and is reclaimed.
    pub fn set_absent(&self, key: &str, expiry: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        validate_expiry(expiry)?;

        let record = self.encode(None, expiry)?;
        let mut handle = self.pool.acquire()?;
        handle.upsert(key, record)?;
        handle.complete_pending(true)?;
        Ok(())
    }

    // == Delete ==
    /// Removes `key`. Deleting an absent key is a no-op.
    pub fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;

        let mut handle = self.pool.acquire()?;
        handle.delete(key)?;
        handle.complete_pending(true)?;
        Ok(())
    }

    // == Get Or Add ==
    /// Returns the cached value, or runs `factory`, stores its result with
    /// `expiry` and returns it. A failing factory leaves the store untouched.
    pub fn get_or_add<F>(&self, key: &str, factory: F, expiry: Option<Duration>) -> Result<T>
    where
        F: FnOnce(&str) -> anyhow::Result<T>,
    {
        validate_key(key)?;
        validate_expiry(expiry)?;

        if let Some(value) = self.get(key)? {
            return Ok(value);
        }
        let value = factory(key).map_err(CacheError::Factory)?;
        self.set(key, &value, expiry)?;
        Ok(value)
    }

    // == Async Variants ==
    pub async fn get_async(&self, key: &str) -> Result<Option<T>> {
        validate_key(key)?;

        let mut handle = self.pool.acquire()?;
        let record = handle.read_async(key).await?;
        match self.lookup(record)? {
            Lookup::Hit(value) => Ok(Some(value)),
            Lookup::Miss => Ok(None),
            Lookup::Expired => {
                handle.delete_async(key).await?;
                debug!(key, "Removed expired entry on read");
                Ok(None)
            }
        }
    }

    pub async fn set_async(&self, key: &str, value: &T, expiry: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        validate_expiry(expiry)?;

        let record = self.encode(Some(value), expiry)?;
        let mut handle = self.pool.acquire()?;
        handle.upsert_async(key, record).await?;
        Ok(())
    }

    pub async fn delete_async(&self, key: &str) -> Result<()> {
        validate_key(key)?;

        let mut handle = self.pool.acquire()?;
        handle.delete_async(key).await?;
        Ok(())
    }

    pub async fn get_or_add_async<F, Fut>(
        &self,
        key: &str,
        factory: F,
        expiry: Option<Duration>,
    ) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        validate_key(key)?;
        validate_expiry(expiry)?;

        if let Some(value) = self.get_async(key).await? {
            return Ok(value);
        }
        let value = factory(key.to_string()).await.map_err(CacheError::Factory)?;
        self.set_async(key, &value, expiry).await?;
        Ok(value)
    }

    // == Inspection ==
    /// Header of the stored record, ignoring expiry. Does not delete.
    pub fn inspect(&self, key: &str) -> Result<Option<EnvelopeHeader>> {
        validate_key(key)?;

        let mut handle = self.pool.acquire()?;
        match handle.read_blocking(key)? {
            Some(record) => Ok(Some(EnvelopeHeader::peek(&record)?)),
            None => Ok(None),
        }
    }

    /// Runs one sweep cycle now and returns how many records it removed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        match tasks::sweep_expired(&self.pool, self.clock.as_ref()).await {
            Ok(removed) => {
                self.stats.record_sweep(removed);
                Ok(removed)
            }
            Err(e) => {
                self.stats.record_sweep_failure();
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// State of the background sweeper, None when sweeping is disabled.
    pub fn sweeper_state(&self) -> Option<SweeperState> {
        self.sweeper.lock().as_ref().map(ExpirySweeper::state)
    }

    pub fn engine(&self) -> &Arc<E> {
        self.pool.engine()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // == Close ==
    /// Stops the sweeper, drops idle sessions and, when the engine is ours,
    /// checkpoints it (unless deleting on close) and closes it.
    ///
    /// Calling it again does nothing.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        self.close_storage()
    }

    /// Like [`close`](Self::close), but also waits for the sweeper task to
    /// finish its current key and exit.
    pub async fn shutdown(&self) -> Result<()> {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }
        self.close()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close_storage(&self) -> Result<()> {
        self.pool.close();

        if self.owns_engine {
            let engine = self.pool.engine();
            let checkpointed = if self.delete_on_close {
                Ok(())
            } else {
                engine.checkpoint()
            };
            let closed = engine.close();
            checkpointed?;
            closed?;
        }

        info!(name = %self.name, "Cache closed");
        Ok(())
    }

    // == Helpers ==
    fn encode(&self, value: Option<&T>, expiry: Option<Duration>) -> Result<Bytes> {
        let now = self.clock.now_millis();
        let expiry = expiry.map(|ttl| expiry_after(now, ttl));

        let mut buf = BytesMut::new();
        Envelope::encode_parts(&mut buf, value, expiry, self.codec.as_ref(), now)?;
        Ok(buf.freeze())
    }

    fn lookup(&self, record: Option<Bytes>) -> Result<Lookup<T>> {
        let Some(record) = record else {
            self.stats.record_miss();
            return Ok(Lookup::Miss);
        };

        let now = self.clock.now_millis();
        let envelope = Envelope::decode(&mut &record[..], self.codec.as_ref(), now)?;
        if envelope.has_expired(now) {
            self.stats.record_expired_on_read();
            return Ok(Lookup::Expired);
        }

        match envelope.into_body() {
            Some(value) => {
                self.stats.record_hit();
                Ok(Lookup::Hit(value))
            }
            None => {
                self.stats.record_miss();
                Ok(Lookup::Miss)
            }
        }
    }
}

// == Object Cache ==
impl<E: Engine> Cache<serde_json::Value, E> {
    /// Reads a value and converts it to `U`.
    pub fn get_as<U: DeserializeOwned>(&self, key: &str) -> Result<Option<U>> {
        let Some(value) = self.get(key)? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| CodecError::decode("object", e).into())
    }

    /// Converts `value` to a dynamic value and stores it.
    pub fn set_from<U: Serialize>(&self, key: &str, value: &U, expiry: Option<Duration>) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|e| CodecError::encode("object", e))?;
        self.set(key, &value, expiry)
    }
}

impl<T, E: Engine> Drop for Cache<T, E> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(name = %self.name, error = %e, "Failed to close cache cleanly");
        }
    }
}

impl<T, E: Engine> std::fmt::Debug for Cache<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("codec", &self.codec.name())
            .field("pool", &self.pool)
            .field("owns_engine", &self.owns_engine)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// == Validation ==
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidArgument("key must not be empty".to_string()));
    }
    Ok(())
}

fn validate_expiry(expiry: Option<Duration>) -> Result<()> {
    match expiry {
        Some(ttl) if ttl.is_zero() => Err(CacheError::InvalidArgument(
            "expiry must be a positive duration".to_string(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::envelope::EnvelopeFlags;

    fn config() -> CacheConfig {
        CacheConfig {
            sweep_interval: Duration::ZERO,
            ..CacheConfig::default()
        }
    }

    fn in_memory(clock: Arc<ManualClock>) -> Cache<String> {
        Cache::builder(config())
            .clock(clock)
            .with_engine(Arc::new(MemoryEngine::in_memory()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_set_and_get() {
        let cache = in_memory(Arc::new(ManualClock::new(0)));

        cache.set("key1", &"value1".to_string(), None).unwrap();
        assert_eq!(cache.get("key1").unwrap().as_deref(), Some("value1"));
    }

    #[test]
    fn test_get_nonexistent() {
        let cache = in_memory(Arc::new(ManualClock::new(0)));
        assert_eq!(cache.get("nonexistent").unwrap(), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_expired_entry_is_deleted_on_read() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = in_memory(clock.clone());

        cache.set("key1", &"value1".to_string(), Some(Duration::from_secs(1))).unwrap();
        clock.advance(Duration::from_millis(1001));

        assert_eq!(cache.get("key1").unwrap(), None);
        assert_eq!(cache.inspect("key1").unwrap(), None);
        assert_eq!(cache.stats().expired_on_read, 1);
    }

    #[test]
    fn test_expiry_boundary_is_still_readable() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = in_memory(clock.clone());

        cache.set("key1", &"value1".to_string(), Some(Duration::from_secs(1))).unwrap();
        clock.advance(Duration::from_millis(1000));

        assert!(cache.get("key1").unwrap().is_some());
    }

    #[test]
    fn test_inspect_reports_flags() {
        let clock = Arc::new(ManualClock::new(100));
        let cache = in_memory(clock);

        cache.set("key1", &"value1".to_string(), Some(Duration::from_secs(1))).unwrap();
        let header = cache.inspect("key1").unwrap().unwrap();
        assert_eq!(header.flags, EnvelopeFlags::HAS_EXPIRY | EnvelopeFlags::HAS_BODY);
        assert_eq!(header.expiry, Some(1100));
    }

    #[test]
    fn test_set_absent_writes_no_body() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = in_memory(clock);

        cache.set("key1", &"value1".to_string(), None).unwrap();
        cache.set_absent("key1", Some(Duration::from_secs(1))).unwrap();

        let header = cache.inspect("key1").unwrap().unwrap();
        assert_eq!(header.flags, EnvelopeFlags::HAS_EXPIRY);
        assert_eq!(header.body_len, None);
        assert_eq!(cache.get("key1").unwrap(), None);

        cache.set_absent("key2", None).unwrap();
        let header = cache.inspect("key2").unwrap().unwrap();
        assert_eq!(header.flags, EnvelopeFlags::NONE);
        assert!(matches!(
            cache.set_absent("", None),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_option_payload_none_is_stored_as_body() {
        let cache: Cache<Option<u32>> = Cache::builder(config())
            .with_engine(Arc::new(MemoryEngine::in_memory()))
            .build()
            .unwrap();

        cache.set("key1", &None, None).unwrap();
        let header = cache.inspect("key1").unwrap().unwrap();
        assert_eq!(header.flags, EnvelopeFlags::HAS_BODY);
        assert_eq!(cache.get("key1").unwrap(), Some(None));
    }

    #[test]
    fn test_invalid_arguments() {
        let cache = in_memory(Arc::new(ManualClock::new(0)));
        let value = "v".to_string();

        assert!(matches!(cache.get(""), Err(CacheError::InvalidArgument(_))));
        assert!(matches!(cache.set("", &value, None), Err(CacheError::InvalidArgument(_))));
        assert!(matches!(cache.delete(""), Err(CacheError::InvalidArgument(_))));
        assert!(matches!(
            cache.set("k", &value, Some(Duration::ZERO)),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            cache.get_or_add("k", |_| Ok(value.clone()), Some(Duration::ZERO)),
            Err(CacheError::InvalidArgument(_))
        ));
        // Nothing reached the engine
        assert!(cache.engine().is_empty());
    }

    #[test]
    fn test_unknown_codec_fails_build() {
        let result = Cache::<String>::builder(CacheConfig {
            codec: "memorypack".to_string(),
            ..config()
        })
        .with_engine(Arc::new(MemoryEngine::in_memory()))
        .build();

        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_close_is_idempotent_and_rejects_operations() {
        let cache = in_memory(Arc::new(ManualClock::new(0)));
        cache.close().unwrap();
        cache.close().unwrap();

        assert!(cache.is_closed());
        assert!(matches!(cache.get("key"), Err(CacheError::Closed)));
    }

    #[test]
    fn test_injected_engine_is_not_closed() {
        let engine = Arc::new(MemoryEngine::in_memory());
        let cache: Cache<String> = Cache::builder(config())
            .with_engine(engine.clone())
            .build()
            .unwrap();
        cache.set("key", &"value".to_string(), None).unwrap();
        drop(cache);

        // Still usable by its owner
        let mut session = engine.new_session().unwrap();
        assert!(session.read_blocking("key").unwrap().is_some());
    }

    #[test]
    fn test_object_cache_typed_access() {
        #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
        struct Data {
            one: String,
            two: i32,
        }

        let cache: ObjectCache = Cache::builder(config())
            .with_engine(Arc::new(MemoryEngine::in_memory()))
            .build()
            .unwrap();
        let data = Data {
            one: "one".to_string(),
            two: 2,
        };

        cache.set_from("data", &data, None).unwrap();
        assert_eq!(cache.get_as::<Data>("data").unwrap(), Some(data));
        assert_eq!(cache.get("data").unwrap().unwrap()["two"], 2);
    }
}
