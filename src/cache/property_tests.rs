//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check the facade against a plain map model.

use proptest::prelude::*;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::clock::{Clock, ManualClock};
use crate::config::CacheConfig;
use crate::engine::{Engine, EngineOptions, MemoryEngine};

// == Test Setup ==
fn cache_with(clock: Arc<ManualClock>, memory_budget: usize) -> Cache<String> {
    let engine = MemoryEngine::open(EngineOptions {
        memory_budget,
        ..EngineOptions::default()
    })
    .unwrap();

    Cache::builder(CacheConfig {
        sweep_interval: Duration::ZERO,
        ..CacheConfig::default()
    })
    .clock(clock)
    .with_engine(Arc::new(engine))
    .build()
    .unwrap()
}

// == Strategies ==
/// Generates valid cache keys (non-empty)
fn valid_key_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_]{1,16}"
}

fn valid_value_strategy() -> impl Strategy<Value = String> {
    "\\PC{0,256}"
}

#[derive(Debug, Clone)]
enum CacheOp {
    Set { key: String, value: String, ttl_ms: Option<u64> },
    Get { key: String },
    Delete { key: String },
    Advance { ms: u64 },
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        (
            valid_key_strategy(),
            valid_value_strategy(),
            prop::option::of(1u64..500)
        )
            .prop_map(|(key, value, ttl_ms)| CacheOp::Set { key, value, ttl_ms }),
        valid_key_strategy().prop_map(|key| CacheOp::Get { key }),
        valid_key_strategy().prop_map(|key| CacheOp::Delete { key }),
        (0u64..300).prop_map(|ms| CacheOp::Advance { ms }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // Any interleaving of writes, deletes and clock movement reads back the
    // same as a map of (value, absolute expiry), and the counters agree.
    #[test]
    fn prop_matches_model(
        ops in prop::collection::vec(cache_op_strategy(), 1..60),
        memory_budget in prop_oneof![Just(0usize), Just(usize::MAX)]
    ) {
        let clock = Arc::new(ManualClock::new(10_000));
        let cache = cache_with(clock.clone(), memory_budget);
        let mut model: HashMap<String, (String, Option<i64>)> = HashMap::new();
        let mut expected_hits = 0u64;
        let mut expected_misses = 0u64;

        for op in ops {
            let now = clock.now_millis();
            match op {
                CacheOp::Set { key, value, ttl_ms } => {
                    cache.set(&key, &value, ttl_ms.map(Duration::from_millis)).unwrap();
                    model.insert(key, (value, ttl_ms.map(|ttl| now + ttl as i64)));
                }
                CacheOp::Get { key } => {
                    let expired = matches!(model.get(&key), Some((_, Some(expiry))) if now > *expiry);
                    if expired {
                        model.remove(&key);
                    }
                    let expected = model.get(&key).map(|(value, _)| value.clone());
                    if expected.is_some() {
                        expected_hits += 1;
                    } else {
                        expected_misses += 1;
                    }
                    prop_assert_eq!(cache.get(&key).unwrap(), expected);
                }
                CacheOp::Delete { key } => {
                    cache.delete(&key).unwrap();
                    model.remove(&key);
                }
                CacheOp::Advance { ms } => clock.advance(Duration::from_millis(ms)),
            }
        }

        let stats = cache.stats();
        prop_assert_eq!(stats.hits, expected_hits, "Hits mismatch");
        prop_assert_eq!(stats.misses, expected_misses, "Misses mismatch");
    }

    // Storing then reading before expiry returns exactly what was stored.
    #[test]
    fn prop_roundtrip_storage(
        key in valid_key_strategy(),
        value in valid_value_strategy(),
        ttl_ms in prop::option::of(1u64..10_000)
    ) {
        let cache = cache_with(Arc::new(ManualClock::new(0)), usize::MAX);

        cache.set(&key, &value, ttl_ms.map(Duration::from_millis)).unwrap();
        prop_assert_eq!(cache.get(&key).unwrap(), Some(value));
    }

    // The second of two writes to one key wins.
    #[test]
    fn prop_overwrite_semantics(
        key in valid_key_strategy(),
        value1 in valid_value_strategy(),
        value2 in valid_value_strategy()
    ) {
        let cache = cache_with(Arc::new(ManualClock::new(0)), usize::MAX);

        cache.set(&key, &value1, None).unwrap();
        cache.set(&key, &value2, None).unwrap();

        prop_assert_eq!(cache.get(&key).unwrap(), Some(value2));
        prop_assert_eq!(cache.engine().len(), 1, "Should have exactly one record after overwrite");
    }

    #[test]
    fn prop_delete_removes_entry(key in valid_key_strategy(), value in valid_value_strategy()) {
        let cache = cache_with(Arc::new(ManualClock::new(0)), usize::MAX);

        cache.set(&key, &value, None).unwrap();
        cache.delete(&key).unwrap();

        prop_assert_eq!(cache.get(&key).unwrap(), None);
        prop_assert!(cache.inspect(&key).unwrap().is_none());
    }

    // A record is readable up to and including its expiry instant, gone after.
    #[test]
    fn prop_ttl_expiration_behavior(
        key in valid_key_strategy(),
        value in valid_value_strategy(),
        ttl_ms in 1u64..100_000
    ) {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(clock.clone(), usize::MAX);

        cache.set(&key, &value, Some(Duration::from_millis(ttl_ms))).unwrap();

        clock.advance(Duration::from_millis(ttl_ms));
        prop_assert_eq!(cache.get(&key).unwrap(), Some(value));

        clock.advance(Duration::from_millis(1));
        prop_assert_eq!(cache.get(&key).unwrap(), None);
    }

    // The factory runs only when the key is missing.
    #[test]
    fn prop_get_or_add_runs_factory_on_miss(
        key in valid_key_strategy(),
        stored in prop::option::of(valid_value_strategy()),
        produced in valid_value_strategy()
    ) {
        let cache = cache_with(Arc::new(ManualClock::new(0)), usize::MAX);
        if let Some(stored) = &stored {
            cache.set(&key, stored, None).unwrap();
        }

        let calls = Cell::new(0);
        let result = cache
            .get_or_add(&key, |_| {
                calls.set(calls.get() + 1);
                Ok(produced.clone())
            }, None)
            .unwrap();

        let expected = stored.clone().unwrap_or_else(|| produced.clone());
        prop_assert_eq!(&result, &expected);
        prop_assert_eq!(calls.get(), usize::from(stored.is_none()));
        prop_assert_eq!(cache.get(&key).unwrap(), Some(expected));
    }
}
