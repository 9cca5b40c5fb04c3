//! Expiry Sweeper Task
//!
//! Background task that periodically walks every key and deletes the ones
//! whose envelope has expired. Reads reclaim expired records lazily; the
//! sweeper catches the ones nobody reads again.
//!
//! The interval is a pause between cycles, so a slow cycle delays the next
//! one instead of overlapping it. Cancellation is cooperative: it is checked
//! between cycles and between keys.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::StatsCounters;
use crate::clock::Clock;
use crate::engine::{Engine, EngineSession};
use crate::envelope::EnvelopeHeader;
use crate::error::{CacheError, Result};
use crate::pool::HandlePool;

// == Sweeper State ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweeperState {
    /// Sleeping until the next cycle
    Idle,
    /// Walking the keys
    Scanning,
    /// Terminal
    Stopped,
}

// == Expiry Sweeper ==
/// Handle to the running sweeper task. Dropping it signals the task to stop.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<SweeperState>,
    handle: Option<JoinHandle<()>>,
}

impl ExpirySweeper {
    /// Spawns the sweeper on the current Tokio runtime.
    ///
    /// Returns `Ok(None)` when `interval` is zero (sweeping disabled) and a
    /// configuration error when called outside a runtime.
    ///
    /// # Arguments
    /// * `pool` - Handle pool shared with the cache facade
    /// * `clock` - Time source for expiry decisions
    /// * `stats` - Counters that receive sweep results
    /// * `interval` - Pause between sweep cycles
    pub fn start<E: Engine>(
        pool: Arc<HandlePool<E>>,
        clock: Arc<dyn Clock>,
        stats: Arc<StatsCounters>,
        interval: Duration,
    ) -> Result<Option<Self>> {
        if interval.is_zero() {
            return Ok(None);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CacheError::Config("the expiry sweeper requires a Tokio runtime".to_string())
        })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SweeperState::Idle);

        let handle = runtime.spawn(sweep_loop(pool, clock, stats, interval, shutdown_rx, state_tx));
        info!(interval_ms = interval.as_millis() as u64, "Background expiry sweeper started");

        Ok(Some(Self {
            shutdown_tx,
            state_rx,
            handle: Some(handle),
        }))
    }

    pub fn state(&self) -> SweeperState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<SweeperState> {
        self.state_rx.clone()
    }

    /// Signals the task to stop after the key it is working on.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Stops the task and waits for it to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Expiry sweeper task ended abnormally");
            }
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The main sweeper loop.
async fn sweep_loop<E: Engine>(
    pool: Arc<HandlePool<E>>,
    clock: Arc<dyn Clock>,
    stats: Arc<StatsCounters>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<SweeperState>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown_rx.borrow() {
            break;
        }

        state_tx.send_replace(SweeperState::Scanning);
        let cancelled = || *shutdown_rx.borrow();
        match sweep_cycle(&pool, clock.as_ref(), &cancelled).await {
            Ok(outcome) => {
                record_outcome(&stats, outcome);
                if outcome.removed > 0 {
                    info!("Expiry sweep: removed {} expired entries", outcome.removed);
                } else {
                    debug!("Expiry sweep: no expired entries found");
                }
            }
            Err(e) => {
                stats.record_sweep_failure();
                warn!(error = %e, "Expiry sweep failed, retrying next cycle");
            }
        }
        state_tx.send_replace(SweeperState::Idle);
    }

    state_tx.send_replace(SweeperState::Stopped);
    info!("Background expiry sweeper stopped");
}

/// Result of one pass over the keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SweepOutcome {
    removed: usize,
    /// The pass stopped before the last key
    cancelled: bool,
}

/// Only a pass that reached the last key counts as a cycle.
fn record_outcome(stats: &StatsCounters, outcome: SweepOutcome) {
    if outcome.cancelled {
        stats.record_interrupted_sweep(outcome.removed);
    } else {
        stats.record_sweep(outcome.removed);
    }
}

// == Sweep Expired ==
/// Runs one full sweep and returns how many expired records were deleted.
pub async fn sweep_expired<E: Engine>(pool: &Arc<HandlePool<E>>, clock: &dyn Clock) -> Result<usize> {
    let outcome = sweep_cycle(pool, clock, &|| false).await?;
    Ok(outcome.removed)
}

async fn sweep_cycle<E: Engine>(
    pool: &Arc<HandlePool<E>>,
    clock: &dyn Clock,
    cancelled: &(dyn Fn() -> bool + Sync),
) -> Result<SweepOutcome> {
    let mut handle = pool.acquire()?;
    let keys = handle.iterate()?;
    let mut removed = 0;

    for key in keys {
        if cancelled() {
            debug!(removed, "Expiry sweep cancelled");
            return Ok(SweepOutcome {
                removed,
                cancelled: true,
            });
        }

        let Some(record) = handle.read_async(&key).await? else {
            continue;
        };
        let header = match EnvelopeHeader::peek(&record) {
            Ok(header) => header,
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping malformed record");
                continue;
            }
        };
        if header.has_expired(clock.now_millis()) {
            handle.delete_async(&key).await?;
            removed += 1;
        }
    }

    Ok(SweepOutcome {
        removed,
        cancelled: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::Utf8Codec;
    use crate::engine::{EngineOptions, MemoryEngine};
    use crate::envelope::Envelope;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        engine: Arc<MemoryEngine>,
        pool: Arc<HandlePool<MemoryEngine>>,
        clock: Arc<ManualClock>,
        stats: Arc<StatsCounters>,
    }

    fn fixture(memory_budget: usize) -> Fixture {
        let engine = Arc::new(
            MemoryEngine::open(EngineOptions {
                memory_budget,
                ..EngineOptions::default()
            })
            .unwrap(),
        );
        Fixture {
            pool: HandlePool::new(engine.clone()),
            engine,
            clock: Arc::new(ManualClock::new(1_000)),
            stats: Arc::new(StatsCounters::new()),
        }
    }

    impl Fixture {
        fn put(&self, key: &str, ttl_ms: Option<i64>) {
            let now = self.clock.now_millis();
            let record = Envelope::new(Some(key.to_string()), ttl_ms.map(|ttl| now + ttl))
                .to_bytes(&Utf8Codec, now)
                .unwrap();
            self.pool.acquire().unwrap().upsert(key, record).unwrap();
        }

        fn start(&self, interval_ms: u64) -> ExpirySweeper {
            ExpirySweeper::start(
                self.pool.clone(),
                self.clock.clone(),
                self.stats.clone(),
                Duration::from_millis(interval_ms),
            )
            .unwrap()
            .unwrap()
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let f = fixture(usize::MAX);
        f.put("expire_soon", Some(10));
        f.put("long_lived", Some(3_600_000));
        f.put("forever", None);

        f.clock.advance(Duration::from_millis(11));
        let removed = sweep_expired(&f.pool, f.clock.as_ref()).await.unwrap();

        assert_eq!(removed, 1);
        assert_eq!(f.engine.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_reads_cold_records() {
        // Zero budget: every read goes through the pending path
        let f = fixture(0);
        for i in 0..20 {
            f.put(&format!("key{i}"), Some(5));
        }
        f.clock.advance(Duration::from_millis(6));

        let removed = sweep_expired(&f.pool, f.clock.as_ref()).await.unwrap();
        assert_eq!(removed, 20);
        assert!(f.engine.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped() {
        let f = fixture(usize::MAX);
        f.pool
            .acquire()
            .unwrap()
            .upsert("garbage", Bytes::from_static(&[0xff, 0x00]))
            .unwrap();
        f.put("expired", Some(1));
        f.clock.advance(Duration::from_millis(2));

        let removed = sweep_expired(&f.pool, f.clock.as_ref()).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(f.engine.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_stops_between_keys() {
        let f = fixture(usize::MAX);
        f.put("a", Some(1));
        f.put("b", Some(1));
        f.clock.advance(Duration::from_millis(2));

        let outcome = sweep_cycle(&f.pool, f.clock.as_ref(), &|| true).await.unwrap();
        assert_eq!(
            outcome,
            SweepOutcome {
                removed: 0,
                cancelled: true
            }
        );
        assert_eq!(f.engine.len(), 2);
    }

    #[tokio::test]
    async fn test_interrupted_cycle_is_not_counted() {
        let f = fixture(usize::MAX);
        for key in ["a", "b", "c", "d"] {
            f.put(key, Some(1));
        }
        f.clock.advance(Duration::from_millis(2));

        // Cancel once two keys have been handled
        let checks = AtomicUsize::new(0);
        let cancelled = || checks.fetch_add(1, Ordering::SeqCst) >= 2;
        let outcome = sweep_cycle(&f.pool, f.clock.as_ref(), &cancelled).await.unwrap();
        assert_eq!(
            outcome,
            SweepOutcome {
                removed: 2,
                cancelled: true
            }
        );

        record_outcome(&f.stats, outcome);
        let stats = f.stats.snapshot();
        assert_eq!(stats.sweep_cycles, 0);
        assert_eq!(stats.swept, 2);
        assert_eq!(f.engine.len(), 2);

        let outcome = sweep_cycle(&f.pool, f.clock.as_ref(), &|| false).await.unwrap();
        record_outcome(&f.stats, outcome);
        let stats = f.stats.snapshot();
        assert_eq!(stats.sweep_cycles, 1);
        assert_eq!(stats.swept, 4);
        assert!(f.engine.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_task_removes_expired_entries() {
        let f = fixture(usize::MAX);
        f.put("expire_soon", Some(100));
        f.put("long_lived", Some(3_600_000));
        f.clock.advance(Duration::from_millis(101));

        let sweeper = f.start(10);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(f.engine.len(), 1);
        assert!(f.stats.snapshot().sweep_cycles >= 1);
        assert_eq!(f.stats.snapshot().swept, 1);
        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweeper_survives_failed_cycles() {
        let f = fixture(usize::MAX);
        f.pool.close();

        let sweeper = f.start(10);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Every cycle fails to acquire a handle, the loop keeps going
        assert!(f.stats.snapshot().sweep_failures >= 2);
        assert_ne!(sweeper.state(), SweeperState::Stopped);
        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_reaches_stopped_state() {
        let f = fixture(usize::MAX);
        let sweeper = f.start(3_600_000);
        let state = sweeper.subscribe();
        assert_eq!(*state.borrow(), SweeperState::Idle);

        sweeper.shutdown().await;
        assert_eq!(*state.borrow(), SweeperState::Stopped);
    }

    #[tokio::test]
    async fn test_zero_interval_disables_sweeper() {
        let f = fixture(usize::MAX);
        let sweeper = ExpirySweeper::start(f.pool.clone(), f.clock.clone(), f.stats.clone(), Duration::ZERO);
        assert!(sweeper.unwrap().is_none());
    }

    #[test]
    fn test_start_outside_runtime_is_config_error() {
        let f = fixture(usize::MAX);
        let result = ExpirySweeper::start(f.pool.clone(), f.clock.clone(), f.stats.clone(), Duration::from_secs(1));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }
}
