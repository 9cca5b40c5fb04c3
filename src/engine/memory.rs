//! In-memory reference engine
//!
//! An ordered (BTreeMap) engine with a resident-memory budget. Records that
//! fall outside the budget go cold; reading a cold record reports
//! [`ReadStatus::Pending`] and the value is loaded back when the session is
//! drained. Checkpoints are written to `<storage_path>/<name>.checkpoint`.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{CompletedRead, Engine, EngineOptions, EngineSession, KeyCursor, ReadStatus};
use crate::error::EngineError;

const CHECKPOINT_MAGIC: &[u8; 4] = b"EKV1";

// == Record ==
#[derive(Debug)]
struct Record {
    value: Bytes,
    generation: u64,
    resident: bool,
}

// == Engine State ==
#[derive(Debug, Default)]
struct State {
    records: BTreeMap<String, Record>,
    /// Residency order, oldest first; stale generations are skipped on eviction
    resident: VecDeque<(String, u64)>,
    resident_bytes: usize,
    next_generation: u64,
}

impl State {
    fn insert(&mut self, key: &str, value: Bytes, budget: usize) {
        let generation = self.bump_generation();
        self.resident_bytes += value.len();
        self.resident.push_back((key.to_string(), generation));

        let previous = self.records.insert(
            key.to_string(),
            Record {
                value,
                generation,
                resident: true,
            },
        );
        if let Some(previous) = previous.filter(|r| r.resident) {
            self.resident_bytes -= previous.value.len();
        }
        self.evict(budget);
        if self.resident.len() > 2 * self.records.len() + 64 {
            self.compact();
        }
    }

    /// Drops residency entries left behind by overwrites and deletes.
    fn compact(&mut self) {
        let records = &self.records;
        self.resident.retain(|(key, generation)| {
            records
                .get(key)
                .is_some_and(|r| r.resident && r.generation == *generation)
        });
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.records.remove(key) {
            Some(record) => {
                if record.resident {
                    self.resident_bytes -= record.value.len();
                }
                true
            }
            None => false,
        }
    }

    /// Brings a cold record back into memory and returns its value.
    fn load(&mut self, key: &str, budget: usize) -> Option<Bytes> {
        let generation = self.bump_generation();
        let record = self.records.get_mut(key)?;
        let value = record.value.clone();
        if !record.resident {
            record.resident = true;
            record.generation = generation;
            self.resident_bytes += value.len();
            self.resident.push_back((key.to_string(), generation));
            self.evict(budget);
        }
        Some(value)
    }

    fn evict(&mut self, budget: usize) {
        while self.resident_bytes > budget {
            let Some((key, generation)) = self.resident.pop_front() else {
                break;
            };
            if let Some(record) = self.records.get_mut(&key) {
                if record.resident && record.generation == generation {
                    record.resident = false;
                    self.resident_bytes -= record.value.len();
                }
            }
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

#[derive(Debug)]
struct Shared {
    options: EngineOptions,
    state: RwLock<State>,
    closed: AtomicBool,
}

impl Shared {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }
}

// == Memory Engine ==
/// Ordered in-memory engine with optional checkpoint files.
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl MemoryEngine {
    /// A purely in-memory engine with default sizing.
    pub fn in_memory() -> Self {
        Self::from_state(EngineOptions::default(), State::default())
    }

    fn from_state(options: EngineOptions, state: State) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                state: RwLock::new(state),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.shared.options
    }

    /// Number of records, expired or not.
    pub fn len(&self) -> usize {
        self.shared.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of record data currently resident.
    pub fn resident_bytes(&self) -> usize {
        self.shared.state.read().resident_bytes
    }

    /// Where checkpoints go, None for a purely in-memory engine.
    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        checkpoint_path(&self.shared.options)
    }
}

fn checkpoint_path(options: &EngineOptions) -> Option<PathBuf> {
    options
        .storage_path
        .as_ref()
        .map(|dir| dir.join(format!("{}.checkpoint", options.name)))
}

impl Engine for MemoryEngine {
    type Session = MemorySession;

    fn open(options: EngineOptions) -> Result<Self, EngineError> {
        if !options.index_capacity.is_power_of_two() {
            return Err(EngineError::InvalidOptions(format!(
                "index capacity must be a power of two, got {}",
                options.index_capacity
            )));
        }

        let mut state = State {
            resident: VecDeque::with_capacity(options.index_capacity.min(1 << 16)),
            ..State::default()
        };

        if options.try_recover_latest {
            if let Some(path) = checkpoint_path(&options).filter(|p| p.exists()) {
                let records = read_checkpoint(&path)?;
                info!(path = %path.display(), records = records.len(), "Recovered checkpoint");
                for (key, value) in records {
                    // Recovered records start on disk
                    let generation = state.bump_generation();
                    state.records.insert(
                        key,
                        Record {
                            value,
                            generation,
                            resident: false,
                        },
                    );
                }
            }
        }

        Ok(Self::from_state(options, state))
    }

    fn new_session(&self) -> Result<MemorySession, EngineError> {
        self.shared.ensure_open()?;
        Ok(MemorySession {
            shared: self.shared.clone(),
            pending: VecDeque::new(),
        })
    }

    fn checkpoint(&self) -> Result<(), EngineError> {
        self.shared.ensure_open()?;
        let Some(path) = self.checkpoint_path() else {
            debug!("No storage path configured, skipping checkpoint");
            return Ok(());
        };

        let snapshot = {
            let state = self.shared.state.read();
            encode_checkpoint(&state.records)?
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("checkpoint.tmp");
        fs::write(&tmp, &snapshot)?;
        fs::rename(&tmp, &path)?;

        info!(path = %path.display(), bytes = snapshot.len(), "Checkpoint written");
        Ok(())
    }

    fn close(&self) -> Result<(), EngineError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shared.state.write().records.clear();

        if self.shared.options.delete_on_close {
            if let Some(path) = self.checkpoint_path() {
                remove_if_exists(&path)?;
                if let Some(dir) = path.parent() {
                    // Only succeeds when nothing else lives there
                    let _ = fs::remove_dir(dir);
                }
            }
        }

        info!(name = %self.shared.options.name, "Engine closed");
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<(), EngineError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

// == Checkpoint Format ==
// | magic | count | (key len | key | value len | value)* |
// |  4B   |  8B   |   4B    |     |    4B     |       |
fn encode_checkpoint(records: &BTreeMap<String, Record>) -> Result<Bytes, EngineError> {
    let payload: usize = records
        .iter()
        .map(|(key, record)| 8 + key.len() + record.value.len())
        .sum();
    let mut buf = BytesMut::with_capacity(12 + payload);
    buf.put_slice(CHECKPOINT_MAGIC);
    buf.put_u64_le(u64::try_from(records.len()).map_err(|_| EngineError::RecordTooLarge(records.len()))?);
    for (key, record) in records {
        buf.put_u32_le(chunk_len(key.len())?);
        buf.put_slice(key.as_bytes());
        buf.put_u32_le(chunk_len(record.value.len())?);
        buf.put_slice(&record.value);
    }
    Ok(buf.freeze())
}

/// Length prefix for a key or value; chunks must fit in four bytes.
fn chunk_len(len: usize) -> Result<u32, EngineError> {
    u32::try_from(len).map_err(|_| EngineError::RecordTooLarge(len))
}

fn read_checkpoint(path: &Path) -> Result<Vec<(String, Bytes)>, EngineError> {
    let mut buf = Bytes::from(fs::read(path)?);
    let corrupt = |what: &str| EngineError::CorruptCheckpoint(format!("{}: {}", path.display(), what));

    if buf.remaining() < 12 || &buf[..4] != CHECKPOINT_MAGIC {
        return Err(corrupt("bad header"));
    }
    buf.advance(4);
    let count = buf.get_u64_le();

    let mut records = Vec::new();
    for _ in 0..count {
        let key = take_chunk(&mut buf).ok_or_else(|| corrupt("truncated key"))?;
        let key = String::from_utf8(key.to_vec()).map_err(|_| corrupt("key is not UTF-8"))?;
        let value = take_chunk(&mut buf).ok_or_else(|| corrupt("truncated value"))?;
        records.push((key, value));
    }
    Ok(records)
}

fn take_chunk(buf: &mut Bytes) -> Option<Bytes> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32_le() as usize;
    (buf.remaining() >= len).then(|| buf.split_to(len))
}

// == Memory Session ==
/// Session over a [`MemoryEngine`]; tracks its own pending reads.
#[derive(Debug)]
pub struct MemorySession {
    shared: Arc<Shared>,
    pending: VecDeque<String>,
}

impl EngineSession for MemorySession {
    fn read(&mut self, key: &str) -> Result<ReadStatus, EngineError> {
        self.shared.ensure_open()?;
        let state = self.shared.state.read();
        match state.records.get(key) {
            None => Ok(ReadStatus::NotFound),
            Some(record) if record.resident => Ok(ReadStatus::Found(record.value.clone())),
            Some(_) => {
                self.pending.push_back(key.to_string());
                Ok(ReadStatus::Pending)
            }
        }
    }

    fn upsert(&mut self, key: &str, value: Bytes) -> Result<(), EngineError> {
        self.shared.ensure_open()?;
        let budget = self.shared.options.memory_budget;
        self.shared.state.write().insert(key, value, budget);
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), EngineError> {
        self.shared.ensure_open()?;
        self.shared.state.write().remove(key);
        Ok(())
    }

    fn complete_pending(&mut self, _wait: bool) -> Result<Vec<CompletedRead>, EngineError> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        self.shared.ensure_open()?;

        let budget = self.shared.options.memory_budget;
        let mut state = self.shared.state.write();
        Ok(self
            .pending
            .drain(..)
            .map(|key| {
                let value = state.load(&key, budget);
                CompletedRead { key, value }
            })
            .collect())
    }

    fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn iterate(&mut self) -> Result<KeyCursor, EngineError> {
        self.shared.ensure_open()?;
        let keys: Vec<String> = self.shared.state.read().records.keys().cloned().collect();
        Ok(Box::new(keys.into_iter()))
    }
}
