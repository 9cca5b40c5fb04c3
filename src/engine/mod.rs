//! Engine Module
//!
//! The capability interface the cache consumes from an embedded, ordered
//! key-value engine. Operations may finish immediately or report that they
//! are pending; pending work is finished by draining the session, either
//! blocking ([`EngineSession::complete_pending`]) or by awaiting one of the
//! async variants.

mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::EngineError;

pub use memory::{MemoryEngine, MemorySession};

// == Read Status ==
/// Outcome of a point read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStatus {
    Found(Bytes),
    NotFound,
    /// The record is not in memory; drain the session to get the result.
    Pending,
}

/// A read that finished while draining pending operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRead {
    pub key: String,
    /// None when the key vanished before the read completed
    pub value: Option<Bytes>,
}

/// Cursor over every key in engine order.
pub type KeyCursor = Box<dyn Iterator<Item = String> + Send>;

// == Engine Options ==
/// Sizing and storage settings handed to [`Engine::open`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// File stem for records under `storage_path`
    pub name: String,
    /// Directory holding checkpoints; None keeps the engine purely in memory
    pub storage_path: Option<PathBuf>,
    /// Hash index size hint, must be a power of two
    pub index_capacity: usize,
    /// Bytes of record data kept resident before older records go cold
    pub memory_budget: usize,
    /// Remove backing files on close instead of keeping them
    pub delete_on_close: bool,
    /// Reload the latest checkpoint on open
    pub try_recover_latest: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            name: "cache".to_string(),
            storage_path: None,
            index_capacity: 1 << 17,
            memory_budget: 16 * 1024 * 1024,
            delete_on_close: true,
            try_recover_latest: false,
        }
    }
}

// == Engine ==
/// An embedded key-value engine.
pub trait Engine: Send + Sync + Sized + 'static {
    type Session: EngineSession;

    fn open(options: EngineOptions) -> Result<Self, EngineError>;

    /// Creates a session. Sessions are expensive; callers pool them.
    fn new_session(&self) -> Result<Self::Session, EngineError>;

    /// Persists a consistent snapshot of every record.
    fn checkpoint(&self) -> Result<(), EngineError>;

    /// Closes the engine and its backing storage. Safe to call twice.
    fn close(&self) -> Result<(), EngineError>;
}

// == Engine Session ==
/// A non-shareable connection into the engine. One operation at a time.
#[async_trait]
pub trait EngineSession: Send + 'static {
    fn read(&mut self, key: &str) -> Result<ReadStatus, EngineError>;

    /// Unconditional insert-or-overwrite.
    fn upsert(&mut self, key: &str, value: Bytes) -> Result<(), EngineError>;

    /// Removes `key`; removing an absent key is not an error.
    fn delete(&mut self, key: &str) -> Result<(), EngineError>;

    /// Finishes outstanding operations and returns the reads among them.
    /// With `wait` it does not return until nothing is pending.
    fn complete_pending(&mut self, wait: bool) -> Result<Vec<CompletedRead>, EngineError>;

    fn pending_count(&self) -> usize;

    fn iterate(&mut self) -> Result<KeyCursor, EngineError>;

    /// Point read that drains a pending result before returning.
    fn read_blocking(&mut self, key: &str) -> Result<Option<Bytes>, EngineError> {
        match self.read(key)? {
            ReadStatus::Found(value) => Ok(Some(value)),
            ReadStatus::NotFound => Ok(None),
            ReadStatus::Pending => {
                let completed = self.complete_pending(true)?;
                Ok(take_completed(completed, key).flatten())
            }
        }
    }

    async fn read_async(&mut self, key: &str) -> Result<Option<Bytes>, EngineError> {
        match self.read(key)? {
            ReadStatus::Found(value) => Ok(Some(value)),
            ReadStatus::NotFound => Ok(None),
            ReadStatus::Pending => loop {
                tokio::task::yield_now().await;
                let completed = self.complete_pending(false)?;
                if let Some(value) = take_completed(completed, key) {
                    return Ok(value);
                }
                if self.pending_count() == 0 {
                    return Ok(None);
                }
            },
        }
    }

    async fn upsert_async(&mut self, key: &str, value: Bytes) -> Result<(), EngineError> {
        self.upsert(key, value)?;
        self.drain_async().await
    }

    async fn delete_async(&mut self, key: &str) -> Result<(), EngineError> {
        self.delete(key)?;
        self.drain_async().await
    }

    /// Yields to the runtime until nothing is pending on this session.
    async fn drain_async(&mut self) -> Result<(), EngineError> {
        while self.pending_count() > 0 {
            tokio::task::yield_now().await;
            self.complete_pending(false)?;
        }
        Ok(())
    }
}

/// Latest completion for `key`; the outer None means it has not completed.
fn take_completed(completed: Vec<CompletedRead>, key: &str) -> Option<Option<Bytes>> {
    completed
        .into_iter()
        .rev()
        .find(|read| read.key == key)
        .map(|read| read.value)
}
