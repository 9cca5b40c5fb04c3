//! Handle Pool Module
//!
//! Reusable engine sessions. Each operation borrows one session through a
//! [`PooledHandle`] guard, which drains pending work and hands the session
//! back when dropped. The pool grows to peak concurrency and never shrinks.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use tracing::{debug, warn};

use crate::engine::{Engine, EngineSession};
use crate::error::{CacheError, Result};

// == Handle Pool ==
/// Lock-free free list of idle engine sessions.
pub struct HandlePool<E: Engine> {
    engine: Arc<E>,
    idle: SegQueue<E::Session>,
    created: AtomicUsize,
    closed: AtomicBool,
}

impl<E: Engine> HandlePool<E> {
    pub fn new(engine: Arc<E>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            idle: SegQueue::new(),
            created: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    // == Acquire ==
    /// Borrows an idle session, or creates one when none is idle.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledHandle<E>> {
        if self.is_closed() {
            return Err(CacheError::Closed);
        }

        let session = match self.idle.pop() {
            Some(session) => session,
            None => {
                let session = self.engine.new_session()?;
                let total = self.created.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(total, "Created engine session");
                session
            }
        };

        Ok(PooledHandle {
            session: Some(session),
            pool: Arc::clone(self),
        })
    }

    // == Release ==
    fn release(&self, mut session: E::Session) {
        if session.pending_count() > 0 {
            if let Err(e) = session.complete_pending(true) {
                warn!(error = %e, "Discarding session that failed to drain");
                return;
            }
        }

        if self.is_closed() {
            return;
        }
        self.idle.push(session);

        // close() may have drained the queue between the check and the push
        if self.is_closed() {
            self.drain_idle();
        }
    }

    // == Close ==
    /// Stops handing out sessions and drops every idle one. Sessions still
    /// borrowed are dropped as they come back.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let dropped = self.drain_idle();
        debug!(dropped, "Handle pool closed");
    }

    fn drain_idle(&self) -> usize {
        let mut dropped = 0;
        while self.idle.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sessions waiting for reuse.
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Sessions created over the pool's lifetime.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl<E: Engine> fmt::Debug for HandlePool<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlePool")
            .field("idle", &self.idle_count())
            .field("created", &self.created_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// == Pooled Handle ==
/// Exclusive loan of one session; returned to the pool on drop.
pub struct PooledHandle<E: Engine> {
    session: Option<E::Session>,
    pool: Arc<HandlePool<E>>,
}

impl<E: Engine> Deref for PooledHandle<E> {
    type Target = E::Session;

    fn deref(&self) -> &E::Session {
        self.session.as_ref().expect("session present until drop")
    }
}

impl<E: Engine> DerefMut for PooledHandle<E> {
    fn deref_mut(&mut self) -> &mut E::Session {
        self.session.as_mut().expect("session present until drop")
    }
}

impl<E: Engine> Drop for PooledHandle<E> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }
}
