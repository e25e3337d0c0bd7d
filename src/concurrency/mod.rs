use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use log::debug;

use crate::buffer::buffer_pool::BufferPool;

pub mod lock_manager;
mod registry;
mod wait_for;

pub use lock_manager::{LockManager, Permission};

/// Identifies a transaction. Ids are handed out by a `TransactionManager` and never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Transaction<'a> {
    tid: TransactionId,
    manager: &'a TransactionManager<'a>,
}

impl<'a> Transaction<'a> {
    /// Returns its own transaction id
    pub fn tid(&self) -> TransactionId {
        self.tid
    }

    /// Flushes every page this transaction dirtied and releases its locks.
    pub fn commit(self) -> Result<()> {
        self.manager.complete(self.tid, true)
    }

    /// Discards the in-memory changes of this transaction and releases its locks.
    pub fn abort(self) -> Result<()> {
        self.manager.complete(self.tid, false)
    }
}

pub struct TransactionManager<'a> {
    buffer_pool: &'a BufferPool,
    next_tid: AtomicU64,
}

impl<'a> TransactionManager<'a> {
    pub fn new(buffer_pool: &'a BufferPool) -> Self {
        Self {
            buffer_pool,
            next_tid: AtomicU64::new(1),
        }
    }

    pub fn start_transaction(&'a self) -> Transaction<'a> {
        let tid = TransactionId(self.next_tid.fetch_add(1, Ordering::Relaxed));
        debug!("Started transaction {}", tid);
        Transaction { tid, manager: self }
    }

    fn complete(&self, tid: TransactionId, commit: bool) -> Result<()> {
        let action = if commit { "commit" } else { "abort" };
        self.buffer_pool
            .transaction_complete(tid, commit)
            .with_context(|| format!("Failed to {} transaction {}", action, tid))
    }
}
