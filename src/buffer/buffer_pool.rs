use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, trace};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::clock_replacer::ClockReplacer;
use super::PoolPos;
use crate::common::{PageId, PageNo, StorageConfig, TableId};
use crate::concurrency::{LockManager, Permission, TransactionId};
use crate::error::DbError;
use crate::storage::file_manager::FileManager;

/// An in-memory copy of a page.
/// The page lock of the lock manager decides who may touch the content,
/// the RwLock only guards the memory itself.
#[derive(Debug)]
pub struct Buffer {
    page_id: PageId,
    dirtied_by: Mutex<Option<TransactionId>>,
    data: RwLock<Box<[u8]>>,
}

impl Buffer {
    fn new(page_id: PageId, data: Box<[u8]>) -> Self {
        Self {
            page_id,
            dirtied_by: Mutex::new(None),
            data: RwLock::new(data),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<Box<[u8]>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<Box<[u8]>> {
        self.data.write()
    }

    pub fn mark_dirty(&self, tid: TransactionId) {
        *self.dirtied_by.lock() = Some(tid);
    }

    /// The transaction which modified this page since it was last read or written.
    pub fn dirtied_by(&self) -> Option<TransactionId> {
        *self.dirtied_by.lock()
    }

    fn clear_dirty(&self) {
        *self.dirtied_by.lock() = None;
    }
}

struct Frames {
    pool: Vec<Option<Arc<Buffer>>>,
    clock_replacer: ClockReplacer,
    page_id_to_pool_pos: HashMap<PageId, PoolPos>,
}

/// A bounded cache of pages. Every page access goes through `get_page`, which first
/// acquires the requested lock for the transaction.
///
/// Dirty pages are never evicted, they are written back when their transaction
/// commits and re-read from disk when it aborts.
pub struct BufferPool {
    pool_size: usize,
    frames: Mutex<Frames>,
    file_manager: FileManager,
    lock_manager: LockManager,
}

impl BufferPool {
    pub fn new(file_manager: FileManager, lock_manager: LockManager, pool_size: usize) -> Self {
        let pool = (0..pool_size).map(|_| None).collect();

        Self {
            pool_size,
            frames: Mutex::new(Frames {
                pool,
                clock_replacer: ClockReplacer::new(pool_size),
                page_id_to_pool_pos: HashMap::new(),
            }),
            file_manager,
            lock_manager,
        }
    }

    /// Opens all tables inside `data_directory` and creates a buffer pool with its own lock manager.
    pub fn open(data_directory: impl Into<PathBuf>, config: StorageConfig) -> Result<Self> {
        let file_manager = FileManager::new(data_directory, config.page_size)?;
        Ok(Self::new(file_manager, LockManager::new(), config.pool_size))
    }

    pub fn page_size(&self) -> usize {
        self.file_manager.page_size()
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    pub fn create_table(&self, table_id: TableId) -> Result<()> {
        self.file_manager.create_table(table_id)
    }

    pub fn num_pages(&self, table_id: TableId) -> Result<PageNo> {
        self.file_manager.num_pages(table_id)
    }

    /// Appends an empty page to the table's file and returns its page number.
    /// The page does not get locked, fetch it through `get_page` before using it.
    pub fn allocate_page(&self, table_id: TableId) -> Result<PageNo> {
        let empty_page = vec![0u8; self.page_size()];
        self.file_manager.allocate_new_page(table_id, &empty_page)
    }

    /// Locks a page for a transaction and returns it. Blocks until the lock is granted.
    /// Fails with `DbError::TransactionAborted` if the lock request would deadlock.
    pub fn get_page(
        &self,
        tid: TransactionId,
        page_id: PageId,
        permission: Permission,
    ) -> Result<Arc<Buffer>> {
        self.lock_manager
            .acquire(tid, page_id, permission)
            .with_context(|| format!("Could not lock page {} for transaction {}", page_id, tid))?;

        let mut frames = self.frames.lock();
        if let Some(&pool_pos) = frames.page_id_to_pool_pos.get(&page_id) {
            frames.clock_replacer.touch(pool_pos);
            if let Some(buffer) = &frames.pool[pool_pos] {
                return Ok(Arc::clone(buffer));
            }
        }

        let pool_pos = self.find_free_frame(&mut frames)?;
        let mut data = vec![0u8; self.page_size()].into_boxed_slice();
        self.file_manager.read_page(page_id, &mut data)?;

        let buffer = Arc::new(Buffer::new(page_id, data));
        frames.pool[pool_pos] = Some(Arc::clone(&buffer));
        frames.page_id_to_pool_pos.insert(page_id, pool_pos);
        frames.clock_replacer.touch(pool_pos);
        trace!("Read page {} into buffer {}", page_id, pool_pos);

        Ok(buffer)
    }

    /// Gives up the lock of a transaction on a single page before the transaction ends.
    /// Only safe if the transaction neither read anything it depends on nor modified the page.
    pub fn release_page(&self, tid: TransactionId, page_id: PageId) {
        self.lock_manager.release(tid, page_id);
    }

    pub fn holds_lock(&self, tid: TransactionId, page_id: PageId) -> bool {
        self.lock_manager.is_held(tid, page_id)
    }

    /// Ends a transaction. On commit, all pages dirtied by it are forced to disk,
    /// on abort they are restored from disk. Afterwards all its locks are released.
    pub fn transaction_complete(&self, tid: TransactionId, commit: bool) -> Result<()> {
        let dirty_buffers = self.dirty_buffers(tid);
        debug!(
            "Transaction {} {} with {} dirty pages",
            tid,
            if commit { "commits" } else { "aborts" },
            dirty_buffers.len()
        );

        let result = dirty_buffers.iter().try_for_each(|buffer| {
            if commit {
                self.flush_buffer(buffer)
            } else {
                self.reload_buffer(buffer)
            }
        });
        self.lock_manager.release_all(tid);
        result
    }

    fn dirty_buffers(&self, tid: TransactionId) -> Vec<Arc<Buffer>> {
        let frames = self.frames.lock();
        frames
            .pool
            .iter()
            .flatten()
            .filter(|buffer| buffer.dirtied_by() == Some(tid))
            .cloned()
            .collect()
    }

    fn flush_buffer(&self, buffer: &Buffer) -> Result<()> {
        let data = buffer.read();
        self.file_manager.write_page(buffer.page_id(), &data)?;
        buffer.clear_dirty();
        Ok(())
    }

    fn reload_buffer(&self, buffer: &Buffer) -> Result<()> {
        let mut data = buffer.write();
        self.file_manager.read_page(buffer.page_id(), &mut data)?;
        buffer.clear_dirty();
        Ok(())
    }

    /// Finds an empty frame or evicts a page nobody references and nobody modified.
    fn find_free_frame(&self, frames: &mut Frames) -> Result<PoolPos> {
        if let Some(pool_pos) = frames.pool.iter().position(Option::is_none) {
            return Ok(pool_pos);
        }

        let Frames {
            pool,
            clock_replacer,
            page_id_to_pool_pos,
        } = frames;
        let victim = clock_replacer.find_victim(|pool_pos| match &pool[pool_pos] {
            None => true,
            Some(buffer) => Arc::strong_count(buffer) == 1 && buffer.dirtied_by().is_none(),
        });

        match victim {
            Some(pool_pos) => {
                if let Some(buffer) = pool[pool_pos].take() {
                    page_id_to_pool_pos.remove(&buffer.page_id());
                    trace!("Evicted page {} from buffer {}", buffer.page_id(), pool_pos);
                }
                Ok(pool_pos)
            }
            None => Err(DbError::BufferPoolFull(self.pool_size).into()),
        }
    }
}
