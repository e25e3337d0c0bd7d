use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use super::registry::TransactionRegistry;
use super::wait_for::WaitForGraph;
use super::TransactionId;
use crate::common::PageId;
use crate::error::DbError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Permission {
    Shared,
    Exclusive,
}

impl Permission {
    /// Returns true if holding `self` satisfies a request for `requested`.
    fn covers(&self, requested: Self) -> bool {
        match self {
            Self::Shared => requested == Permission::Shared,
            Self::Exclusive => true,
        }
    }
}

struct PageLockState {
    /// None while nobody holds the page
    permission: Option<Permission>,
    holders: HashSet<TransactionId>,
    waiters: HashSet<TransactionId>,
    condvar: Arc<Condvar>,
}

impl PageLockState {
    fn new() -> Self {
        Self {
            permission: None,
            holders: HashSet::new(),
            waiters: HashSet::new(),
            condvar: Arc::new(Condvar::new()),
        }
    }

    fn is_sole_holder(&self, tid: TransactionId) -> bool {
        self.holders.len() == 1 && self.holders.contains(&tid)
    }

    fn held_permission(&self, tid: TransactionId) -> Option<Permission> {
        if self.holders.contains(&tid) {
            self.permission
        } else {
            None
        }
    }

    fn can_grant(&self, tid: TransactionId, requested: Permission) -> bool {
        match (self.permission, requested) {
            (None, _) => true,
            (Some(Permission::Shared), Permission::Shared) => true,
            // upgrade or re-entry, both only if nobody else holds the page
            (Some(_), _) => self.is_sole_holder(tid),
        }
    }

    fn grant(&mut self, tid: TransactionId, requested: Permission) {
        if self.permission != Some(Permission::Exclusive) {
            self.permission = Some(requested);
        }
        self.holders.insert(tid);
        self.waiters.remove(&tid);
    }

    /// Every other transaction currently holding this page.
    fn blockers(&self, tid: TransactionId) -> HashSet<TransactionId> {
        self.holders
            .iter()
            .filter(|&&holder| holder != tid)
            .copied()
            .collect()
    }

    fn is_unused(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }
}

#[derive(Default)]
struct LockTable {
    pages: HashMap<PageId, PageLockState>,
    wait_for: WaitForGraph,
    registry: TransactionRegistry,
}

impl LockTable {
    /// Releases the lock of `tid` on `page_id` while the table is already locked.
    /// Returns false if `tid` did not hold the page.
    fn release(&mut self, tid: TransactionId, page_id: PageId) -> bool {
        let Some(page) = self.pages.get_mut(&page_id) else {
            return false;
        };
        let released = page.holders.remove(&tid);
        page.waiters.remove(&tid);
        if !released {
            return false;
        }
        if page.holders.is_empty() {
            page.permission = None;
        }
        // the waiters of this page are no longer blocked by tid
        for waiter in &page.waiters {
            self.wait_for.remove_edge(*waiter, tid);
        }
        page.condvar.notify_all();

        let unused = page.is_unused();
        if unused {
            self.pages.remove(&page_id);
        }
        self.registry.remove(tid, page_id);
        trace!("Transaction {} released page {}", tid, page_id);
        true
    }
}

/// Page level two phase locking. A transaction which would have to wait for a lock
/// and thereby close a cycle in the wait-for graph is aborted instead of blocked.
///
/// All bookkeeping is protected by a single mutex; blocked threads wait on a
/// condition variable of the page they are interested in.
pub struct LockManager {
    table: Mutex<LockTable>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
        }
    }

    /// Locks a page. Waits until the lock can be granted.
    /// Returns `DbError::TransactionAborted` if waiting would deadlock. The caller is
    /// then expected to release all of its locks via `release_all`.
    pub fn acquire(&self, tid: TransactionId, page_id: PageId, permission: Permission) -> Result<()> {
        let mut guard = self.table.lock();
        loop {
            let table = &mut *guard;
            let page = table.pages.entry(page_id).or_insert_with(PageLockState::new);

            if let Some(held) = page.held_permission(tid) {
                if held.covers(permission) {
                    return Ok(());
                }
            }

            if page.can_grant(tid, permission) {
                page.grant(tid, permission);
                page.condvar.notify_all();
                table.wait_for.stop_waiting(tid);
                table.registry.register(tid, page_id);
                trace!(
                    "Transaction {} acquired {:?} lock on page {}",
                    tid,
                    permission,
                    page_id
                );
                return Ok(());
            }

            let blockers = page.blockers(tid);
            page.waiters.insert(tid);
            let condvar = Arc::clone(&page.condvar);
            table.wait_for.set_waits_for(tid, blockers);

            if table.wait_for.has_cycle(table.registry.transactions()) {
                table.wait_for.stop_waiting(tid);
                page.waiters.remove(&tid);
                let unused = page.is_unused();
                if unused {
                    table.pages.remove(&page_id);
                }
                condvar.notify_all();
                debug!(
                    "Aborting transaction {}, waiting for {:?} lock on page {} would deadlock",
                    tid, permission, page_id
                );
                return Err(DbError::TransactionAborted(tid).into());
            }

            trace!(
                "Transaction {} waits for {:?} lock on page {}",
                tid,
                permission,
                page_id
            );
            condvar.wait(&mut guard);
        }
    }

    /// Releases the lock of `tid` on a page and wakes up everyone waiting for it.
    /// Releasing a page which is not held is a no-op, the return value tells which case applied.
    pub fn release(&self, tid: TransactionId, page_id: PageId) -> bool {
        let mut table = self.table.lock();
        table.release(tid, page_id)
    }

    /// Releases every lock held by `tid`. Used when a transaction commits or aborts.
    pub fn release_all(&self, tid: TransactionId) {
        let mut table = self.table.lock();
        let pages = table.registry.take(tid);
        let released = pages.len();
        for page_id in pages {
            table.release(tid, page_id);
        }
        table.wait_for.stop_waiting(tid);
        debug!("Released {} locks of transaction {}", released, tid);
    }

    /// Returns whether `tid` holds any lock on the page.
    pub fn is_held(&self, tid: TransactionId, page_id: PageId) -> bool {
        self.held_permission(tid, page_id).is_some()
    }

    pub fn held_permission(&self, tid: TransactionId, page_id: PageId) -> Option<Permission> {
        let table = self.table.lock();
        table
            .pages
            .get(&page_id)
            .and_then(|page| page.held_permission(tid))
    }

    /// All pages `tid` currently holds a lock on, in no particular order.
    pub fn pages_held(&self, tid: TransactionId) -> Vec<PageId> {
        self.table.lock().registry.pages(tid)
    }
}
