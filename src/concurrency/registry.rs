use std::collections::{HashMap, HashSet};

use super::TransactionId;
use crate::common::PageId;

/// Reverse index from a transaction to the pages it currently holds a lock on.
/// The page lock states remain the source of truth, this only exists to release
/// everything a transaction holds in one go.
#[derive(Default, Debug)]
pub(in crate::concurrency) struct TransactionRegistry {
    held_pages: HashMap<TransactionId, HashSet<PageId>>,
}

impl TransactionRegistry {
    pub fn register(&mut self, tid: TransactionId, page_id: PageId) {
        self.held_pages.entry(tid).or_default().insert(page_id);
    }

    pub fn remove(&mut self, tid: TransactionId, page_id: PageId) {
        if let Some(pages) = self.held_pages.get_mut(&tid) {
            pages.remove(&page_id);
            if pages.is_empty() {
                self.held_pages.remove(&tid);
            }
        }
    }

    /// Removes and returns all pages held by `tid`.
    pub fn take(&mut self, tid: TransactionId) -> HashSet<PageId> {
        self.held_pages.remove(&tid).unwrap_or_default()
    }

    /// All transactions holding at least one lock.
    pub fn transactions(&self) -> impl Iterator<Item = &TransactionId> {
        self.held_pages.keys()
    }

    pub fn pages(&self, tid: TransactionId) -> Vec<PageId> {
        self.held_pages
            .get(&tid)
            .map(|pages| pages.iter().copied().collect())
            .unwrap_or_default()
    }
}
