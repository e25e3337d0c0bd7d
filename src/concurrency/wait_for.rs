use std::collections::{HashMap, HashSet, VecDeque};

use super::TransactionId;

/// Records which transactions a blocked transaction is waiting behind.
/// Only active waits are tracked, an edge disappears as soon as the waiter
/// is granted its lock, gives up, or the transaction it waits for releases the page.
#[derive(Default, Debug)]
pub(in crate::concurrency) struct WaitForGraph {
    edges: HashMap<TransactionId, HashSet<TransactionId>>,
}

impl WaitForGraph {
    /// Replaces all outgoing edges of `waiter`.
    pub fn set_waits_for(&mut self, waiter: TransactionId, targets: HashSet<TransactionId>) {
        if targets.is_empty() {
            self.edges.remove(&waiter);
        } else {
            self.edges.insert(waiter, targets);
        }
    }

    pub fn stop_waiting(&mut self, waiter: TransactionId) {
        self.edges.remove(&waiter);
    }

    /// Drops the edge `waiter -> target`, if it exists.
    pub fn remove_edge(&mut self, waiter: TransactionId, target: TransactionId) {
        if let Some(targets) = self.edges.get_mut(&waiter) {
            targets.remove(&target);
            if targets.is_empty() {
                self.edges.remove(&waiter);
            }
        }
    }

    #[cfg(test)]
    pub fn waits_for(&self, waiter: TransactionId) -> Option<&HashSet<TransactionId>> {
        self.edges.get(&waiter)
    }

    /// Runs Kahn's algorithm over the lock holders and the current waiters.
    /// If not every transaction can be consumed in topological order,
    /// the remaining ones form a cycle.
    pub fn has_cycle<'a>(&self, holders: impl IntoIterator<Item = &'a TransactionId>) -> bool {
        let mut indegree: HashMap<TransactionId, usize> =
            holders.into_iter().map(|&tid| (tid, 0)).collect();
        for waiter in self.edges.keys() {
            indegree.entry(*waiter).or_insert(0);
        }
        for targets in self.edges.values() {
            for target in targets {
                *indegree.entry(*target).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<TransactionId> = indegree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&tid, _)| tid)
            .collect();

        let mut consumed = 0;
        while let Some(tid) = queue.pop_front() {
            consumed += 1;
            let Some(targets) = self.edges.get(&tid) else {
                continue;
            };
            for target in targets {
                if let Some(degree) = indegree.get_mut(target) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*target);
                    }
                }
            }
        }

        consumed < indegree.len()
    }
}
