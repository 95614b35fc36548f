//! Per-node capacity and outcome counters
//!
//! Counters are sharded by node address: each node owns an
//! `Arc<NodeCounters>` of atomics, so sessions touching different nodes never
//! contend and sessions touching the same node never lose increments.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::{Address, Outcome, Pool, Statistics};

/// Counters for one node
#[derive(Debug, Default)]
pub struct NodeCounters {
    short_running_free: AtomicU64,
    long_running_free: AtomicU64,
    outcomes: [AtomicU64; 8],
}

impl NodeCounters {
    fn free_cell(&self, pool: Pool) -> &AtomicU64 {
        match pool {
            Pool::ShortRunning => &self.short_running_free,
            Pool::LongRunning => &self.long_running_free,
        }
    }

    pub fn free(&self, pool: Pool) -> u64 {
        self.free_cell(pool).load(Ordering::SeqCst)
    }

    pub fn set_free(&self, pool: Pool, value: u64) {
        self.free_cell(pool).store(value, Ordering::SeqCst);
    }

    /// Count one slot as taken, never going below zero
    pub fn take_slot(&self, pool: Pool) -> u64 {
        let cell = self.free_cell(pool);
        let previous = cell
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |free| Some(free.saturating_sub(1)))
            .unwrap_or_default();
        previous.saturating_sub(1)
    }

    /// Bump an outcome counter, returning the new value
    pub fn record(&self, outcome: Outcome) -> u64 {
        self.outcomes[outcome.index()].fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn snapshot(&self) -> Statistics {
        let mut stats = Statistics {
            short_running_free: self.free(Pool::ShortRunning),
            long_running_free: self.free(Pool::LongRunning),
            ..Default::default()
        };
        for outcome in Outcome::ALL {
            stats.set_outcome(outcome, self.outcomes[outcome.index()].load(Ordering::SeqCst));
        }
        stats
    }
}

/// Counters for every node this node has heard about
#[derive(Clone, Default)]
pub struct CapacityTable {
    nodes: Arc<DashMap<Address, Arc<NodeCounters>>>,
}

impl CapacityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for a node, created on first use
    fn counters(&self, id: &Address) -> Arc<NodeCounters> {
        if let Some(counters) = self.nodes.get(id) {
            return counters.value().clone();
        }
        self.nodes.entry(id.clone()).or_default().value().clone()
    }

    /// Cached free count; 0 for a node nobody reported yet
    pub fn free(&self, id: &Address, pool: Pool) -> u64 {
        self.nodes.get(id).map(|c| c.free(pool)).unwrap_or(0)
    }

    pub fn set_free(&self, id: &Address, pool: Pool, value: u64) {
        self.counters(id).set_free(pool, value);
    }

    /// Optimistically take a slot on a node that just accepted work, until
    /// its next UPDATE arrives
    pub fn take_slot(&self, id: &Address, pool: Pool) -> u64 {
        self.counters(id).take_slot(pool)
    }

    pub fn record(&self, id: &Address, outcome: Outcome) -> u64 {
        self.counters(id).record(outcome)
    }

    pub fn statistics(&self, id: &Address) -> Statistics {
        self.nodes.get(id).map(|c| c.snapshot()).unwrap_or_default()
    }

    pub fn contains(&self, id: &Address) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn remove(&self, id: &Address) {
        self.nodes.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(id: &str) -> Address {
        Address::new(id, "127.0.0.1:1")
    }

    #[test]
    fn test_update_then_get() {
        let table = CapacityTable::new();
        let a = addr("a");

        assert_eq!(table.free(&a, Pool::ShortRunning), 0);
        assert!(!table.contains(&a));

        table.set_free(&a, Pool::ShortRunning, 7);
        table.set_free(&a, Pool::LongRunning, 2);
        assert_eq!(table.free(&a, Pool::ShortRunning), 7);
        assert_eq!(table.free(&a, Pool::LongRunning), 2);

        // Last writer wins
        table.set_free(&a, Pool::ShortRunning, 1);
        assert_eq!(table.free(&a, Pool::ShortRunning), 1);
    }

    #[test]
    fn test_take_slot_saturates() {
        let table = CapacityTable::new();
        let a = addr("a");
        table.set_free(&a, Pool::LongRunning, 1);
        assert_eq!(table.take_slot(&a, Pool::LongRunning), 0);
        assert_eq!(table.take_slot(&a, Pool::LongRunning), 0);
        assert_eq!(table.free(&a, Pool::LongRunning), 0);
        assert_eq!(table.free(&a, Pool::ShortRunning), 0);
    }

    #[test]
    fn test_reads_do_not_create_entries() {
        let table = CapacityTable::new();
        let a = addr("a");
        table.free(&a, Pool::LongRunning);
        table.statistics(&a);
        assert!(!table.contains(&a));
    }

    #[test]
    fn test_statistics_snapshot() {
        let table = CapacityTable::new();
        let a = addr("a");

        table.set_free(&a, Pool::LongRunning, 3);
        table.record(&a, Outcome::DoWorkAccepted);
        table.record(&a, Outcome::DoWorkAccepted);
        assert_eq!(table.record(&a, Outcome::WorkFailed), 1);

        let stats = table.statistics(&a);
        assert_eq!(stats.long_running_free, 3);
        assert_eq!(stats.do_work_accepted, 2);
        assert_eq!(stats.work_failed, 1);
        assert_eq!(stats.work_successful, 0);
    }

    #[test]
    fn test_remove_drops_counters() {
        let table = CapacityTable::new();
        let a = addr("a");
        table.record(&a, Outcome::WorkSuccessful);
        table.remove(&a);
        assert!(!table.contains(&a));
        assert_eq!(table.statistics(&a), Statistics::default());
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let table = CapacityTable::new();
        let nodes: Vec<_> = (0..4).map(|i| addr(&format!("n{}", i))).collect();

        std::thread::scope(|s| {
            for t in 0..8 {
                let table = table.clone();
                let nodes = &nodes;
                s.spawn(move || {
                    for i in 0..1000 {
                        let node = &nodes[(t + i) % nodes.len()];
                        table.record(node, Outcome::WorkSuccessful);
                        table.record(node, Outcome::WorkFailed);
                    }
                });
            }
        });

        let total: u64 = nodes
            .iter()
            .map(|n| table.statistics(n).work_successful)
            .sum();
        assert_eq!(total, 8000);
        for node in &nodes {
            let stats = table.statistics(node);
            assert_eq!(stats.work_successful, 2000);
            assert_eq!(stats.work_failed, 2000);
        }
    }
}
