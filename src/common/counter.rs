use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Insert and delete counters sharded by counter id, so that concurrent
/// writers on different threads do not contend on one cache line.
///
/// The element count is `Σinserts − Σdeletes`. It is never locked, so it is
/// only exact when no writer is in flight.
pub(crate) struct ShardedCounters {
    inserts: Box<[CachePadded<AtomicUsize>]>,
    deletes: Box<[CachePadded<AtomicUsize>]>,
}

impl ShardedCounters {
    pub(crate) fn new(num_shards: usize) -> Self {
        assert!(num_shards > 0);
        let shards = || {
            (0..num_shards)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect::<Vec<_>>()
                .into_boxed_slice()
        };
        Self {
            inserts: shards(),
            deletes: shards(),
        }
    }

    #[inline]
    pub(crate) fn record_insert(&self, counter_id: usize) {
        self.inserts[counter_id % self.inserts.len()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_delete(&self, counter_id: usize) {
        self.deletes[counter_id % self.deletes.len()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inserts(&self) -> usize {
        sum(&self.inserts)
    }

    pub(crate) fn deletes(&self) -> usize {
        sum(&self.deletes)
    }

    pub(crate) fn len(&self) -> usize {
        // Deletes are read first; a racing insert/delete pair can then only
        // make the result too large, never wrap around.
        let deletes = self.deletes();
        self.inserts().saturating_sub(deletes)
    }
}

fn sum(shards: &[CachePadded<AtomicUsize>]) -> usize {
    shards.iter().map(|c| c.load(Ordering::Relaxed)).sum()
}

#[cfg(test)]
mod tests {
    use super::ShardedCounters;

    #[test]
    fn len_is_inserts_minus_deletes() {
        let counters = ShardedCounters::new(4);
        for id in 0..10 {
            counters.record_insert(id);
        }
        counters.record_delete(7);
        counters.record_delete(100);

        assert_eq!(counters.inserts(), 10);
        assert_eq!(counters.deletes(), 2);
        assert_eq!(counters.len(), 8);
    }
}
