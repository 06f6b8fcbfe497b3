//! Deferred reclamation of retired generations and erased entries.
//!
//! Every table owns its own epoch [`Collector`]. A worker registers once and
//! gets a [`ThreadContext`]; pinning the context announces that the worker may
//! be holding references into the table, and dropping the pin withdraws the
//! announcement. A generation retired by a resize is destroyed only after
//! every pin that could have observed it has been dropped.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crossbeam_epoch::{Collector, Guard, LocalHandle, Shared};

use super::generation::Generation;

// Each round advances the epoch at most once and destroys a few sealed bags.
const COLLECT_ROUNDS: usize = 256;

pub(crate) struct Reclaimer {
    collector: Collector,
    num_counters: usize,
    next_counter_id: AtomicUsize,
    retired: AtomicUsize,
    freed: Arc<AtomicUsize>,
}

impl Reclaimer {
    pub(crate) fn new(num_counters: usize) -> Self {
        Self {
            collector: Collector::new(),
            num_counters,
            next_counter_id: AtomicUsize::new(0),
            retired: AtomicUsize::default(),
            freed: Arc::default(),
        }
    }

    /// Registers a new worker. Counter ids are assigned round-robin.
    pub(crate) fn register(&self) -> ThreadContext {
        let counter_id = self.next_counter_id.fetch_add(1, Ordering::Relaxed) % self.num_counters;
        ThreadContext {
            handle: self.collector.register(),
            counter_id,
        }
    }

    /// Hands a generation that is no longer reachable from the table to the
    /// collector.
    ///
    /// # Safety
    ///
    /// `generation` must already be unlinked, `guard` must come from this
    /// reclaimer, and no other thread may retire the same generation.
    pub(crate) unsafe fn retire<K, V>(&self, guard: &Guard, generation: Shared<'_, Generation<K, V>>) {
        assert!(!generation.is_null());
        self.retired.fetch_add(1, Ordering::Relaxed);
        let freed = Arc::clone(&self.freed);
        guard.defer_unchecked(move || {
            drop(generation.into_owned());
            freed.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub(crate) fn retired_generations(&self) -> usize {
        self.retired.load(Ordering::Relaxed)
    }

    pub(crate) fn freed_generations(&self) -> usize {
        self.freed.load(Ordering::Relaxed)
    }

    /// Repeatedly advances the epoch so that garbage whose epoch has passed is
    /// destroyed. Garbage still protected by a live pin survives.
    pub(crate) fn collect(&self) {
        let handle = self.collector.register();
        for _ in 0..COLLECT_ROUNDS {
            handle.pin().flush();
        }
    }
}

/// A worker's registration with a table.
pub(crate) struct ThreadContext {
    handle: LocalHandle,
    counter_id: usize,
}

impl ThreadContext {
    #[inline]
    pub(crate) fn pin(&self) -> Guard {
        self.handle.pin()
    }

    #[inline]
    pub(crate) fn counter_id(&self) -> usize {
        self.counter_id
    }
}
