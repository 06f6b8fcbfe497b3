use std::hash::{BuildHasher, Hash};

use crossbeam_epoch::{Guard, Shared};

use super::{
    item::{ItemKey, TransItem},
    VersionPolicy,
};
use crate::{
    cht::table::CuckooTable,
    common::version::{self, VERSION_INCREMENT},
};

/// Spins allowed for one commit-time lock before the transaction gives up.
const LOCK_SPINS: u32 = 64;

/// What a data structure must provide to take part in an optimistic commit.
///
/// A commit locks every item that has a write, validates every item that has
/// a read, installs the writes, and unlocks. `cleanup` runs once per item
/// after the outcome is known, and is where physical removals happen.
pub(crate) trait TransactionalObject {
    type Item;

    /// Locks the item for installation. Must not block indefinitely.
    fn lock(&self, item: &mut Self::Item, ctx: &CommitContext<'_>) -> bool;

    /// Returns `true` if what the item observed is still current.
    fn check(&self, item: &Self::Item, ctx: &CommitContext<'_>) -> bool;

    /// Makes the item's write visible. The item is locked.
    fn install(&self, item: &Self::Item, ctx: &CommitContext<'_>);

    /// Releases the lock taken by `lock`, if any.
    fn unlock(&self, item: &mut Self::Item);

    fn cleanup(&self, item: &Self::Item, committed: bool, ctx: &CommitContext<'_>);
}

/// Per-commit state handed to a [`TransactionalObject`].
pub(crate) struct CommitContext<'c> {
    guard: &'c Guard,
    tid: u64,
    counter_id: usize,
}

impl<'c> CommitContext<'c> {
    pub(crate) fn new(guard: &'c Guard, counter_id: usize) -> Self {
        Self {
            guard,
            tid: 0,
            counter_id,
        }
    }

    pub(crate) fn set_tid(&mut self, tid: u64) {
        self.tid = tid;
    }

    /// The commit timestamp. Zero until every write is locked.
    pub(crate) fn tid(&self) -> u64 {
        self.tid
    }
}

impl VersionPolicy {
    /// The version an installed entry gets. Never equal to any version the
    /// entry had before.
    pub(crate) fn next_version(self, current: u64, tid: u64) -> u64 {
        let bumped = version::counter(current) + VERSION_INCREMENT;
        match self {
            Self::Opaque => bumped.max(version::counter(tid)),
            Self::NonOpaque => bumped,
        }
    }
}

impl<K, V, S> TransactionalObject for CuckooTable<K, V, S>
where
    K: Hash + Eq,
    V: Clone,
    S: BuildHasher,
{
    type Item = TransItem<K, V>;

    fn lock(&self, item: &mut TransItem<K, V>, _ctx: &CommitContext<'_>) -> bool {
        // SAFETY: items only live inside a transaction, which keeps the
        // epoch they were created in pinned.
        let lock = unsafe { item.version_lock() };
        if !lock.try_lock_for(LOCK_SPINS) {
            return false;
        }
        item.locked = true;
        match unsafe { item.entry() } {
            // Erased by a plain operation since we saw it.
            Some(entry) => !entry.is_unlinked(),
            None => true,
        }
    }

    fn check(&self, item: &TransItem<K, V>, _ctx: &CommitContext<'_>) -> bool {
        let Some(read_version) = item.read_version else {
            return true;
        };
        let current = unsafe { item.version_lock() }.version();
        if !version::same_ignoring_lock(current, read_version) {
            return false;
        }
        if version::is_locked(current) && !item.locked {
            return false;
        }
        match unsafe { item.entry() } {
            Some(entry) => !entry.is_unlinked(),
            None => true,
        }
    }

    fn install(&self, item: &TransItem<K, V>, ctx: &CommitContext<'_>) {
        debug_assert!(item.locked);
        let entry = match &item.key {
            ItemKey::Bucket(_) => {
                unsafe { item.version_lock() }.bump();
                return;
            }
            ItemKey::Key(_) => match unsafe { item.entry() } {
                Some(entry) => entry,
                None => return,
            },
        };

        let current = entry.version.version();
        let next = self.version_policy().next_version(current, ctx.tid());
        if item.is_delete() {
            entry.version.set_version_locked(version::with_phantom(next));
        } else if item.is_insert() {
            entry.version.set_version_locked(next);
        } else if item.is_delete_then_insert() {
            if let Some(value) = &item.write {
                entry.replace_value(value.clone(), ctx.guard);
            }
            entry.version.set_version_locked(next);
        }
    }

    fn unlock(&self, item: &mut TransItem<K, V>) {
        if item.locked {
            unsafe { item.version_lock() }.release();
            item.locked = false;
        }
    }

    fn cleanup(&self, item: &TransItem<K, V>, committed: bool, ctx: &CommitContext<'_>) {
        let ItemKey::Key(key) = &item.key else {
            return;
        };
        // A committed delete leaves a phantom behind, and so does an aborted
        // insert. Either way the entry goes now.
        let erase = (committed && item.is_delete()) || (!committed && item.is_insert());
        if !erase {
            return;
        }
        if let Some(entry) = unsafe { item.entry() } {
            let expected = Shared::from(item.entry);
            self.remove(key, entry.hash, Some(expected), ctx.counter_id, ctx.guard);
        }
    }
}
