use std::{
    borrow::Borrow,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::common::version::VersionedLock;

/// The largest supported number of slots in a bucket. Occupancy is tracked
/// in one `u64` bitmap.
pub(crate) const MAX_SLOT_PER_BUCKET: usize = u64::BITS as usize;

/// A key-value pair stored in the table.
///
/// Buckets hold pointers to entries. Relocating a key, whether along a cuckoo
/// path or into the next generation, moves the pointer and never the entry,
/// so `version` follows the key wherever it goes.
pub(crate) struct Entry<K, V> {
    pub(crate) key: K,
    pub(crate) hash: u64,
    value: Atomic<V>,
    pub(crate) version: VersionedLock,
    unlinked: AtomicBool,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn new(key: K, hash: u64, value: V, version: u64) -> Self {
        Self {
            key,
            hash,
            value: Atomic::new(value),
            version: VersionedLock::new(version),
            unlinked: AtomicBool::new(false),
        }
    }

    /// True once the entry has been erased from the table. Set while holding
    /// `version`'s lock, so a holder of that lock sees a stable answer.
    #[inline]
    pub(crate) fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unlinked(&self) {
        debug_assert!(self.version.is_locked());
        self.unlinked.store(true, Ordering::Release);
    }

    pub(crate) fn value<'g>(&'g self, guard: &'g Guard) -> &'g V {
        let ptr = self.value.load(Ordering::Acquire, guard);
        // SAFETY: the value pointer is never null, and a replaced value is
        // only destroyed after every guard that could have loaded it is gone.
        unsafe { ptr.deref() }
    }

    /// Replaces the value. The previous one is destroyed once no pinned
    /// reader can still observe it.
    pub(crate) fn replace_value(&self, value: V, guard: &Guard) {
        let old = self.value.swap(Owned::new(value), Ordering::AcqRel, guard);
        // SAFETY: `old` is unlinked now, and destruction is deferred until
        // all current pins are released.
        unsafe { guard.defer_destroy(old) };
    }
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        // SAFETY: we have exclusive access to the entry.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let ptr = self.value.load(Ordering::Relaxed, guard);
        if !ptr.is_null() {
            // SAFETY: the value is owned by this entry.
            drop(unsafe { ptr.into_owned() });
        }
    }
}

/// A fixed-capacity array of entry slots with an occupancy bitmap.
///
/// Mutators require `lock` to be held. Readers scan without locking and
/// validate the scan with `lock`'s version.
pub(crate) struct Bucket<K, V> {
    /// Physical seqlock protecting the slots, bitmap and overflow count.
    pub(crate) lock: VersionedLock,
    /// Version observed by transactions that saw a key absent from this
    /// bucket. It advances whenever a key whose primary bucket is this one is
    /// inserted, and when the bucket is migrated.
    pub(crate) version: VersionedLock,
    occupied: AtomicU64,
    overflow: AtomicU32,
    migrated: AtomicBool,
    slots: Box<[Atomic<Entry<K, V>>]>,
}

impl<K, V> Bucket<K, V> {
    pub(crate) fn new(slot_per_bucket: usize) -> Self {
        assert!(slot_per_bucket > 0 && slot_per_bucket <= MAX_SLOT_PER_BUCKET);
        Self {
            lock: VersionedLock::default(),
            version: VersionedLock::default(),
            occupied: AtomicU64::new(0),
            overflow: AtomicU32::new(0),
            migrated: AtomicBool::new(false),
            slots: (0..slot_per_bucket).map(|_| Atomic::null()).collect(),
        }
    }

    #[inline]
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn is_occupied(&self, slot: usize) -> bool {
        self.occupied.load(Ordering::Acquire) & (1 << slot) != 0
    }

    pub(crate) fn len(&self) -> usize {
        self.occupied.load(Ordering::Acquire).count_ones() as usize
    }

    pub(crate) fn first_empty_slot(&self) -> Option<usize> {
        let free = !self.occupied.load(Ordering::Acquire) & self.full_mask();
        (free != 0).then(|| free.trailing_zeros() as usize)
    }

    /// Loads the entry in `slot`. Null if the slot is empty, or if a writer
    /// is in the middle of changing it.
    #[inline]
    pub(crate) fn entry<'g>(&self, slot: usize, guard: &'g Guard) -> Shared<'g, Entry<K, V>> {
        self.slots[slot].load(Ordering::Acquire, guard)
    }

    /// Scans the occupied slots for `key` without locking.
    pub(crate) fn try_find<'g, Q>(
        &'g self,
        key: &Q,
        hash: u64,
        guard: &'g Guard,
    ) -> Option<(usize, Shared<'g, Entry<K, V>>)>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.entries(guard).find(|(_, ptr)| {
            // SAFETY: `entries` yields non-null pointers only.
            let entry = unsafe { ptr.deref() };
            entry.hash == hash && entry.key.borrow() == key
        })
    }

    /// Iterates over `(slot, entry)` for every occupied, non-null slot.
    pub(crate) fn entries<'g>(
        &'g self,
        guard: &'g Guard,
    ) -> impl Iterator<Item = (usize, Shared<'g, Entry<K, V>>)> + 'g {
        let mut bits = self.occupied.load(Ordering::Acquire);
        std::iter::from_fn(move || {
            while bits != 0 {
                let slot = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                let ptr = self.entry(slot, guard);
                if !ptr.is_null() {
                    return Some((slot, ptr));
                }
            }
            None
        })
    }

    /// Stores `entry` in the empty `slot`. The bucket must be locked.
    pub(crate) fn set(&self, slot: usize, entry: Shared<'_, Entry<K, V>>) {
        debug_assert!(self.lock.is_locked());
        debug_assert!(!self.is_occupied(slot));
        debug_assert!(!entry.is_null());
        self.slots[slot].store(entry, Ordering::Release);
        self.occupied.fetch_or(1 << slot, Ordering::Release);
    }

    /// Empties `slot` and returns the entry it held. The entry is not
    /// destroyed; the caller decides whether it moves elsewhere or is
    /// retired. The bucket must be locked.
    pub(crate) fn erase<'g>(&self, slot: usize, guard: &'g Guard) -> Shared<'g, Entry<K, V>> {
        debug_assert!(self.lock.is_locked());
        debug_assert!(self.is_occupied(slot));
        self.occupied.fetch_and(!(1 << slot), Ordering::Release);
        self.slots[slot].swap(Shared::null(), Ordering::AcqRel, guard)
    }

    #[inline]
    pub(crate) fn overflow(&self) -> u32 {
        self.overflow.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn has_overflow(&self) -> bool {
        self.overflow() > 0
    }

    /// Counts one more key whose primary bucket is this one but which lives
    /// in its alternate bucket.
    pub(crate) fn inc_overflow(&self) {
        debug_assert!(self.lock.is_locked());
        self.overflow.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn dec_overflow(&self) {
        debug_assert!(self.lock.is_locked());
        let prev = self.overflow.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "overflow underflow");
    }

    #[inline]
    pub(crate) fn is_migrated(&self) -> bool {
        self.migrated.load(Ordering::Acquire)
    }

    pub(crate) fn set_migrated(&self) {
        debug_assert!(self.lock.is_locked());
        self.migrated.store(true, Ordering::Release);
    }

    #[inline]
    fn full_mask(&self) -> u64 {
        if self.slots.len() == MAX_SLOT_PER_BUCKET {
            u64::MAX
        } else {
            (1 << self.slots.len()) - 1
        }
    }
}

impl<K, V> Drop for Bucket<K, V> {
    fn drop(&mut self) {
        // SAFETY: the bucket is being dropped, so nobody else can access it.
        // Every occupied slot owns its entry.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let bits = *self.occupied.get_mut();
        for (slot, ptr) in self.slots.iter().enumerate() {
            if bits & (1 << slot) == 0 {
                continue;
            }
            let entry = ptr.load(Ordering::Relaxed, guard);
            if !entry.is_null() {
                drop(unsafe { entry.into_owned() });
            }
        }
    }
}

/// Destroys an entry that has been unlinked from every bucket, once no
/// pinned thread can still be reading it.
///
/// # Safety
///
/// `entry` must not be reachable from any bucket.
pub(crate) unsafe fn defer_destroy_entry<K, V>(guard: &Guard, entry: Shared<'_, Entry<K, V>>) {
    assert!(!entry.is_null());
    guard.defer_destroy(entry);
}

#[cfg(test)]
mod tests {
    use super::{defer_destroy_entry, Bucket, Entry};

    use crossbeam_epoch::Owned;

    #[test]
    fn set_find_erase() {
        let bucket = Bucket::<&str, i32>::new(4);
        let guard = &crossbeam_epoch::pin();

        assert_eq!(bucket.first_empty_slot(), Some(0));
        assert!(bucket.try_find("foo", 1, guard).is_none());

        bucket.lock.lock();
        let foo = Owned::new(Entry::new("foo", 1, 10, 0)).into_shared(guard);
        let bar = Owned::new(Entry::new("bar", 2, 20, 0)).into_shared(guard);
        bucket.set(0, foo);
        bucket.set(2, bar);
        bucket.lock.unlock();

        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.first_empty_slot(), Some(1));

        let (slot, found) = bucket.try_find("bar", 2, guard).expect("bar is present");
        assert_eq!(slot, 2);
        assert_eq!(*unsafe { found.deref() }.value(guard), 20);

        // Same key, different hash: must not match.
        assert!(bucket.try_find("bar", 3, guard).is_none());

        bucket.lock.lock();
        let erased = bucket.erase(0, guard);
        bucket.lock.unlock();
        assert_eq!(erased, foo);
        assert!(!bucket.is_occupied(0));
        assert!(bucket.try_find("foo", 1, guard).is_none());
        unsafe { defer_destroy_entry(guard, erased) };
    }

    #[test]
    fn full_bucket_has_no_empty_slot() {
        let bucket = Bucket::<u64, u64>::new(64);
        let guard = &crossbeam_epoch::pin();
        bucket.lock.lock();
        for slot in 0..64 {
            let entry = Owned::new(Entry::new(slot as u64, 0, 0, 0)).into_shared(guard);
            bucket.set(slot, entry);
        }
        bucket.lock.unlock();
        assert_eq!(bucket.first_empty_slot(), None);
        assert_eq!(bucket.len(), 64);
    }

    #[test]
    fn overflow_and_migrated_flags() {
        let bucket = Bucket::<u64, u64>::new(2);
        bucket.lock.lock();
        bucket.inc_overflow();
        bucket.inc_overflow();
        bucket.dec_overflow();
        assert!(bucket.has_overflow());
        bucket.set_migrated();
        bucket.lock.unlock();
        assert!(bucket.is_migrated());
        assert_eq!(bucket.overflow(), 1);
    }
}
