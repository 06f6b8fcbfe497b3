use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::bucket::Bucket;

const MIX_CONSTANT: u64 = 0x5bd1e995;

/// The largest hashpower a generation can have. Bucket indices and the
/// bucket count must fit in a `usize`.
pub(crate) const MAX_HASHPOWER: u32 = usize::BITS - 2;

/// One complete array of `2^hashpower` buckets.
///
/// A generation is replaced wholesale by a live resize. While a resize is in
/// progress the old generation is `frozen`: only migration may still modify
/// it, and every other writer that locks one of its buckets backs off with
/// `KeyMoved`.
pub(crate) struct Generation<K, V> {
    hashpower: u32,
    buckets: Box<[Bucket<K, V>]>,
    frozen: AtomicBool,
    migrate_cursor: AtomicUsize,
    migrated_buckets: AtomicUsize,
}

impl<K, V> Generation<K, V> {
    pub(crate) fn new(hashpower: u32, slot_per_bucket: usize) -> Self {
        assert!(
            hashpower <= MAX_HASHPOWER,
            "hashpower {hashpower} is too large"
        );
        let buckets = (0..hashsize(hashpower))
            .map(|_| Bucket::new(slot_per_bucket))
            .collect();
        Self {
            hashpower,
            buckets,
            frozen: AtomicBool::new(false),
            migrate_cursor: AtomicUsize::new(0),
            migrated_buckets: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn hashpower(&self) -> u32 {
        self.hashpower
    }

    #[inline]
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub(crate) fn slot_per_bucket(&self) -> usize {
        self.buckets[0].slot_count()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.bucket_count() * self.slot_per_bucket()
    }

    #[inline]
    pub(crate) fn bucket(&self, index: usize) -> &Bucket<K, V> {
        &self.buckets[index]
    }

    /// The primary candidate bucket of a hash value.
    #[inline]
    pub(crate) fn index_hash(&self, hash: u64) -> usize {
        (hash & hashmask(self.hashpower)) as usize
    }

    /// The other candidate bucket of a hash value, given one of them.
    /// Applying it twice yields the original index.
    #[inline]
    pub(crate) fn alt_index(&self, hash: u64, index: usize) -> usize {
        // Never zero.
        let tag = (hash >> self.hashpower).wrapping_add(1);
        ((index as u64 ^ tag.wrapping_mul(MIX_CONSTANT)) & hashmask(self.hashpower)) as usize
    }

    /// Both candidate buckets `(i1, i2)` of a hash value.
    #[inline]
    pub(crate) fn candidates(&self, hash: u64) -> (usize, usize) {
        let i1 = self.index_hash(hash);
        (i1, self.alt_index(hash, i1))
    }

    // Bucket locks are always taken in ascending index order, with duplicate
    // indices collapsed. Unlock order does not matter.

    pub(crate) fn lock_two(&self, a: usize, b: usize) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        self.buckets[lo].lock.lock();
        if hi != lo {
            self.buckets[hi].lock.lock();
        }
    }

    pub(crate) fn unlock_two(&self, a: usize, b: usize) {
        self.buckets[a].lock.unlock();
        if b != a {
            self.buckets[b].lock.unlock();
        }
    }

    pub(crate) fn lock_three(&self, a: usize, b: usize, c: usize) {
        let mut indices = [a, b, c];
        indices.sort_unstable();
        self.buckets[indices[0]].lock.lock();
        if indices[1] != indices[0] {
            self.buckets[indices[1]].lock.lock();
        }
        if indices[2] != indices[1] {
            self.buckets[indices[2]].lock.lock();
        }
    }

    pub(crate) fn unlock_three(&self, a: usize, b: usize, c: usize) {
        let mut indices = [a, b, c];
        indices.sort_unstable();
        self.buckets[indices[0]].lock.unlock();
        if indices[1] != indices[0] {
            self.buckets[indices[1]].lock.unlock();
        }
        if indices[2] != indices[1] {
            self.buckets[indices[2]].lock.unlock();
        }
    }

    pub(crate) fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub(crate) fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Hands out the next bucket index that nobody has claimed for migration
    /// yet.
    pub(crate) fn claim_migration(&self) -> Option<usize> {
        if self.migrate_cursor.load(Ordering::Relaxed) >= self.bucket_count() {
            return None;
        }
        let index = self.migrate_cursor.fetch_add(1, Ordering::Relaxed);
        (index < self.bucket_count()).then_some(index)
    }

    /// Records that one more bucket has been migrated. Returns `true` to the
    /// single caller whose bucket was the last one.
    pub(crate) fn record_migrated(&self) -> bool {
        let migrated = self.migrated_buckets.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(migrated <= self.bucket_count());
        migrated == self.bucket_count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.len() == 0)
    }
}

#[inline]
fn hashsize(hashpower: u32) -> usize {
    1 << hashpower
}

#[inline]
fn hashmask(hashpower: u32) -> u64 {
    (1 << hashpower) - 1
}

#[cfg(test)]
mod tests {
    use super::Generation;

    #[test]
    fn alt_index_is_an_involution() {
        let mut state = 0x2545_f491_4f6c_dd1d_u64;
        for hashpower in [0, 1, 2, 5, 10, 16] {
            let gen = Generation::<u64, u64>::new(hashpower, 4);
            for _ in 0..1_000 {
                // xorshift64
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let hash = state;

                let i1 = gen.index_hash(hash);
                let i2 = gen.alt_index(hash, i1);
                assert!(i1 < gen.bucket_count());
                assert!(i2 < gen.bucket_count());
                assert_eq!(gen.alt_index(hash, i2), i1);
            }
        }
    }

    #[test]
    fn migration_cursor_and_count() {
        let gen = Generation::<u64, u64>::new(2, 4);
        let claimed: Vec<_> = std::iter::from_fn(|| gen.claim_migration()).collect();
        assert_eq!(claimed, vec![0, 1, 2, 3]);
        assert_eq!(gen.claim_migration(), None);

        assert!(!gen.record_migrated());
        assert!(!gen.record_migrated());
        assert!(!gen.record_migrated());
        assert!(gen.record_migrated());
    }

    #[test]
    fn lock_helpers_collapse_duplicates() {
        let gen = Generation::<u64, u64>::new(3, 4);
        gen.lock_three(5, 2, 5);
        assert!(gen.bucket(2).lock.is_locked());
        assert!(gen.bucket(5).lock.is_locked());
        gen.unlock_three(5, 5, 2);
        assert!(!gen.bucket(2).lock.is_locked());
        assert!(!gen.bucket(5).lock.is_locked());

        gen.lock_two(7, 7);
        gen.unlock_two(7, 7);
        assert!(!gen.bucket(7).lock.is_locked());
    }
}
