//! Breadth-first search for a cuckoo path, and the relocation along it.
//!
//! When both candidate buckets `i1` and `i2` of a new key are full, some key
//! in them has to move to its own alternate bucket, which may in turn require
//! moving a key out of that bucket, and so on. The search explores these
//! chains breadth first without taking any lock, bounded in depth by
//! `max_bfs_depth` and in total work by `max_cuckoo_count`. A chain is encoded
//! as a mixed-radix "pathcode": one digit (slot index, base `slot_per_bucket`)
//! per hop, with the leading digit telling whether it starts at `i1` or `i2`.
//!
//! Since the search holds no lock, the path it returns may be stale by the
//! time keys are moved. The move walks the path from its empty tail back to
//! its head and validates every hop under the locks of the buckets involved.

use std::collections::VecDeque;

use crossbeam_epoch::{Guard, Shared};
use smallvec::SmallVec;

use super::{bucket::Entry, generation::Generation};
use crate::common::error::Status;

// Searches bounded by a whole generation grow their queue on demand.
const INITIAL_QUEUE_CAPACITY: usize = 512;

#[derive(Clone, Copy, Debug)]
struct BSlot {
    // The bucket of the last hop.
    bucket: usize,
    pathcode: u64,
    depth: usize,
}

impl BSlot {
    fn new(bucket: usize, pathcode: u64, depth: usize) -> Self {
        Self {
            bucket,
            pathcode,
            depth,
        }
    }
}

struct CuckooRecord<'g, K, V> {
    bucket: usize,
    slot: usize,
    hash: u64,
    // Null for the empty slot at the tail of the path.
    entry: Shared<'g, Entry<K, V>>,
}

type CuckooPath<'g, K, V> = SmallVec<[CuckooRecord<'g, K, V>; 8]>;

pub(crate) struct CuckooPathFinder<'a, 'g, K, V> {
    generation: &'a Generation<K, V>,
    guard: &'g Guard,
    max_bfs_depth: usize,
    max_cuckoo_count: usize,
}

impl<'a, 'g, K, V> CuckooPathFinder<'a, 'g, K, V> {
    pub(crate) fn new(
        generation: &'a Generation<K, V>,
        guard: &'g Guard,
        max_bfs_depth: usize,
        max_cuckoo_count: usize,
    ) -> Self {
        Self {
            generation,
            guard,
            max_bfs_depth,
            max_cuckoo_count,
        }
    }

    /// Frees a slot in `i1` or `i2` by relocating keys.
    ///
    /// Must be called with both buckets unlocked. On success it returns the
    /// freed `(bucket, slot)` with `i1` and `i2` locked. On failure every
    /// bucket is unlocked, and the error is `TooSlow` if the path went stale,
    /// `TableFull` if no short enough path exists, or `KeyMoved` if the
    /// generation has been frozen by a resize.
    pub(crate) fn run(&self, i1: usize, i2: usize) -> Result<(usize, usize), Status> {
        if self.generation.is_frozen() {
            return Err(Status::KeyMoved);
        }
        let path = self.search(i1, i2)?;
        self.move_along(&path, i1, i2)?;
        Ok((path[0].bucket, path[0].slot))
    }

    /// Finds a path and replays it against the current table contents.
    fn search(&self, i1: usize, i2: usize) -> Result<CuckooPath<'g, K, V>, Status> {
        let found = self.slot_search(i1, i2)?;
        let spb = self.generation.slot_per_bucket() as u64;

        // Decode the slot digits from the last hop to the first.
        let mut slots: SmallVec<[usize; 8]> = smallvec::smallvec![0; found.depth + 1];
        let mut pathcode = found.pathcode;
        for slot in slots.iter_mut().rev() {
            *slot = (pathcode % spb) as usize;
            pathcode /= spb;
        }
        debug_assert!(pathcode <= 1);

        // Recover the buckets from the first hop onwards, using the keys that
        // are there now. An empty slot found on the way ends the path early.
        let mut path = CuckooPath::new();
        let mut bucket = if pathcode == 0 { i1 } else { i2 };
        for &slot in &slots {
            let b = self.generation.bucket(bucket);
            let entry = b.entry(slot, self.guard);
            if !b.is_occupied(slot) || entry.is_null() {
                path.push(CuckooRecord {
                    bucket,
                    slot,
                    hash: 0,
                    entry: Shared::null(),
                });
                return Ok(path);
            }
            // SAFETY: non-null and protected by the guard.
            let hash = unsafe { entry.deref() }.hash;
            path.push(CuckooRecord {
                bucket,
                slot,
                hash,
                entry,
            });
            bucket = self.generation.alt_index(hash, bucket);
        }
        // The slot at the tail was filled since the search. The move will
        // notice and report `TooSlow`.
        Ok(path)
    }

    /// The breadth-first search proper. Returns the b-slot whose pathcode
    /// ends at an empty slot.
    fn slot_search(&self, i1: usize, i2: usize) -> Result<BSlot, Status> {
        let gen = self.generation;
        let spb = gen.slot_per_bucket();
        let mut queue = VecDeque::with_capacity(self.max_cuckoo_count.min(INITIAL_QUEUE_CAPACITY));
        // The initial pathcode tells which bucket the path starts at.
        queue.push_back(BSlot::new(i1, 0, 0));
        queue.push_back(BSlot::new(i2, 1, 0));

        while queue.len() < self.max_cuckoo_count {
            let x = match queue.pop_front() {
                Some(x) => x,
                None => break,
            };
            let bucket = gen.bucket(x.bucket);
            for slot in 0..spb {
                if queue.len() >= self.max_cuckoo_count {
                    break;
                }
                let pathcode = x.pathcode * spb as u64 + slot as u64;
                let entry = bucket.entry(slot, self.guard);
                if !bucket.is_occupied(slot) || entry.is_null() {
                    return Ok(BSlot::new(x.bucket, pathcode, x.depth));
                }

                // SAFETY: non-null and protected by the guard.
                let hash = unsafe { entry.deref() }.hash;
                let y = BSlot::new(gen.alt_index(hash, x.bucket), pathcode, x.depth + 1);
                if let Some(free) = gen.bucket(y.bucket).first_empty_slot() {
                    return Ok(BSlot::new(
                        y.bucket,
                        y.pathcode * spb as u64 + free as u64,
                        y.depth,
                    ));
                }
                if y.depth < self.max_bfs_depth {
                    queue.push_back(y);
                }
            }
        }
        Err(Status::TableFull)
    }

    /// Moves keys from the tail of `path` towards its head, so that the slot
    /// of the first record becomes empty.
    fn move_along(&self, path: &[CuckooRecord<'g, K, V>], i1: usize, i2: usize) -> Result<(), Status> {
        let gen = self.generation;

        if path.len() == 1 {
            // The search found an empty slot right in `i1` or `i2`.
            let head = &path[0];
            debug_assert!(head.bucket == i1 || head.bucket == i2);
            gen.lock_two(i1, i2);
            if gen.is_frozen() {
                gen.unlock_two(i1, i2);
                return Err(Status::KeyMoved);
            }
            if gen.bucket(head.bucket).is_occupied(head.slot) {
                gen.unlock_two(i1, i2);
                return Err(Status::TooSlow);
            }
            return Ok(());
        }

        for depth in (1..path.len()).rev() {
            let from = &path[depth - 1];
            let to = &path[depth];
            let (fb, fs, tb, ts) = (from.bucket, from.slot, to.bucket, to.slot);

            // The last hop also locks the other one of `i1` and `i2`, as both
            // have to be held when we return.
            let other = (depth == 1).then(|| if fb == i1 { i2 } else { i1 });
            let unlock = || match other {
                Some(ob) => gen.unlock_three(fb, tb, ob),
                None => gen.unlock_two(fb, tb),
            };
            match other {
                Some(ob) => gen.lock_three(fb, tb, ob),
                None => gen.lock_two(fb, tb),
            }

            if gen.is_frozen() {
                unlock();
                return Err(Status::KeyMoved);
            }

            let from_bucket = gen.bucket(fb);
            let to_bucket = gen.bucket(tb);
            if !from_bucket.is_occupied(fs)
                || from_bucket.entry(fs, self.guard) != from.entry
                || to_bucket.is_occupied(ts)
            {
                unlock();
                return Err(Status::TooSlow);
            }

            if fb != tb {
                let primary = gen.index_hash(from.hash);
                if fb == primary {
                    gen.bucket(primary).inc_overflow();
                } else {
                    debug_assert_eq!(tb, primary);
                    gen.bucket(primary).dec_overflow();
                }
            }

            let entry = from_bucket.erase(fs, self.guard);
            to_bucket.set(ts, entry);

            match other {
                Some(ob) => {
                    if tb != fb && tb != ob {
                        to_bucket.lock.unlock();
                    }
                }
                None => gen.unlock_two(fb, tb),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::CuckooPathFinder;
    use crate::{
        cht::{bucket::Entry, generation::Generation},
        common::error::Status,
    };

    use crossbeam_epoch::{Guard, Owned};

    // Finds hash values whose candidate buckets are exactly `(i1, i2)`.
    fn hashes_for(gen: &Generation<u64, u64>, i1: usize, i2: usize, count: usize) -> Vec<u64> {
        (0_u64..)
            .map(|n| n.wrapping_mul(0x9e37_79b9_7f4a_7c15))
            .filter(|&h| gen.candidates(h) == (i1, i2))
            .take(count)
            .collect()
    }

    fn put(gen: &Generation<u64, u64>, guard: &Guard, bucket: usize, key: u64, hash: u64) {
        let b = gen.bucket(bucket);
        b.lock.lock();
        let slot = b.first_empty_slot().expect("bucket is full");
        b.set(slot, Owned::new(Entry::new(key, hash, key, 0)).into_shared(guard));
        b.lock.unlock();
    }

    #[test]
    fn depth_one_relocation() {
        const SPB: usize = 4;
        let gen = Generation::<u64, u64>::new(4, SPB);
        let guard = &crossbeam_epoch::pin();

        // Fill a key's two candidate buckets with keys that share them.
        let i1 = 3;
        let i2 = gen.alt_index(hashes_for_primary(&gen, i1), i1);
        assert_ne!(i1, i2);
        let hashes = hashes_for(&gen, i1, i2, SPB);
        for (key, &hash) in hashes.iter().enumerate() {
            put(&gen, guard, i1, key as u64, hash);
        }

        // Occupy `i2` with keys whose other bucket has room.
        let movable: Vec<_> = (0_u64..)
            .map(|n| n.wrapping_mul(0xc2b2_ae3d_27d4_eb4f))
            .filter(|&h| {
                let alt = gen.alt_index(h, i2);
                gen.index_hash(h) == i2 && alt != i1 && alt != i2
            })
            .take(SPB)
            .collect();
        for (n, &hash) in movable.iter().enumerate() {
            put(&gen, guard, i2, 100 + n as u64, hash);
        }
        assert_eq!(gen.bucket(i1).first_empty_slot(), None);
        assert_eq!(gen.bucket(i2).first_empty_slot(), None);

        let finder = CuckooPathFinder::new(&gen, guard, 4, 500);
        let (bucket, slot) = finder.run(i1, i2).expect("a path exists");
        assert!(bucket == i1 || bucket == i2);
        assert!(gen.bucket(i1).lock.is_locked());
        assert!(gen.bucket(i2).lock.is_locked());
        assert!(!gen.bucket(bucket).is_occupied(slot));
        gen.unlock_two(i1, i2);

        // Every other bucket is unlocked, and no key was lost.
        let total: usize = (0..gen.bucket_count())
            .map(|i| {
                assert!(!gen.bucket(i).lock.is_locked());
                gen.bucket(i).len()
            })
            .sum();
        assert_eq!(total, 2 * SPB);
    }

    fn hashes_for_primary(gen: &Generation<u64, u64>, i1: usize) -> u64 {
        (0_u64..)
            .map(|n| n.wrapping_mul(0x9e37_79b9_7f4a_7c15))
            .find(|&h| {
                let (a, b) = gen.candidates(h);
                a == i1 && b != i1
            })
            .expect("some hash maps to the bucket")
    }

    #[test]
    fn full_single_bucket_reports_table_full() {
        let gen = Generation::<u64, u64>::new(0, 2);
        let guard = &crossbeam_epoch::pin();
        put(&gen, guard, 0, 1, 10);
        put(&gen, guard, 0, 2, 20);

        let finder = CuckooPathFinder::new(&gen, guard, 4, 500);
        assert_eq!(finder.run(0, 0), Err(Status::TableFull));
        assert!(!gen.bucket(0).lock.is_locked());
    }

    #[test]
    fn frozen_generation_reports_key_moved() {
        let gen = Generation::<u64, u64>::new(2, 2);
        let guard = &crossbeam_epoch::pin();
        gen.freeze();
        let finder = CuckooPathFinder::new(&gen, guard, 4, 500);
        assert_eq!(finder.run(0, 1), Err(Status::KeyMoved));
    }
}
