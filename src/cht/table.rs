use std::{
    borrow::Borrow,
    collections::hash_map::RandomState,
    fmt,
    hash::{BuildHasher, Hash, Hasher},
    ptr,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::Backoff;
use smallvec::{smallvec, SmallVec};

use super::{
    bucket::{defer_destroy_entry, Bucket, Entry},
    cuckoo_path::CuckooPathFinder,
    generation::{Generation, MAX_HASHPOWER},
    reclaim::{Reclaimer, ThreadContext},
};
use crate::{
    builder::{self, Config, TableBuilder},
    common::{
        counter::ShardedCounters,
        error::{InsertError, Status},
        version::{self, VersionedLock, VERSION_INCREMENT},
    },
    txn::{item::BucketRef, Transaction, VersionPolicy},
};

/// The pair of generations a thread operates on, read consistently under
/// the resize seqlock.
pub(crate) enum Snapshot<'g, K, V> {
    Steady(&'g Generation<K, V>),
    Expanding {
        old: &'g Generation<K, V>,
        new: &'g Generation<K, V>,
    },
}

/// Bucket versions recorded by a lookup that did not find its key.
pub(crate) type Observations<K, V> = SmallVec<[(BucketRef<K, V>, u64); 4]>;

pub(crate) enum Lookup<'g, K, V> {
    Found(Shared<'g, Entry<K, V>>),
    Absent(Observations<K, V>),
}

pub(crate) enum InsertOutcome<'g, K, V> {
    /// The entry was placed. Carries the key's primary bucket in the
    /// generation that received it.
    Inserted {
        primary: BucketRef<K, V>,
        entry: Shared<'g, Entry<K, V>>,
    },
    Duplicate(Shared<'g, Entry<K, V>>),
    TableFull,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InsertMode {
    /// A committed insert. Advances the primary bucket's version.
    Plain,
    /// An insert on behalf of a transaction. The primary bucket's version is
    /// advanced when the transaction commits.
    Phantom,
    /// A move into the next generation. The key cannot be there already.
    Migrate,
}

enum Search<'g, K, V> {
    Found(Shared<'g, Entry<K, V>>),
    Absent(SmallVec<[(usize, u64); 2]>),
    Moved,
}

enum Insertion<'g, K, V> {
    Placed,
    Duplicate(Shared<'g, Entry<K, V>>),
}

/// A concurrent, resizable cuckoo hash table.
///
/// Every key has two candidate buckets. Lookups are optimistic: they scan
/// without locking and validate the scan with per-bucket seqlocks. Writers
/// lock at most three buckets, always in ascending index order. When both
/// candidate buckets of a new key are full, a bounded breadth-first search
/// looks for a chain of relocations ending at a free slot, and if there is
/// none the table doubles in size while remaining fully usable.
///
/// Worker threads operate on the table through a [`Handle`][handle], which
/// holds the thread's registration with the table's memory reclaimer.
///
/// [handle]: ./struct.Handle.html
///
/// # Examples
///
/// ```rust
/// use tcuckoo::CuckooTable;
/// use std::{sync::Arc, thread};
///
/// let table = Arc::new(CuckooTable::new(1_000));
///
/// let threads: Vec<_> = (0..4_u64)
///     .map(|i| {
///         let table = Arc::clone(&table);
///         thread::spawn(move || {
///             let handle = table.handle();
///             for key in (i * 100)..((i + 1) * 100) {
///                 assert!(handle.insert(key, key.to_string()));
///             }
///         })
///     })
///     .collect();
/// threads.into_iter().for_each(|t| t.join().unwrap());
///
/// let handle = table.handle();
/// assert_eq!(table.size(), 400);
/// assert_eq!(handle.find(&150), Some("150".to_string()));
/// ```
pub struct CuckooTable<K, V, S = RandomState> {
    current: Atomic<Generation<K, V>>,
    next: Atomic<Generation<K, V>>,
    resize_lock: VersionedLock,
    // The hashpowers of `current` and of the generation receiving new
    // entries. Both change under `resize_lock`.
    hashpower: AtomicU32,
    target_hashpower: AtomicU32,
    reclaimer: Reclaimer,
    build_hasher: S,
    config: Config,
    clock: AtomicU64,
    stats: ShardedCounters,
}

impl<K, V, S> fmt::Debug for CuckooTable<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CuckooTable")
            .field("name", &self.config.name)
            .field("slot_per_bucket", &self.config.slot_per_bucket)
            .field("auto_resize", &self.config.auto_resize)
            .finish_non_exhaustive()
    }
}

impl<K, V> CuckooTable<K, V, RandomState>
where
    K: Hash + Eq,
    V: Clone,
{
    /// Constructs a new `CuckooTable<K, V>` with room for about
    /// `initial_capacity` entries.
    ///
    /// To adjust other settings, use [`TableBuilder`][builder-struct].
    ///
    /// [builder-struct]: ./struct.TableBuilder.html
    pub fn new(initial_capacity: usize) -> Self {
        TableBuilder::new(initial_capacity).build()
    }

    /// Returns a [`TableBuilder`][builder-struct], which can build a
    /// `CuckooTable` with various configuration knobs.
    ///
    /// [builder-struct]: ./struct.TableBuilder.html
    pub fn builder(initial_capacity: usize) -> TableBuilder<K, V> {
        TableBuilder::new(initial_capacity)
    }
}

impl<K, V, S> CuckooTable<K, V, S>
where
    K: Hash + Eq,
    V: Clone,
    S: BuildHasher,
{
    /// Constructs a new `CuckooTable<K, V, S>` that hashes its keys with
    /// `hasher`.
    pub fn with_hasher(initial_capacity: usize, hasher: S) -> Self {
        TableBuilder::new(initial_capacity).build_with_hasher(hasher)
    }

    pub(crate) fn with_config(config: Config, hashpower: u32, build_hasher: S) -> Self {
        let generation = Generation::new(hashpower, config.slot_per_bucket);
        Self {
            current: Atomic::new(generation),
            next: Atomic::null(),
            resize_lock: VersionedLock::default(),
            hashpower: AtomicU32::new(hashpower),
            target_hashpower: AtomicU32::new(hashpower),
            reclaimer: Reclaimer::new(config.num_counters),
            build_hasher,
            stats: ShardedCounters::new(config.num_counters),
            config,
            clock: AtomicU64::new(0),
        }
    }

    /// Registers the calling worker with the table.
    ///
    /// A handle is cheap to use but not free to create; keep one per thread
    /// for as long as the thread works on the table.
    pub fn handle(&self) -> Handle<'_, K, V, S> {
        Handle {
            table: self,
            context: self.reclaimer.register(),
        }
    }

    /// Returns the name of the table, if set by the builder.
    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    /// Returns the number of entries in the table, including entries
    /// inserted or deleted by transactions that have not finished.
    ///
    /// The count is maintained without locking, so it is only exact when no
    /// writer is in flight.
    pub fn size(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns the number of buckets of the current generation. During a
    /// resize this is the generation being migrated from.
    pub fn bucket_count(&self) -> usize {
        1 << self.hashpower()
    }

    /// Returns the base-2 logarithm of [`bucket_count`](#method.bucket_count).
    pub fn hashpower(&self) -> u32 {
        self.hashpower.load(Ordering::Acquire)
    }

    /// Returns the ratio of entries to slots in the generation that receives
    /// new entries.
    pub fn load_factor(&self) -> f64 {
        let buckets = 1_usize << self.target_hashpower.load(Ordering::Acquire);
        self.size() as f64 / (buckets * self.config.slot_per_bucket) as f64
    }

    /// Returns `true` while a resize is migrating entries.
    pub fn is_expanding(&self) -> bool {
        // SAFETY: the pointer is only compared with null.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        !self.next.load(Ordering::Acquire, guard).is_null()
    }

    /// Grows the table to `2^new_hashpower` buckets and migrates every entry
    /// before returning.
    ///
    /// Returns `false` without doing anything if the table already has at
    /// least that many buckets. A resize that is already in progress is
    /// completed first.
    ///
    /// # Panics
    ///
    /// Panics if `new_hashpower` is larger than `usize::BITS - 2`, as the
    /// bucket count would not fit in a `usize`.
    pub fn expand(&self, new_hashpower: u32) -> bool {
        assert!(
            new_hashpower <= MAX_HASHPOWER,
            "hashpower {new_hashpower} is too large"
        );
        let context = self.reclaimer.register();
        let guard = &context.pin();
        loop {
            match self.snapshot(guard) {
                Snapshot::Steady(gen) => {
                    if new_hashpower <= gen.hashpower() {
                        return false;
                    }
                    if self.expand_start(gen, new_hashpower, guard).is_ok() {
                        self.complete_expansion(gen, guard);
                        return true;
                    }
                }
                Snapshot::Expanding { old, .. } => {
                    self.complete_expansion(old, guard);
                }
            }
        }
    }

    /// Grows the table so that it has room for about `n` entries. Returns
    /// `false` if it already has.
    ///
    /// # Panics
    ///
    /// Panics if room for `n` entries needs more than `2^(usize::BITS - 2)`
    /// buckets.
    pub fn reserve(&self, n: usize) -> bool {
        let hashpower = builder::initial_hashpower(n, self.config.slot_per_bucket);
        self.expand(hashpower)
    }

    /// Returns the number of entries ever inserted into the table, counting
    /// uncommitted transactional inserts.
    pub fn num_inserts(&self) -> usize {
        self.stats.inserts()
    }

    /// Returns the number of entries ever erased from the table.
    pub fn num_deletes(&self) -> usize {
        self.stats.deletes()
    }

    /// Returns the number of generations replaced by resizes so far.
    pub fn retired_generations(&self) -> usize {
        self.reclaimer.retired_generations()
    }

    /// Returns the number of retired generations whose memory has been
    /// released. A retired generation is released only once no handle can
    /// still be reading it.
    pub fn freed_generations(&self) -> usize {
        self.reclaimer.freed_generations()
    }

    /// Tries to release retired generations and erased entries now, instead
    /// of waiting for enough table operations to do it in passing.
    pub fn try_reclaim(&self) {
        self.reclaimer.collect();
    }
}

// Operations on behalf of handles and transactions.
impl<K, V, S> CuckooTable<K, V, S>
where
    K: Hash + Eq,
    V: Clone,
    S: BuildHasher,
{
    pub(crate) fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// The version given to new entries.
    pub(crate) fn clock(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    pub(crate) fn next_commit_tid(&self) -> u64 {
        self.clock.fetch_add(VERSION_INCREMENT, Ordering::AcqRel) + VERSION_INCREMENT
    }

    pub(crate) fn version_policy(&self) -> VersionPolicy {
        self.config.version_policy
    }

    pub(crate) fn snapshot<'g>(&self, guard: &'g Guard) -> Snapshot<'g, K, V> {
        let backoff = Backoff::new();
        loop {
            let before = self.resize_lock.version();
            if version::is_locked(before) {
                backoff.snooze();
                continue;
            }
            let current = self.current.load(Ordering::Acquire, guard);
            let next = self.next.load(Ordering::Acquire, guard);
            if !VersionedLock::check_version(before, self.resize_lock.version()) {
                backoff.spin();
                continue;
            }
            // SAFETY: `current` is never null, and neither generation is
            // freed while `guard` is pinned.
            let old = unsafe { current.deref() };
            return match unsafe { next.as_ref() } {
                None => Snapshot::Steady(old),
                Some(new) => Snapshot::Expanding { old, new },
            };
        }
    }

    #[cfg(test)]
    fn current_generation<'g>(&self, guard: &'g Guard) -> &'g Generation<K, V> {
        match self.snapshot(guard) {
            Snapshot::Steady(gen) | Snapshot::Expanding { old: gen, .. } => gen,
        }
    }

    /// Looks `key` up in whichever generations may hold it.
    pub(crate) fn find_entry<'g, Q>(&self, key: &Q, hash: u64, guard: &'g Guard) -> Lookup<'g, K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        loop {
            match self.snapshot(guard) {
                Snapshot::Steady(gen) => match find_one(gen, key, hash, guard) {
                    Search::Found(entry) => return Lookup::Found(entry),
                    Search::Absent(seen) => return Lookup::Absent(observations(gen, seen)),
                    Search::Moved => continue,
                },
                Snapshot::Expanding { old, new } => {
                    let mut observed = Observations::new();
                    match find_one(old, key, hash, guard) {
                        Search::Found(entry) => return Lookup::Found(entry),
                        Search::Absent(seen) => observed.extend(observations(old, seen)),
                        Search::Moved => (),
                    }
                    match find_one(new, key, hash, guard) {
                        Search::Found(entry) => return Lookup::Found(entry),
                        Search::Absent(seen) => {
                            observed.extend(observations(new, seen));
                            return Lookup::Absent(observed);
                        }
                        // An even newer generation exists.
                        Search::Moved => continue,
                    }
                }
            }
        }
    }

    /// Inserts a new entry unless the key is already present.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn insert_entry<'g>(
        &self,
        key: K,
        hash: u64,
        value: V,
        version: u64,
        mode: InsertMode,
        counter_id: usize,
        guard: &'g Guard,
    ) -> InsertOutcome<'g, K, V> {
        debug_assert_ne!(mode, InsertMode::Migrate);
        let entry = Owned::new(Entry::new(key, hash, value, version)).into_shared(guard);
        // SAFETY: `entry` was never published.
        let discard = || drop(unsafe { entry.into_owned() });
        let backoff = Backoff::new();

        loop {
            match self.snapshot(guard) {
                Snapshot::Steady(gen) => match self.insert_one(gen, entry, mode, guard) {
                    Ok(Insertion::Placed) => return self.inserted(gen, entry, hash, counter_id),
                    Ok(Insertion::Duplicate(existing)) => {
                        discard();
                        return InsertOutcome::Duplicate(existing);
                    }
                    Err(Status::TableFull) => {
                        if !self.config.auto_resize {
                            discard();
                            return InsertOutcome::TableFull;
                        }
                        #[cfg(feature = "logging")]
                        log::debug!(
                            "{}table is full (hashpower = {}, size = {}); expanding",
                            log_prefix(self.name()),
                            gen.hashpower(),
                            self.size()
                        );
                        // Losing the race to another grower is fine.
                        let _ = self.expand_start(gen, gen.hashpower() + 1, guard);
                    }
                    Err(status) => debug_assert_eq!(status, Status::KeyMoved),
                },
                Snapshot::Expanding { old, new } => {
                    self.migrate_for(old, new, hash, guard);
                    match self.insert_one(new, entry, mode, guard) {
                        Ok(Insertion::Placed) => return self.inserted(new, entry, hash, counter_id),
                        Ok(Insertion::Duplicate(existing)) => {
                            discard();
                            return InsertOutcome::Duplicate(existing);
                        }
                        Err(Status::TableFull) => {
                            // Finish this resize so that the next one can
                            // start.
                            self.migrate_all(old, new, guard);
                            backoff.snooze();
                        }
                        Err(status) => debug_assert_eq!(status, Status::KeyMoved),
                    }
                }
            }
        }
    }

    fn inserted<'g>(
        &self,
        gen: &Generation<K, V>,
        entry: Shared<'g, Entry<K, V>>,
        hash: u64,
        counter_id: usize,
    ) -> InsertOutcome<'g, K, V> {
        self.stats.record_insert(counter_id);
        InsertOutcome::Inserted {
            primary: BucketRef::new(gen, gen.index_hash(hash)),
            entry,
        }
    }

    /// Erases the entry for `key`. With `expected`, only that particular
    /// entry is erased, whatever its phantom state. Without it, phantom
    /// entries are left alone.
    pub(crate) fn remove<'g, Q>(
        &self,
        key: &Q,
        hash: u64,
        expected: Option<Shared<'g, Entry<K, V>>>,
        counter_id: usize,
        guard: &'g Guard,
    ) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        loop {
            let result = match self.snapshot(guard) {
                Snapshot::Steady(gen) => self.delete_one(gen, key, hash, expected, guard),
                Snapshot::Expanding { old, new } => {
                    self.migrate_for(old, new, hash, guard);
                    self.delete_one(new, key, hash, expected, guard)
                }
            };
            match result {
                Ok(entry) => {
                    self.stats.record_delete(counter_id);
                    // SAFETY: the entry has just been unlinked.
                    unsafe { defer_destroy_entry(guard, entry) };
                    return true;
                }
                Err(Status::KeyNotFound) => return false,
                Err(status) => debug_assert_eq!(status, Status::KeyMoved),
            }
        }
    }

    /// Replaces the value of a live entry.
    pub(crate) fn update<Q>(&self, key: &Q, hash: u64, value: V, guard: &Guard) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        loop {
            let entry = match self.find_entry(key, hash, guard) {
                Lookup::Found(entry) => unsafe { entry.deref() },
                Lookup::Absent(_) => return false,
            };
            entry.version.lock();
            if entry.is_unlinked() {
                // Erased since we found it; the key may be back by now.
                entry.version.release();
                continue;
            }
            if version::is_phantom(entry.version.version()) {
                entry.version.release();
                return false;
            }
            entry.replace_value(value, guard);
            entry.version.unlock();
            return true;
        }
    }

    fn insert_one<'g>(
        &self,
        gen: &'g Generation<K, V>,
        entry: Shared<'g, Entry<K, V>>,
        mode: InsertMode,
        guard: &'g Guard,
    ) -> Result<Insertion<'g, K, V>, Status> {
        // SAFETY: protected by the guard.
        let new_entry = unsafe { entry.deref() };
        let hash = new_entry.hash;
        let (i1, i2) = gen.candidates(hash);
        let (b1, b2) = (gen.bucket(i1), gen.bucket(i2));
        let find_duplicate = |bucket: &'g Bucket<K, V>| {
            if mode == InsertMode::Migrate {
                None
            } else {
                bucket
                    .try_find(&new_entry.key, hash, guard)
                    .map(|(_, existing)| existing)
            }
        };

        loop {
            b1.lock.lock();
            if gen.is_frozen() {
                b1.lock.unlock();
                return Err(Status::KeyMoved);
            }
            if let Some(existing) = find_duplicate(b1) {
                b1.lock.unlock();
                return Ok(Insertion::Duplicate(existing));
            }
            let mut open1 = b1.first_empty_slot();
            if !b1.has_overflow() {
                if let Some(slot) = open1 {
                    self.place(gen, i1, i1, slot, entry, mode);
                    b1.lock.unlock();
                    return Ok(Insertion::Placed);
                }
            }

            // The key may be in `i2`, or `i1` is full. Take `i2` as well,
            // which may require letting go of `i1` to respect the lock order.
            if !b2.lock.try_lock() {
                b1.lock.unlock();
                gen.lock_two(i1, i2);
                if gen.is_frozen() {
                    gen.unlock_two(i1, i2);
                    return Err(Status::KeyMoved);
                }
                if let Some(existing) = find_duplicate(b1) {
                    gen.unlock_two(i1, i2);
                    return Ok(Insertion::Duplicate(existing));
                }
                open1 = b1.first_empty_slot();
            }

            if let Some(existing) = find_duplicate(b2) {
                gen.unlock_two(i1, i2);
                return Ok(Insertion::Duplicate(existing));
            }
            if let Some(slot) = open1 {
                self.place(gen, i1, i1, slot, entry, mode);
                gen.unlock_two(i1, i2);
                return Ok(Insertion::Placed);
            }
            if let Some(slot) = b2.first_empty_slot() {
                self.place(gen, i1, i2, slot, entry, mode);
                gen.unlock_two(i1, i2);
                return Ok(Insertion::Placed);
            }

            gen.unlock_two(i1, i2);
            let (max_bfs_depth, max_cuckoo_count) = self.search_bounds(gen, mode);
            let finder = CuckooPathFinder::new(gen, guard, max_bfs_depth, max_cuckoo_count);
            match finder.run(i1, i2) {
                Ok((bucket, slot)) => {
                    // Both buckets were unlocked during the search, so the
                    // key may have been inserted in the meantime.
                    if let Some(existing) = find_duplicate(b1).or_else(|| find_duplicate(b2)) {
                        gen.unlock_two(i1, i2);
                        return Ok(Insertion::Duplicate(existing));
                    }
                    self.place(gen, i1, bucket, slot, entry, mode);
                    gen.unlock_two(i1, i2);
                    return Ok(Insertion::Placed);
                }
                Err(Status::TooSlow) => continue,
                Err(status) => return Err(status),
            }
        }
    }

    /// Bounds of the cuckoo path search. Migration searches as far as the
    /// destination generation allows.
    fn search_bounds(&self, gen: &Generation<K, V>, mode: InsertMode) -> (usize, usize) {
        let (depth, count) = (self.config.max_bfs_depth, self.config.max_cuckoo_count);
        if mode == InsertMode::Migrate {
            (
                depth.max(builder::deepest_bfs_depth(gen.slot_per_bucket())),
                count.max(gen.capacity()),
            )
        } else {
            (depth, count)
        }
    }

    // Both `primary` and `bucket` must be locked.
    fn place(
        &self,
        gen: &Generation<K, V>,
        primary: usize,
        bucket: usize,
        slot: usize,
        entry: Shared<'_, Entry<K, V>>,
        mode: InsertMode,
    ) {
        gen.bucket(bucket).set(slot, entry);
        if bucket != primary {
            gen.bucket(primary).inc_overflow();
        }
        if mode == InsertMode::Plain {
            gen.bucket(primary).version.bump();
        }
    }

    fn delete_one<'g, Q>(
        &self,
        gen: &'g Generation<K, V>,
        key: &Q,
        hash: u64,
        expected: Option<Shared<'g, Entry<K, V>>>,
        guard: &'g Guard,
    ) -> Result<Shared<'g, Entry<K, V>>, Status>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let (i1, i2) = gen.candidates(hash);
        let (b1, b2) = (gen.bucket(i1), gen.bucket(i2));

        b1.lock.lock();
        if gen.is_frozen() {
            b1.lock.unlock();
            return Err(Status::KeyMoved);
        }
        if let Some((slot, found)) = b1.try_find(key, hash, guard) {
            let result = unlink(b1, slot, found, expected, guard);
            b1.lock.unlock();
            return result;
        }
        if !b1.has_overflow() {
            b1.lock.unlock();
            return Err(Status::KeyNotFound);
        }

        if !b2.lock.try_lock() {
            b1.lock.unlock();
            gen.lock_two(i1, i2);
            if gen.is_frozen() {
                gen.unlock_two(i1, i2);
                return Err(Status::KeyMoved);
            }
            if let Some((slot, found)) = b1.try_find(key, hash, guard) {
                let result = unlink(b1, slot, found, expected, guard);
                gen.unlock_two(i1, i2);
                return result;
            }
        }

        let result = match b2.try_find(key, hash, guard) {
            Some((slot, found)) => {
                let result = unlink(b2, slot, found, expected, guard);
                if result.is_ok() && i1 != i2 {
                    b1.dec_overflow();
                }
                result
            }
            None => Err(Status::KeyNotFound),
        };
        gen.unlock_two(i1, i2);
        result
    }
}

// Live resize.
impl<K, V, S> CuckooTable<K, V, S>
where
    K: Hash + Eq,
    V: Clone,
    S: BuildHasher,
{
    /// Publishes a new, empty generation as `next` and freezes `expected`.
    /// Fails with `UnderExpansion` if `expected` is no longer the current
    /// generation or another resize is in progress.
    fn expand_start(&self, expected: &Generation<K, V>, new_hashpower: u32, guard: &Guard) -> Result<(), Status> {
        let new = Owned::new(Generation::new(new_hashpower, self.config.slot_per_bucket));

        self.resize_lock.lock();
        let current = self.current.load(Ordering::Acquire, guard);
        let next = self.next.load(Ordering::Acquire, guard);
        if !ptr::eq(current.as_raw(), expected) || !next.is_null() {
            self.resize_lock.release();
            #[cfg(feature = "logging")]
            log::trace!(
                "{}another thread has already resized the table",
                log_prefix(self.name())
            );
            return Err(Status::UnderExpansion);
        }
        expected.freeze();
        self.next.store(new, Ordering::Release);
        self.target_hashpower.store(new_hashpower, Ordering::Release);
        self.resize_lock.unlock();

        #[cfg(feature = "logging")]
        log::debug!(
            "{}started expanding from hashpower {} to {}",
            log_prefix(self.name()),
            expected.hashpower(),
            new_hashpower
        );
        Ok(())
    }

    /// Promotes `new` to the current generation and retires `old`. Called
    /// exactly once per resize, by the thread that migrated the last bucket.
    fn expand_end(&self, old: &Generation<K, V>, new: &Generation<K, V>, guard: &Guard) {
        self.resize_lock.lock();
        let current = self.current.load(Ordering::Acquire, guard);
        let next = self.next.load(Ordering::Acquire, guard);
        assert!(
            ptr::eq(current.as_raw(), old) && ptr::eq(next.as_raw(), new),
            "the generations changed during a resize"
        );
        debug_assert!(old.is_empty());
        self.current.store(next, Ordering::Release);
        self.next.store(Shared::null(), Ordering::Release);
        self.hashpower.store(new.hashpower(), Ordering::Release);
        self.resize_lock.unlock();

        // SAFETY: `old` is unreachable from the table now, and only the
        // thread that migrated the last bucket gets here.
        unsafe { self.reclaimer.retire(guard, current) };

        #[cfg(feature = "logging")]
        log::debug!(
            "{}finished expanding to hashpower {}; retired the old generation",
            log_prefix(self.name()),
            new.hashpower()
        );
    }

    /// Migrates the two candidate buckets of `hash`, so that the key can be
    /// looked for and changed in `new` alone, and one more bucket to keep the
    /// resize moving.
    fn migrate_for(&self, old: &Generation<K, V>, new: &Generation<K, V>, hash: u64, guard: &Guard) {
        let (i1, i2) = old.candidates(hash);
        self.migrate_bucket(old, new, i1, guard);
        if i2 != i1 {
            self.migrate_bucket(old, new, i2, guard);
        }
        if let Some(index) = old.claim_migration() {
            self.migrate_bucket(old, new, index, guard);
        }
    }

    fn migrate_all(&self, old: &Generation<K, V>, new: &Generation<K, V>, guard: &Guard) {
        for index in 0..old.bucket_count() {
            self.migrate_bucket(old, new, index, guard);
        }
    }

    /// Migrates everything and waits until `old` is no longer current.
    fn complete_expansion(&self, old: &Generation<K, V>, guard: &Guard) {
        let backoff = Backoff::new();
        loop {
            match self.snapshot(guard) {
                Snapshot::Expanding { old: current, new } if ptr::eq(current, old) => {
                    self.migrate_all(current, new, guard);
                    backoff.snooze();
                }
                _ => return,
            }
        }
    }

    fn migrate_bucket(&self, old: &Generation<K, V>, new: &Generation<K, V>, index: usize, guard: &Guard) {
        let bucket = old.bucket(index);
        if bucket.is_migrated() {
            return;
        }
        bucket.lock.lock();
        if bucket.is_migrated() || new.is_frozen() {
            bucket.lock.unlock();
            return;
        }

        let entries: SmallVec<[_; 32]> = bucket.entries(guard).collect();
        for (slot, entry) in entries {
            // Place first, then erase, so that the key is never absent from
            // both generations.
            match self.insert_one(new, entry, InsertMode::Migrate, guard) {
                Ok(Insertion::Placed) => (),
                Ok(Insertion::Duplicate(_)) => unreachable!("migration does not look for duplicates"),
                Err(Status::TableFull) => {
                    bucket.lock.unlock();
                    self.rebuild(old, new, guard);
                    return;
                }
                // `new` is being rebuilt by another thread.
                Err(_) => {
                    bucket.lock.unlock();
                    return;
                }
            }
            bucket.erase(slot, guard);
        }
        bucket.set_migrated();
        bucket.version.bump();
        bucket.lock.unlock();

        if old.record_migrated() {
            self.expand_end(old, new, guard);
        }
    }

    /// Replaces a resize that cannot place some entry of `old` in `new` with
    /// one generation, at least twice the size of `new`, that holds the
    /// entries of both.
    ///
    /// Every other operation on the table waits until this is done. New
    /// snapshots block on the resize lock, and writers already working on
    /// either generation back off with `KeyMoved` once `new` is frozen.
    fn rebuild(&self, old: &Generation<K, V>, new: &Generation<K, V>, guard: &Guard) {
        self.resize_lock.lock();
        let current = self.current.load(Ordering::Acquire, guard);
        let next = self.next.load(Ordering::Acquire, guard);
        if !ptr::eq(current.as_raw(), old) || !ptr::eq(next.as_raw(), new) {
            self.resize_lock.release();
            return;
        }
        new.freeze();

        // A writer that found a generation unfrozen holds the lock of the
        // bucket it checked under until it is done. Wait for all of them.
        for gen in [old, new] {
            for index in 0..gen.bucket_count() {
                let bucket = gen.bucket(index);
                bucket.lock.lock();
                bucket.lock.release();
            }
        }

        let mut entries = Vec::new();
        for gen in [old, new] {
            for index in 0..gen.bucket_count() {
                entries.extend(gen.bucket(index).entries(guard).map(|(_, entry)| entry));
            }
        }
        let mut hashpower = new.hashpower() + 1;
        let generation = loop {
            let candidate = Generation::new(hashpower, self.config.slot_per_bucket);
            let placed = entries.iter().all(|&entry| {
                matches!(
                    self.insert_one(&candidate, entry, InsertMode::Migrate, guard),
                    Ok(Insertion::Placed)
                )
            });
            if placed {
                break candidate;
            }
            evacuate(&candidate, guard);
            hashpower += 1;
        };

        // `new` first: a reader that misses a key in `old` goes on to `new`.
        evacuate(new, guard);
        evacuate(old, guard);
        self.current.store(Owned::new(generation), Ordering::Release);
        self.next.store(Shared::null(), Ordering::Release);
        self.hashpower.store(hashpower, Ordering::Release);
        self.target_hashpower.store(hashpower, Ordering::Release);
        self.resize_lock.unlock();

        // SAFETY: both generations are unreachable from the table now, and
        // only the thread holding the resize lock could replace them.
        unsafe {
            self.reclaimer.retire(guard, current);
            self.reclaimer.retire(guard, next);
        }

        #[cfg(feature = "logging")]
        log::warn!(
            "{}could not migrate from hashpower {} to {}; rebuilt the table at hashpower {}",
            log_prefix(self.name()),
            old.hashpower(),
            new.hashpower(),
            hashpower
        );
    }
}

impl<K, V, S> Drop for CuckooTable<K, V, S> {
    fn drop(&mut self) {
        // SAFETY: we have exclusive access, and every handle is gone. An
        // entry is reachable from exactly one bucket of one generation.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        for generation in [&self.current, &self.next] {
            let ptr = generation.swap(Shared::null(), Ordering::Relaxed, guard);
            if !ptr.is_null() {
                drop(unsafe { ptr.into_owned() });
            }
        }
    }
}

/// Empties every bucket of `gen` without destroying the entries, and marks
/// the buckets migrated so that readers look elsewhere.
fn evacuate<K, V>(gen: &Generation<K, V>, guard: &Guard) {
    for index in 0..gen.bucket_count() {
        let bucket = gen.bucket(index);
        bucket.lock.lock();
        for slot in 0..bucket.slot_count() {
            if bucket.is_occupied(slot) {
                bucket.erase(slot, guard);
            }
        }
        bucket.set_migrated();
        bucket.version.bump();
        bucket.lock.unlock();
    }
}

/// Searches one generation. The fast path scans the primary bucket alone; the
/// slow path scans both candidate buckets until a double collect validates.
fn find_one<'g, K, V, Q>(gen: &'g Generation<K, V>, key: &Q, hash: u64, guard: &'g Guard) -> Search<'g, K, V>
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
{
    let (i1, i2) = gen.candidates(hash);
    let b1 = gen.bucket(i1);
    let backoff = Backoff::new();

    loop {
        // Read the transactional version first. Anything that makes an
        // absence stale changes it after changing the bucket.
        let observed = b1.version.version();
        let before = b1.lock.version();
        if version::is_locked(before) {
            backoff.snooze();
            continue;
        }
        let migrated = b1.is_migrated();
        let hit = b1.try_find(key, hash, guard);
        let overflow = b1.has_overflow();
        if !VersionedLock::check_version(before, b1.lock.version()) {
            backoff.spin();
            continue;
        }
        if migrated {
            return Search::Moved;
        }
        if let Some((_, entry)) = hit {
            return Search::Found(entry);
        }
        if !overflow || i1 == i2 {
            return Search::Absent(smallvec![(i1, observed)]);
        }
        break;
    }

    let b2 = gen.bucket(i2);
    loop {
        let observed1 = b1.version.version();
        let observed2 = b2.version.version();
        let before1 = b1.lock.version();
        let before2 = b2.lock.version();
        if version::is_locked(before1) || version::is_locked(before2) {
            backoff.snooze();
            continue;
        }
        let migrated = b1.is_migrated() || b2.is_migrated();
        let hit = b1
            .try_find(key, hash, guard)
            .or_else(|| b2.try_find(key, hash, guard));
        if !VersionedLock::check_version(before1, b1.lock.version())
            || !VersionedLock::check_version(before2, b2.lock.version())
        {
            backoff.spin();
            continue;
        }
        if migrated {
            return Search::Moved;
        }
        return match hit {
            Some((_, entry)) => Search::Found(entry),
            None => Search::Absent(smallvec![(i1, observed1), (i2, observed2)]),
        };
    }
}

fn observations<K, V>(gen: &Generation<K, V>, seen: SmallVec<[(usize, u64); 2]>) -> Observations<K, V> {
    seen.into_iter()
        .map(|(index, version)| (BucketRef::new(gen, index), version))
        .collect()
}

/// Unlinks the entry in `slot` of a locked bucket.
fn unlink<'g, K, V>(
    bucket: &Bucket<K, V>,
    slot: usize,
    found: Shared<'g, Entry<K, V>>,
    expected: Option<Shared<'g, Entry<K, V>>>,
    guard: &'g Guard,
) -> Result<Shared<'g, Entry<K, V>>, Status> {
    if matches!(expected, Some(expected) if expected != found) {
        return Err(Status::KeyNotFound);
    }
    // SAFETY: protected by the guard.
    let entry = unsafe { found.deref() };
    entry.version.lock();
    if expected.is_none() && version::is_phantom(entry.version.version()) {
        entry.version.release();
        return Err(Status::KeyNotFound);
    }
    entry.mark_unlinked();
    bucket.erase(slot, guard);
    entry.version.unlock();
    Ok(found)
}

#[cfg(feature = "logging")]
fn log_prefix(table_name: Option<&str>) -> String {
    table_name
        .map(|name| format!("[{name}] "))
        .unwrap_or_default()
}

/// A worker's access point to a [`CuckooTable`][table-struct].
///
/// A handle holds the worker's registration with the table's memory
/// reclaimer and the id of the size-counter shard it writes to. It is not
/// `Send`: create one per thread with [`CuckooTable::handle`][handle-method].
///
/// [table-struct]: ./struct.CuckooTable.html
/// [handle-method]: ./struct.CuckooTable.html#method.handle
pub struct Handle<'t, K, V, S = RandomState> {
    table: &'t CuckooTable<K, V, S>,
    context: ThreadContext,
}

impl<'t, K, V, S> Handle<'t, K, V, S>
where
    K: Hash + Eq,
    V: Clone,
    S: BuildHasher,
{
    /// Returns a clone of the value corresponding to the key.
    ///
    /// Entries inserted by transactions that have not committed yet are not
    /// visible.
    pub fn find<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = &self.context.pin();
        let hash = self.table.hash(key);
        match self.table.find_entry(key, hash, guard) {
            Lookup::Found(entry) => {
                // SAFETY: protected by the guard.
                let entry = unsafe { entry.deref() };
                if version::is_phantom(entry.version.version()) {
                    None
                } else {
                    Some(entry.value(guard).clone())
                }
            }
            Lookup::Absent(_) => None,
        }
    }

    /// Returns `true` if the table contains a value for the key.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key).is_some()
    }

    /// Inserts a key-value pair. Returns `false` if the key was already
    /// present or the table is full and cannot grow.
    pub fn insert(&self, key: K, value: V) -> bool {
        self.try_insert(key, value).is_ok()
    }

    /// Inserts a key-value pair, or tells why it could not.
    pub fn try_insert(&self, key: K, value: V) -> Result<(), InsertError> {
        let guard = &self.context.pin();
        let hash = self.table.hash(&key);
        let version = self.table.clock();
        match self.table.insert_entry(
            key,
            hash,
            value,
            version,
            InsertMode::Plain,
            self.context.counter_id(),
            guard,
        ) {
            InsertOutcome::Inserted { .. } => Ok(()),
            InsertOutcome::Duplicate(_) => Err(InsertError::KeyDuplicated),
            InsertOutcome::TableFull => Err(InsertError::TableFull),
        }
    }

    /// Erases the key. Returns `false` if it was not present.
    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = &self.context.pin();
        let hash = self.table.hash(key);
        self.table
            .remove(key, hash, None, self.context.counter_id(), guard)
    }

    /// Replaces the value of an existing key. Returns `false` if it was not
    /// present.
    pub fn update<Q>(&self, key: &Q, value: V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = &self.context.pin();
        let hash = self.table.hash(key);
        self.table.update(key, hash, value, guard)
    }

    /// Starts a transaction. See [`Transaction`][txn-struct].
    ///
    /// [txn-struct]: ./txn/struct.Transaction.html
    pub fn transaction(&self) -> Transaction<'_, K, V, S>
    where
        K: Clone,
    {
        Transaction::new(self.table, &self.context)
    }

    /// Returns the table this handle operates on.
    pub fn table(&self) -> &'t CuckooTable<K, V, S> {
        self.table
    }
}
