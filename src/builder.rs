use crate::{cht::table::CuckooTable, common, txn::VersionPolicy};

use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    marker::PhantomData,
};

pub(crate) const DEFAULT_SLOT_PER_BUCKET: usize = 20;
pub(crate) const DEFAULT_MAX_BFS_DEPTH: usize = 4;
pub(crate) const DEFAULT_MAX_CUCKOO_COUNT: usize = 500;

/// Builds a [`CuckooTable`][table-struct] with various configuration knobs.
///
/// [table-struct]: ./struct.CuckooTable.html
///
/// # Examples
///
/// ```rust
/// use tcuckoo::TableBuilder;
///
/// let table = TableBuilder::new(10_000) // Room for about 10,000 entries
///     // Eight slots per bucket instead of the default twenty.
///     .slot_per_bucket(8)
///     // Report `TableFull` instead of growing.
///     .auto_resize(false)
///     .name("accounts")
///     .build();
///
/// let handle = table.handle();
/// assert!(handle.insert(0, "zero"));
/// assert_eq!(handle.find(&0), Some("zero"));
/// ```
///
pub struct TableBuilder<K, V> {
    name: Option<String>,
    initial_capacity: usize,
    slot_per_bucket: usize,
    max_bfs_depth: usize,
    max_cuckoo_count: usize,
    auto_resize: bool,
    num_counters: Option<usize>,
    version_policy: VersionPolicy,
    table_type: PhantomData<(K, V)>,
}

impl<K, V> TableBuilder<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    /// Construct a new `TableBuilder` that will be used to build a
    /// `CuckooTable` with room for about `initial_capacity` entries before it
    /// first has to grow.
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            name: None,
            initial_capacity,
            slot_per_bucket: DEFAULT_SLOT_PER_BUCKET,
            max_bfs_depth: DEFAULT_MAX_BFS_DEPTH,
            max_cuckoo_count: DEFAULT_MAX_CUCKOO_COUNT,
            auto_resize: true,
            num_counters: None,
            version_policy: VersionPolicy::default(),
            table_type: PhantomData,
        }
    }

    /// Sets the name of the table. Log messages emitted by the table are
    /// prefixed with it when the `logging` feature is enabled.
    pub fn name(self, name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..self
        }
    }

    /// Sets the number of slots in each bucket. Default: 20.
    ///
    /// # Panics
    ///
    /// Panics if `slot_per_bucket` is not in `2..=64`.
    pub fn slot_per_bucket(self, slot_per_bucket: usize) -> Self {
        assert!(
            (2..=64).contains(&slot_per_bucket),
            "slot_per_bucket must be in 2..=64, got {slot_per_bucket}"
        );
        Self {
            slot_per_bucket,
            ..self
        }
    }

    /// Sets the maximum number of relocations in a single cuckoo path.
    /// Default: 4.
    ///
    /// # Panics
    ///
    /// Panics if `max_bfs_depth` is zero.
    pub fn max_bfs_depth(self, max_bfs_depth: usize) -> Self {
        assert!(max_bfs_depth > 0, "max_bfs_depth must be positive");
        Self {
            max_bfs_depth,
            ..self
        }
    }

    /// Sets the capacity of the queue used by the breadth-first search for a
    /// cuckoo path. Bounds the work of a single search. Default: 500.
    ///
    /// # Panics
    ///
    /// Panics if `max_cuckoo_count` is less than 2.
    pub fn max_cuckoo_count(self, max_cuckoo_count: usize) -> Self {
        assert!(max_cuckoo_count >= 2, "max_cuckoo_count must be at least 2");
        Self {
            max_cuckoo_count,
            ..self
        }
    }

    /// Sets whether the table grows when an insert cannot find a free slot.
    /// When disabled, such an insert fails with
    /// [`InsertError::TableFull`][table-full]. Default: `true`.
    ///
    /// [table-full]: ./enum.InsertError.html#variant.TableFull
    pub fn auto_resize(self, auto_resize: bool) -> Self {
        Self {
            auto_resize,
            ..self
        }
    }

    /// Sets the number of shards of the size counters. Default: the
    /// available parallelism of the machine.
    ///
    /// # Panics
    ///
    /// Panics if `num_counters` is zero.
    pub fn num_counters(self, num_counters: usize) -> Self {
        assert!(num_counters > 0, "num_counters must be positive");
        Self {
            num_counters: Some(num_counters),
            ..self
        }
    }

    /// Sets how committing transactions assign versions to the entries they
    /// write. Default: [`VersionPolicy::Opaque`][opaque].
    ///
    /// [opaque]: ./txn/enum.VersionPolicy.html#variant.Opaque
    pub fn version_policy(self, version_policy: VersionPolicy) -> Self {
        Self {
            version_policy,
            ..self
        }
    }

    /// Builds a `CuckooTable<K, V>`.
    pub fn build(self) -> CuckooTable<K, V, RandomState> {
        self.build_with_hasher(RandomState::default())
    }

    /// Builds a `CuckooTable<K, V, S>`, with the given `hasher`.
    ///
    /// # Panics
    ///
    /// Panics if `slot_per_bucket` and `max_bfs_depth` are so large that a
    /// cuckoo path cannot be encoded in 64 bits.
    pub fn build_with_hasher<S>(self, hasher: S) -> CuckooTable<K, V, S>
    where
        S: BuildHasher,
    {
        let config = self.into_config();
        let hashpower = initial_hashpower(config.initial_capacity, config.slot_per_bucket);
        CuckooTable::with_config(config, hashpower, hasher)
    }

    fn into_config(self) -> Config {
        assert!(
            pathcode_fits(self.slot_per_bucket, self.max_bfs_depth),
            "a cuckoo path of depth {} over {} slots per bucket does not fit in 64 bits",
            self.max_bfs_depth,
            self.slot_per_bucket
        );
        Config {
            name: self.name,
            initial_capacity: self.initial_capacity,
            slot_per_bucket: self.slot_per_bucket,
            max_bfs_depth: self.max_bfs_depth,
            max_cuckoo_count: self.max_cuckoo_count,
            auto_resize: self.auto_resize,
            num_counters: self
                .num_counters
                .unwrap_or_else(common::available_parallelism),
            version_policy: self.version_policy,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) name: Option<String>,
    pub(crate) initial_capacity: usize,
    pub(crate) slot_per_bucket: usize,
    pub(crate) max_bfs_depth: usize,
    pub(crate) max_cuckoo_count: usize,
    pub(crate) auto_resize: bool,
    pub(crate) num_counters: usize,
    pub(crate) version_policy: VersionPolicy,
}

/// `ceil(log2(n / slot_per_bucket))`, and at least zero.
pub(crate) fn initial_hashpower(n: usize, slot_per_bucket: usize) -> u32 {
    let buckets = n / slot_per_bucket + usize::from(n % slot_per_bucket != 0);
    common::ceil_log2(buckets)
}

// A pathcode holds one base-`slot_per_bucket` digit per hop plus the leading
// bit that picks the first bucket.
fn pathcode_fits(slot_per_bucket: usize, max_bfs_depth: usize) -> bool {
    let mut limit = 2_u128;
    for _ in 0..=max_bfs_depth {
        limit = limit.saturating_mul(slot_per_bucket as u128);
    }
    limit <= u64::MAX as u128
}

/// The deepest cuckoo path whose pathcode fits in 64 bits.
pub(crate) fn deepest_bfs_depth(slot_per_bucket: usize) -> usize {
    let mut depth = 1;
    while pathcode_fits(slot_per_bucket, depth + 1) {
        depth += 1;
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::{deepest_bfs_depth, initial_hashpower, pathcode_fits, TableBuilder};
    use crate::txn::VersionPolicy;

    #[test]
    fn build_table() {
        let table = TableBuilder::<u32, &str>::new(100)
            .slot_per_bucket(4)
            .version_policy(VersionPolicy::NonOpaque)
            .num_counters(2)
            .build();
        // 100 / 4 = 25 buckets, rounded up to 32.
        assert_eq!(table.hashpower(), 5);
        assert_eq!(table.bucket_count(), 32);
        assert!(table.is_empty());

        let handle = table.handle();
        assert!(handle.insert(1, "one"));
        assert_eq!(handle.find(&1), Some("one"));
    }

    #[test]
    fn hashpower_rounds_up() {
        assert_eq!(initial_hashpower(0, 20), 0);
        assert_eq!(initial_hashpower(20, 20), 0);
        assert_eq!(initial_hashpower(21, 20), 1);
        assert_eq!(initial_hashpower(100, 20), 3);
        assert_eq!(initial_hashpower(1 << 20, 4), 18);
    }

    #[test]
    fn pathcode_limits() {
        assert!(pathcode_fits(20, 4));
        assert!(pathcode_fits(64, 4));
        assert!(!pathcode_fits(64, 12));
    }

    #[test]
    fn deepest_bfs_depth_is_the_last_that_fits() {
        for spb in [2, 4, 8, 20, 64] {
            let depth = deepest_bfs_depth(spb);
            assert!(pathcode_fits(spb, depth));
            assert!(!pathcode_fits(spb, depth + 1));
        }
        // 2 * 2^(d + 1) <= u64::MAX
        assert_eq!(deepest_bfs_depth(2), 61);
    }

    #[test]
    #[should_panic(expected = "slot_per_bucket must be in 2..=64")]
    fn reject_single_slot_buckets() {
        let _ = TableBuilder::<u32, u32>::new(10).slot_per_bucket(1);
    }
}
