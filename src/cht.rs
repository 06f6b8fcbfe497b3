//! The concurrent cuckoo hash table.
//!
//! A table is a sequence of *generations*. A generation is an array of
//! `2^hashpower` buckets, each with a fixed number of slots holding pointers
//! to entries. A key hashes to a primary bucket `i1` and, through a partial
//! key tag, to an alternate bucket `i2`; the mapping between the two is an
//! involution, so a key can always be moved from one to the other without
//! rehashing it.
//!
//! Every bucket carries two version words. The first is a seqlock guarding
//! its slots: writers hold it while they change the bucket, and lookups read
//! without locking and retry if the word moved under them. The second is the
//! version seen by transactions that found a key absent; it advances when a
//! key whose primary bucket this is gets inserted, and when the bucket is
//! migrated. Each bucket also counts the keys whose primary bucket it is but
//! that live in their alternate bucket, which lets most lookups and deletes
//! finish after looking at `i1` alone.
//!
//! When both buckets of a new key are full, the table searches breadth first
//! for a short chain of keys that can each move to their alternate bucket,
//! and moves them from the empty end of the chain backwards. When no chain is
//! found, the table grows: a new generation twice as large is published next
//! to the current one, and every thread that writes helps move buckets over
//! before touching the new generation. The old generation is handed to an
//! epoch-based collector once the last bucket has moved, and is freed when no
//! pinned thread can still be reading it.
//!
//! The design follows [the libcuckoo paper][libcuckoo] and its lock-based
//! concurrent variant, with the optimistic lookups of [MemC3][memc3].
//!
//! [libcuckoo]: https://www.cs.princeton.edu/~mfreed/docs/cuckoo-eurosys14.pdf
//! [memc3]: https://www.usenix.org/conference/nsdi13/technical-sessions/presentation/fan

pub(crate) mod bucket;
pub(crate) mod cuckoo_path;
pub(crate) mod generation;
pub(crate) mod reclaim;
pub(crate) mod table;

#[cfg(test)]
pub(crate) mod test_util;
