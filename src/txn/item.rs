use std::{
    fmt,
    hash::{Hash, Hasher},
    mem, ptr,
};

use crate::{
    cht::{
        bucket::{Bucket, Entry},
        generation::Generation,
    },
    common::version::VersionedLock,
};

pub(crate) const INSERT: u8 = 0b01;
pub(crate) const DELETE: u8 = 0b10;

/// Identifies one bucket of one table generation.
///
/// The generation is referenced by address. A transaction keeps its epoch
/// pinned for as long as it holds any `BucketRef`, so the address stays valid
/// even if a resize retires the generation in the meantime.
pub(crate) struct BucketRef<K, V> {
    generation: *const Generation<K, V>,
    index: usize,
}

impl<K, V> BucketRef<K, V> {
    pub(crate) fn new(generation: &Generation<K, V>, index: usize) -> Self {
        Self {
            generation,
            index,
        }
    }

    /// # Safety
    ///
    /// The epoch in which this reference was created must still be pinned.
    pub(crate) unsafe fn bucket(&self) -> &Bucket<K, V> {
        (*self.generation).bucket(self.index)
    }
}

impl<K, V> Clone for BucketRef<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for BucketRef<K, V> {}

impl<K, V> PartialEq for BucketRef<K, V> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.generation, other.generation) && self.index == other.index
    }
}

impl<K, V> Eq for BucketRef<K, V> {}

impl<K, V> Hash for BucketRef<K, V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.generation as usize).hash(state);
        self.index.hash(state);
    }
}

impl<K, V> fmt::Debug for BucketRef<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketRef")
            .field("generation", &self.generation)
            .field("index", &self.index)
            .finish()
    }
}

/// What a transaction item refers to: the version of a bucket (recorded for
/// absent keys), or the entry of a key.
pub(crate) enum ItemKey<K, V> {
    Bucket(BucketRef<K, V>),
    Key(K),
}

impl<K: Clone, V> Clone for ItemKey<K, V> {
    fn clone(&self) -> Self {
        match self {
            Self::Bucket(bucket) => Self::Bucket(*bucket),
            Self::Key(key) => Self::Key(key.clone()),
        }
    }
}

impl<K: PartialEq, V> PartialEq for ItemKey<K, V> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bucket(a), Self::Bucket(b)) => a == b,
            (Self::Key(a), Self::Key(b)) => a == b,
            _ => false,
        }
    }
}

impl<K: Eq, V> Eq for ItemKey<K, V> {}

impl<K: Hash, V> Hash for ItemKey<K, V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        mem::discriminant(self).hash(state);
        match self {
            Self::Bucket(bucket) => bucket.hash(state),
            Self::Key(key) => key.hash(state),
        }
    }
}

impl<K: fmt::Debug, V> fmt::Debug for ItemKey<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bucket(bucket) => f.debug_tuple("Bucket").field(bucket).finish(),
            Self::Key(key) => f.debug_tuple("Key").field(key).finish(),
        }
    }
}

/// One element of a transaction's read and write sets.
///
/// A key item refers to the entry it observed or inserted. Like
/// [`BucketRef`], the entry is referenced by address and is kept alive by the
/// transaction's pinned epoch.
pub(crate) struct TransItem<K, V> {
    pub(crate) key: ItemKey<K, V>,
    /// The version observed when the item was read.
    pub(crate) read_version: Option<u64>,
    /// The value written by a delete-then-insert.
    pub(crate) write: Option<V>,
    pub(crate) flags: u8,
    pub(crate) locked: bool,
    pub(crate) entry: *const Entry<K, V>,
}

impl<K, V> TransItem<K, V> {
    pub(crate) fn observed_bucket(bucket: BucketRef<K, V>, version: u64) -> Self {
        Self {
            key: ItemKey::Bucket(bucket),
            read_version: Some(version),
            write: None,
            flags: 0,
            locked: false,
            entry: ptr::null(),
        }
    }

    pub(crate) fn written_bucket(bucket: BucketRef<K, V>) -> Self {
        Self {
            key: ItemKey::Bucket(bucket),
            read_version: None,
            write: None,
            flags: INSERT,
            locked: false,
            entry: ptr::null(),
        }
    }

    pub(crate) fn read_entry(key: K, entry: *const Entry<K, V>, version: u64) -> Self {
        Self {
            key: ItemKey::Key(key),
            read_version: Some(version),
            write: None,
            flags: 0,
            locked: false,
            entry,
        }
    }

    pub(crate) fn inserted_entry(key: K, entry: *const Entry<K, V>) -> Self {
        Self {
            key: ItemKey::Key(key),
            read_version: None,
            write: None,
            flags: INSERT,
            locked: false,
            entry,
        }
    }

    /// Returns `true` if committing the item changes the table.
    pub(crate) fn has_write(&self) -> bool {
        self.flags != 0
    }

    /// Returns `true` if the item must be validated at commit.
    pub(crate) fn has_read(&self) -> bool {
        self.read_version.is_some()
    }

    pub(crate) fn is_insert(&self) -> bool {
        self.flags == INSERT
    }

    pub(crate) fn is_delete(&self) -> bool {
        self.flags == DELETE
    }

    pub(crate) fn is_delete_then_insert(&self) -> bool {
        self.flags == INSERT | DELETE
    }

    /// # Safety
    ///
    /// The epoch in which the item was created must still be pinned.
    pub(crate) unsafe fn entry(&self) -> Option<&Entry<K, V>> {
        self.entry.as_ref()
    }

    /// The version word that protects the item.
    ///
    /// # Safety
    ///
    /// The epoch in which the item was created must still be pinned.
    pub(crate) unsafe fn version_lock(&self) -> &VersionedLock {
        match &self.key {
            ItemKey::Bucket(bucket) => &bucket.bucket().version,
            ItemKey::Key(_) => {
                debug_assert!(!self.entry.is_null());
                &(*self.entry).version
            }
        }
    }
}

impl<K: fmt::Debug, V> fmt::Debug for TransItem<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransItem")
            .field("key", &self.key)
            .field("read_version", &self.read_version)
            .field("flags", &self.flags)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}
