//! Optimistic transactions over a single [`CuckooTable`][table-struct].
//!
//! A transaction buffers its reads and writes in a set of items. Reads
//! record the version of the entry they saw, or, for an absent key, the
//! versions of the buckets that were searched. Inserts are applied to the
//! table immediately as *phantom* entries, which other readers treat as not
//! yet present, and deletes are applied at commit by turning the entry into a
//! phantom and erasing it afterwards.
//!
//! Commit locks every written item, validates every read item, installs the
//! writes and unlocks. If validation fails, or a lock cannot be taken within
//! a bounded number of spins, the transaction aborts and every change it made
//! is undone.
//!
//! [table-struct]: ../struct.CuckooTable.html
//!
//! # Examples
//!
//! ```rust
//! use tcuckoo::{CuckooTable, TxnError};
//!
//! let table = CuckooTable::new(100);
//! let handle = table.handle();
//! assert!(handle.insert("alice", 100));
//! assert!(handle.insert("bob", 50));
//!
//! let transfer = |amount: i32| -> Result<(), TxnError> {
//!     let mut txn = handle.transaction();
//!     let alice = txn.get(&"alice")?.unwrap_or_default();
//!     let bob = txn.get(&"bob")?.unwrap_or_default();
//!     // Overwriting a key is a delete followed by an insert.
//!     txn.remove(&"alice")?;
//!     txn.insert("alice", alice - amount)?;
//!     txn.remove(&"bob")?;
//!     txn.insert("bob", bob + amount)?;
//!     txn.commit()
//! };
//!
//! transfer(30).unwrap();
//! assert_eq!(handle.find(&"alice"), Some(70));
//! assert_eq!(handle.find(&"bob"), Some(80));
//! ```

use std::{
    collections::{hash_map::RandomState, HashMap},
    hash::{BuildHasher, Hash},
};

use crossbeam_epoch::{Guard, Shared};
use crossbeam_utils::Backoff;

mod adapter;
pub(crate) mod item;

use self::{
    adapter::{CommitContext, TransactionalObject},
    item::{BucketRef, ItemKey, TransItem, INSERT},
};
use crate::{
    cht::{
        bucket::Entry,
        reclaim::ThreadContext,
        table::{CuckooTable, InsertMode, InsertOutcome, Lookup, Observations},
    },
    common::{error::TxnError, version},
};

/// How a commit assigns versions to the entries it writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VersionPolicy {
    /// Written entries take the commit timestamp, drawn from a table-wide
    /// clock, as their version.
    #[default]
    Opaque,
    /// Written entries advance their own version counter by one step.
    NonOpaque,
}

/// A transaction on a table, started with
/// [`Handle::transaction`][txn-method].
///
/// The transaction keeps the handle's epoch pinned until it finishes, so
/// memory retired by concurrent resizes is not released while it runs.
/// Dropping a transaction without committing aborts it.
///
/// After any operation returns an error, the transaction can only abort:
/// [`commit`](#method.commit) returns the same error.
///
/// [txn-method]: ../struct.Handle.html#method.transaction
pub struct Transaction<'h, K, V, S = RandomState>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    table: &'h CuckooTable<K, V, S>,
    counter_id: usize,
    items: Vec<TransItem<K, V>>,
    index: HashMap<ItemKey<K, V>, usize>,
    failed: Option<TxnError>,
    finished: bool,
    guard: Guard,
}

impl<'h, K, V, S> Transaction<'h, K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    pub(crate) fn new(table: &'h CuckooTable<K, V, S>, context: &ThreadContext) -> Self {
        Self {
            table,
            counter_id: context.counter_id(),
            items: Vec::new(),
            index: HashMap::new(),
            failed: None,
            finished: false,
            guard: context.pin(),
        }
    }

    /// Returns the value of the key as seen by this transaction.
    ///
    /// Fails with [`TxnError::Phantom`] if another transaction has an
    /// unfinished insert or delete of the key.
    pub fn get(&mut self, key: &K) -> Result<Option<V>, TxnError> {
        self.healthy()?;
        let result = self.get_inner(key);
        self.track(result)
    }

    /// Inserts a key-value pair. Returns `Ok(false)` if the key is already
    /// present.
    pub fn insert(&mut self, key: K, value: V) -> Result<bool, TxnError> {
        self.healthy()?;
        let result = self.insert_inner(key, value);
        self.track(result)
    }

    /// Removes the key. Returns `Ok(false)` if it is not present.
    pub fn remove(&mut self, key: &K) -> Result<bool, TxnError> {
        self.healthy()?;
        let result = self.remove_inner(key);
        self.track(result)
    }

    /// Commits the transaction.
    ///
    /// On failure every change made by the transaction is undone.
    pub fn commit(mut self) -> Result<(), TxnError> {
        if let Some(error) = self.failed {
            self.finish(false);
            return Err(error);
        }
        let committed = self.try_commit();
        self.finish(committed);
        if committed {
            Ok(())
        } else {
            Err(TxnError::Conflict)
        }
    }

    /// Aborts the transaction, undoing every change it made.
    pub fn abort(mut self) {
        self.finish(false);
    }

    fn healthy(&self) -> Result<(), TxnError> {
        match self.failed {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn track<T>(&mut self, result: Result<T, TxnError>) -> Result<T, TxnError> {
        if let Err(error) = &result {
            self.failed.get_or_insert(*error);
        }
        result
    }

    fn get_inner(&mut self, key: &K) -> Result<Option<V>, TxnError> {
        if let Some(index) = self.item_index(key) {
            let item = &self.items[index];
            if item.is_delete() {
                return Ok(None);
            }
            if item.is_delete_then_insert() {
                return Ok(item.write.clone());
            }
            // SAFETY: the guard has been pinned since the item was created.
            let Some(entry) = (unsafe { item.entry() }) else {
                return Ok(None);
            };
            if item.is_insert() {
                return Ok(Some(entry.value(&self.guard).clone()));
            }
            // Read again; it must still be the same.
            return match read_consistent(entry, &self.guard)? {
                Some((version, value)) if item.read_version == Some(version) => Ok(Some(value)),
                _ => Err(TxnError::Conflict),
            };
        }

        let hash = self.table.hash(key);
        loop {
            match self.table.find_entry(key, hash, &self.guard) {
                Lookup::Found(ptr) => {
                    // SAFETY: protected by the guard.
                    let entry = unsafe { ptr.deref() };
                    let Some((version, value)) = read_consistent(entry, &self.guard)? else {
                        continue;
                    };
                    let raw = ptr.as_raw();
                    self.push_item(TransItem::read_entry(key.clone(), raw, version));
                    return Ok(Some(value));
                }
                Lookup::Absent(observations) => {
                    self.observe(observations);
                    return Ok(None);
                }
            }
        }
    }

    fn insert_inner(&mut self, key: K, value: V) -> Result<bool, TxnError> {
        if let Some(index) = self.item_index(&key) {
            let item = &mut self.items[index];
            if item.is_delete() {
                item.flags |= INSERT;
                item.write = Some(value);
                return Ok(true);
            }
            // Inserted by us already, or read as present.
            return Ok(false);
        }

        let hash = self.table.hash(&key);
        loop {
            let initial_version = version::with_phantom(self.table.clock());
            match self.table.insert_entry(
                key.clone(),
                hash,
                value.clone(),
                initial_version,
                InsertMode::Phantom,
                self.counter_id,
                &self.guard,
            ) {
                InsertOutcome::Inserted { primary, entry } => {
                    let raw = entry.as_raw();
                    self.push_item(TransItem::inserted_entry(key, raw));
                    self.write_bucket(primary);
                    return Ok(true);
                }
                InsertOutcome::Duplicate(existing) => {
                    // SAFETY: protected by the guard.
                    let entry = unsafe { existing.deref() };
                    let Some(version) = read_version(entry)? else {
                        continue;
                    };
                    let raw = existing.as_raw();
                    self.push_item(TransItem::read_entry(key, raw, version));
                    return Ok(false);
                }
                InsertOutcome::TableFull => return Err(TxnError::TableFull),
            }
        }
    }

    fn remove_inner(&mut self, key: &K) -> Result<bool, TxnError> {
        if let Some(index) = self.item_index(key) {
            let item = &mut self.items[index];
            if item.is_insert() {
                // Our own phantom: nobody else can have seen it, so it goes
                // right away.
                let expected = item.entry;
                // SAFETY: the guard has been pinned since the item was created.
                let hash = unsafe { (*expected).hash };
                self.table.remove(
                    key,
                    hash,
                    Some(Shared::from(expected)),
                    self.counter_id,
                    &self.guard,
                );
                self.forget(index);
                return Ok(true);
            }
            if item.is_delete_then_insert() {
                item.flags = item::DELETE;
                item.write = None;
                return Ok(true);
            }
            if item.is_delete() {
                return Ok(false);
            }
            item.flags |= item::DELETE;
            return Ok(true);
        }

        let hash = self.table.hash(key);
        loop {
            match self.table.find_entry(key, hash, &self.guard) {
                Lookup::Found(ptr) => {
                    // SAFETY: protected by the guard.
                    let entry = unsafe { ptr.deref() };
                    let Some(version) = read_version(entry)? else {
                        continue;
                    };
                    let mut item = TransItem::read_entry(key.clone(), ptr.as_raw(), version);
                    item.flags = item::DELETE;
                    self.push_item(item);
                    return Ok(true);
                }
                Lookup::Absent(observations) => {
                    self.observe(observations);
                    return Ok(false);
                }
            }
        }
    }

    fn try_commit(&mut self) -> bool {
        let table = self.table;
        let mut ctx = CommitContext::new(&self.guard, self.counter_id);
        for item in self.items.iter_mut().filter(|item| item.has_write()) {
            if !table.lock(item, &ctx) {
                return false;
            }
        }
        ctx.set_tid(table.next_commit_tid());
        let valid = self
            .items
            .iter()
            .filter(|item| item.has_read())
            .all(|item| table.check(item, &ctx));
        if !valid {
            return false;
        }
        for item in self.items.iter().filter(|item| item.has_write()) {
            table.install(item, &ctx);
        }
        true
    }

    fn finish(&mut self, committed: bool) {
        let table = self.table;
        let ctx = CommitContext::new(&self.guard, self.counter_id);
        for item in self.items.iter_mut() {
            table.unlock(item);
        }
        for item in &self.items {
            table.cleanup(item, committed, &ctx);
        }
        self.items.clear();
        self.index.clear();
        self.finished = true;
    }

    fn item_index(&self, key: &K) -> Option<usize> {
        self.index.get(&ItemKey::Key(key.clone())).copied()
    }

    fn push_item(&mut self, item: TransItem<K, V>) {
        self.index.insert(item.key.clone(), self.items.len());
        self.items.push(item);
    }

    fn forget(&mut self, index: usize) {
        let item = self.items.swap_remove(index);
        self.index.remove(&item.key);
        if let Some(moved) = self.items.get(index) {
            if let Some(position) = self.index.get_mut(&moved.key) {
                *position = index;
            }
        }
    }

    fn write_bucket(&mut self, bucket: BucketRef<K, V>) {
        match self.index.get(&ItemKey::Bucket(bucket)) {
            Some(&index) => self.items[index].flags |= INSERT,
            None => self.push_item(TransItem::written_bucket(bucket)),
        }
    }

    fn observe(&mut self, observations: Observations<K, V>) {
        for (bucket, version) in observations {
            match self.index.get(&ItemKey::Bucket(bucket)) {
                Some(&index) => {
                    let item = &mut self.items[index];
                    item.read_version.get_or_insert(version);
                }
                None => self.push_item(TransItem::observed_bucket(bucket, version)),
            }
        }
    }
}

impl<'h, K, V, S> Drop for Transaction<'h, K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    fn drop(&mut self) {
        if !self.finished {
            self.finish(false);
        }
    }
}

/// Reads a committed entry's version. `None` if the entry has been erased.
fn read_version<K, V>(entry: &Entry<K, V>) -> Result<Option<u64>, TxnError> {
    let backoff = Backoff::new();
    loop {
        let current = entry.version.version();
        if version::is_locked(current) {
            backoff.snooze();
            continue;
        }
        if entry.is_unlinked() {
            return Ok(None);
        }
        if version::is_phantom(current) {
            return Err(TxnError::Phantom);
        }
        return Ok(Some(current));
    }
}

/// Reads a committed entry's version together with a value written under
/// that version. `None` if the entry has been erased.
fn read_consistent<K, V: Clone>(entry: &Entry<K, V>, guard: &Guard) -> Result<Option<(u64, V)>, TxnError> {
    loop {
        let Some(before) = read_version(entry)? else {
            return Ok(None);
        };
        let value = entry.value(guard).clone();
        if entry.version.version() == before {
            return Ok(Some((before, value)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::VersionPolicy;
    use crate::{CuckooTable, TableBuilder, TxnError};

    #[test]
    fn reads_own_writes() {
        let table = CuckooTable::new(100);
        let handle = table.handle();
        assert!(handle.insert(1, "one"));

        let mut txn = handle.transaction();
        assert_eq!(txn.get(&1), Ok(Some("one")));
        assert_eq!(txn.get(&2), Ok(None));
        assert_eq!(txn.insert(2, "two"), Ok(true));
        assert_eq!(txn.insert(2, "deux"), Ok(false));
        assert_eq!(txn.get(&2), Ok(Some("two")));
        assert_eq!(txn.insert(1, "uno"), Ok(false));
        assert_eq!(txn.remove(&1), Ok(true));
        assert_eq!(txn.remove(&1), Ok(false));
        assert_eq!(txn.get(&1), Ok(None));
        assert_eq!(txn.remove(&3), Ok(false));

        // Not visible outside before commit.
        assert_eq!(handle.find(&2), None);
        assert_eq!(handle.find(&1), Some("one"));

        txn.commit().expect("no conflict");
        assert_eq!(handle.find(&1), None);
        assert_eq!(handle.find(&2), Some("two"));
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn uncommitted_insert_is_a_phantom() {
        let table = CuckooTable::new(100);
        let handle = table.handle();

        let mut writer = handle.transaction();
        assert_eq!(writer.insert(7, 70), Ok(true));
        // Physically present, logically absent.
        assert_eq!(table.size(), 1);
        assert_eq!(handle.find(&7), None);
        assert!(!handle.contains_key(&7));
        assert!(!handle.insert(7, 71));
        assert!(!handle.erase(&7));
        assert!(!handle.update(&7, 72));

        let mut reader = handle.transaction();
        assert_eq!(reader.get(&7), Err(TxnError::Phantom));
        // A failed transaction cannot commit.
        assert_eq!(reader.get(&8), Err(TxnError::Phantom));
        assert_eq!(reader.commit(), Err(TxnError::Phantom));

        writer.commit().expect("no conflict");
        assert_eq!(handle.find(&7), Some(70));
    }

    #[test]
    fn abort_undoes_inserts() {
        let table = CuckooTable::new(100);
        let handle = table.handle();

        let mut txn = handle.transaction();
        for key in 0..10 {
            assert_eq!(txn.insert(key, key), Ok(true));
        }
        assert_eq!(table.size(), 10);
        txn.abort();
        assert!(table.is_empty());

        {
            let mut txn = handle.transaction();
            assert_eq!(txn.insert(1, 1), Ok(true));
            // Dropped without commit.
        }
        assert!(table.is_empty());
        assert_eq!(handle.find(&1), None);
        assert!(handle.insert(1, 2));
    }

    #[test]
    fn removing_own_insert_erases_it_now() {
        let table = CuckooTable::new(100);
        let handle = table.handle();

        let mut txn = handle.transaction();
        assert_eq!(txn.insert(5, "five"), Ok(true));
        assert_eq!(txn.remove(&5), Ok(true));
        assert!(table.is_empty());
        assert_eq!(txn.get(&5), Ok(None));
        txn.commit().expect("no conflict");
        assert_eq!(handle.find(&5), None);
    }

    #[test]
    fn delete_then_insert_overwrites() {
        let table = TableBuilder::new(100)
            .version_policy(VersionPolicy::NonOpaque)
            .build();
        let handle = table.handle();
        assert!(handle.insert("k", 1));

        let mut txn = handle.transaction();
        assert_eq!(txn.remove(&"k"), Ok(true));
        assert_eq!(txn.insert("k", 2), Ok(true));
        assert_eq!(txn.get(&"k"), Ok(Some(2)));
        // The old value stays visible until commit.
        assert_eq!(handle.find(&"k"), Some(1));
        txn.commit().expect("no conflict");
        assert_eq!(handle.find(&"k"), Some(2));
        assert_eq!(table.size(), 1);

        // Delete, insert and delete again is a plain delete.
        let mut txn = handle.transaction();
        assert_eq!(txn.remove(&"k"), Ok(true));
        assert_eq!(txn.insert("k", 3), Ok(true));
        assert_eq!(txn.remove(&"k"), Ok(true));
        txn.commit().expect("no conflict");
        assert_eq!(handle.find(&"k"), None);
        assert!(table.is_empty());
    }

    #[test]
    fn committed_delete_erases_the_entry() {
        let table = CuckooTable::new(100);
        let handle = table.handle();
        assert!(handle.insert(1, 10));
        assert!(handle.insert(2, 20));

        let mut txn = handle.transaction();
        assert_eq!(txn.remove(&1), Ok(true));
        assert_eq!(handle.find(&1), Some(10));
        txn.commit().expect("no conflict");

        assert_eq!(handle.find(&1), None);
        assert_eq!(table.size(), 1);
        assert_eq!(table.num_deletes(), 1);
    }

    #[test]
    fn changed_value_conflicts() {
        let table = CuckooTable::new(100);
        let handle = table.handle();
        assert!(handle.insert(1, 10));

        let mut txn = handle.transaction();
        assert_eq!(txn.get(&1), Ok(Some(10)));
        assert!(handle.update(&1, 11));
        assert_eq!(txn.insert(2, 20), Ok(true));
        assert_eq!(txn.commit(), Err(TxnError::Conflict));

        // The aborted insert is gone, the update stays.
        assert_eq!(handle.find(&2), None);
        assert_eq!(handle.find(&1), Some(11));
    }

    #[test]
    fn repeated_read_of_changed_value_conflicts() {
        let table = CuckooTable::new(100);
        let handle = table.handle();
        assert!(handle.insert(1, 10));

        let mut txn = handle.transaction();
        assert_eq!(txn.get(&1), Ok(Some(10)));
        assert!(handle.update(&1, 11));
        assert_eq!(txn.get(&1), Err(TxnError::Conflict));
        assert_eq!(txn.commit(), Err(TxnError::Conflict));
    }

    #[test]
    fn insert_after_observed_absence_conflicts() {
        let table = CuckooTable::new(100);
        let handle = table.handle();

        let mut txn = handle.transaction();
        assert_eq!(txn.get(&1), Ok(None));
        assert!(handle.insert(1, 10));
        assert_eq!(txn.insert(2, 20), Ok(true));
        assert_eq!(txn.commit(), Err(TxnError::Conflict));
        assert_eq!(handle.find(&2), None);
    }

    #[test]
    fn own_insert_after_observed_absence_commits() {
        let table = CuckooTable::new(100);
        let handle = table.handle();

        let mut txn = handle.transaction();
        assert_eq!(txn.get(&1), Ok(None));
        assert_eq!(txn.insert(1, 10), Ok(true));
        assert_eq!(txn.get(&1), Ok(Some(10)));
        txn.commit().expect("no conflict");
        assert_eq!(handle.find(&1), Some(10));
    }

    #[test]
    fn erase_under_a_reader_conflicts() {
        let table = CuckooTable::new(100);
        let handle = table.handle();
        assert!(handle.insert(1, 10));

        let mut txn = handle.transaction();
        assert_eq!(txn.insert(1, 11), Ok(false));
        assert!(handle.erase(&1));
        assert_eq!(txn.commit(), Err(TxnError::Conflict));
    }

    #[test]
    fn competing_inserts() {
        let table = CuckooTable::new(100);
        let handle = table.handle();

        let mut first = handle.transaction();
        let mut second = handle.transaction();
        assert_eq!(first.insert(1, "first"), Ok(true));
        assert_eq!(second.insert(1, "second"), Err(TxnError::Phantom));
        drop(second);
        first.commit().expect("no conflict");
        assert_eq!(handle.find(&1), Some("first"));
    }
}
