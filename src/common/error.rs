/// Outcomes of the internal table operations other than success.
///
/// `TooSlow`, `KeyMoved` and `UnderExpansion` are transient: they are always
/// resolved by retrying inside the table and never reach a caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Status {
    KeyNotFound,
    /// A concurrent writer changed a bucket we depended on.
    TooSlow,
    /// The bounded cuckoo search could not free a slot.
    TableFull,
    /// Somebody else already started or finished the resize we attempted.
    UnderExpansion,
    /// The bucket was migrated (or the generation frozen) by a resize.
    KeyMoved,
}

/// The error type of [`Handle::try_insert`][try-insert].
///
/// [try-insert]: ./struct.Handle.html#method.try_insert
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// The key is already present in the table.
    #[error("the key is already present in the table")]
    KeyDuplicated,

    /// The table could not find a free slot for the key and automatic
    /// resizing is disabled.
    ///
    /// Resizing can be enabled with
    /// [`TableBuilder::auto_resize`][auto-resize], or performed manually with
    /// [`CuckooTable::expand`][expand].
    ///
    /// [auto-resize]: ./struct.TableBuilder.html#method.auto_resize
    /// [expand]: ./struct.CuckooTable.html#method.expand
    #[error("the table is full and automatic resizing is disabled")]
    TableFull,
}

/// The reason a [`Transaction`][txn] was aborted.
///
/// [txn]: ./txn/struct.Transaction.html
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnError {
    /// The transaction touched an entry that another in-flight transaction
    /// inserted or deleted but has not finished with.
    #[error("observed an uncommitted insert or delete of another transaction")]
    Phantom,

    /// A value or bucket read by the transaction changed before commit, or a
    /// lock needed by the commit could not be acquired.
    #[error("the transaction conflicts with a concurrent writer")]
    Conflict,

    /// An insert could not find a free slot and automatic resizing is
    /// disabled.
    #[error("the table is full and automatic resizing is disabled")]
    TableFull,
}
