#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! A concurrent, resizable cuckoo hash table with optimistic transactions.
//!
//! [`CuckooTable`][table-struct] stores key-value pairs in buckets of a fixed
//! number of slots. Each key may live in one of two buckets, so a lookup
//! reads at most two buckets, and does so without taking any lock. Inserts
//! relocate existing keys along short cuckoo paths when both buckets of a new
//! key are full, and the table doubles in size without blocking readers or
//! writers when no such path exists.
//!
//! Worker threads access a table through a [`Handle`][handle-struct], which
//! registers them with the table's memory reclaimer. A handle can also start
//! a [`Transaction`][txn-struct]: a set of reads, inserts and removes that
//! commit atomically or not at all.
//!
//! [table-struct]: ./struct.CuckooTable.html
//! [handle-struct]: ./struct.Handle.html
//! [txn-struct]: ./txn/struct.Transaction.html
//!
//! # Example
//!
//! ```rust
//! use tcuckoo::CuckooTable;
//!
//! let table = CuckooTable::new(1_000);
//! let handle = table.handle();
//!
//! assert!(handle.insert("apple", 3));
//! assert!(!handle.insert("apple", 4));
//! assert_eq!(handle.find(&"apple"), Some(3));
//!
//! assert!(handle.update(&"apple", 5));
//! assert_eq!(handle.find(&"apple"), Some(5));
//!
//! assert!(handle.erase(&"apple"));
//! assert!(table.is_empty());
//! ```
//!
//! # Logging
//!
//! With the `logging` feature enabled, tables log their resizes through the
//! [`log`](https://docs.rs/log) crate.

pub(crate) mod builder;
pub(crate) mod cht;
pub(crate) mod common;
pub mod txn;

pub use builder::TableBuilder;
pub use cht::table::{CuckooTable, Handle};
pub use common::error::{InsertError, TxnError};
pub use txn::{Transaction, VersionPolicy};
