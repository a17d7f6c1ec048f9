//! Transactional ordered key-value storage
//!
//! The [`kv`] module defines the capability the trading crates program
//! against; [`MemDb`] implements it on an in-memory map made durable by a
//! CRC-checked, segmented write-ahead log.

#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod error;
pub mod kv;
pub mod kvutil;
pub mod memdb;
pub mod segment;
pub mod wal;

pub use error::{StorageError, StorageResult};
pub use kv::{Database, KeyRange, KvIter, Reader, Transaction, Writer, path_range, with_read_writer, with_reader};
pub use memdb::MemDb;
pub use wal::{Wal, WalEntry, WalIterator, WalStats};
