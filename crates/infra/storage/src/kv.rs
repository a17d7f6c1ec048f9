//! Transactional key-value capability
//!
//! Keys are slash-delimited paths in one ordered key space. A [`Database`]
//! hands out read transactions and read-write transactions; a read-write
//! transaction becomes visible atomically on [`Transaction::commit`] and is
//! discarded when dropped without committing.

use crate::error::{StorageError, StorageResult};
use std::ops::Bound;

/// Half-open key range `[begin, end)`; an empty bound is unbounded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    /// Inclusive lower bound
    pub begin: String,
    /// Exclusive upper bound
    pub end: String,
}

impl KeyRange {
    /// Create a range from explicit bounds
    #[must_use]
    pub fn new(begin: impl Into<String>, end: impl Into<String>) -> Self {
        Self { begin: begin.into(), end: end.into() }
    }

    /// The whole key space
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Check if `key` falls inside the range
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        (self.begin.is_empty() || key >= self.begin.as_str())
            && (self.end.is_empty() || key < self.end.as_str())
    }

    /// True when no key can fall inside the range
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.begin.is_empty() && !self.end.is_empty() && self.begin >= self.end
    }

    /// Bounds suitable for `BTreeMap::range`
    #[must_use]
    pub fn bounds(&self) -> (Bound<&str>, Bound<&str>) {
        let lo = if self.begin.is_empty() { Bound::Unbounded } else { Bound::Included(self.begin.as_str()) };
        let hi = if self.end.is_empty() { Bound::Unbounded } else { Bound::Excluded(self.end.as_str()) };
        (lo, hi)
    }
}

/// Range covering exactly the subtree under `dir`: `[dir/, dir0)`
///
/// `'0'` is the byte after `'/'`, so every `dir/...` key sorts inside and
/// sibling keys such as `dir-x` or `dirx` sort outside.
#[must_use]
pub fn path_range(dir: &str) -> KeyRange {
    let dir = dir.trim_end_matches('/');
    KeyRange::new(format!("{dir}/"), format!("{dir}0"))
}

/// Iterator over `(key, value)` pairs of a range scan
pub type KvIter<'a> = Box<dyn Iterator<Item = (String, Vec<u8>)> + 'a>;

/// Read access to the key space
pub trait Reader {
    /// Value stored at `key`
    ///
    /// # Errors
    /// Returns an error if the engine fails to read.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Keys in `range` in ascending order
    ///
    /// # Errors
    /// Returns an error if the engine fails to read.
    fn ascend(&self, range: &KeyRange) -> StorageResult<KvIter<'_>>;

    /// Keys in `range` in descending order
    ///
    /// # Errors
    /// Returns an error if the engine fails to read.
    fn descend(&self, range: &KeyRange) -> StorageResult<KvIter<'_>>;
}

/// Write access to the key space
pub trait Writer: Reader {
    /// Store `value` at `key`
    ///
    /// # Errors
    /// Returns an error if the engine rejects the write.
    fn set(&mut self, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Remove `key`
    ///
    /// # Errors
    /// Returns an error if the engine rejects the write.
    fn delete(&mut self, key: &str) -> StorageResult<()>;
}

/// A read-write transaction
pub trait Transaction: Writer {
    /// Make every write of this transaction visible atomically
    ///
    /// # Errors
    /// Returns an error if the writes could not be made durable; none of
    /// them are applied in that case.
    fn commit(self: Box<Self>) -> StorageResult<()>;
}

/// Transactional ordered key-value store
pub trait Database: Send + Sync {
    /// Start a read transaction
    ///
    /// # Errors
    /// Returns an error if the engine cannot start a transaction.
    fn begin_read(&self) -> StorageResult<Box<dyn Reader + '_>>;

    /// Start a read-write transaction
    ///
    /// # Errors
    /// Returns an error if the engine cannot start a transaction.
    fn begin_write(&self) -> StorageResult<Box<dyn Transaction + '_>>;
}

/// Run `f` inside a read transaction
///
/// # Errors
/// Propagates errors from starting the transaction and from `f`.
pub fn with_reader<T, E, F>(db: &dyn Database, f: F) -> Result<T, E>
where
    E: From<StorageError>,
    F: FnOnce(&dyn Reader) -> Result<T, E>,
{
    let reader = db.begin_read()?;
    f(&*reader)
}

/// Run `f` inside a read-write transaction, committing when it succeeds
///
/// The transaction is dropped uncommitted when `f` fails.
///
/// # Errors
/// Propagates errors from starting or committing the transaction and from
/// `f`.
pub fn with_read_writer<T, E, F>(db: &dyn Database, f: F) -> Result<T, E>
where
    E: From<StorageError>,
    F: FnOnce(&mut dyn Transaction) -> Result<T, E>,
{
    let mut tx = db.begin_write()?;
    let out = f(&mut *tx)?;
    tx.commit()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_range() {
        let r = path_range("/coinbase/filled");
        assert_eq!(r.begin, "/coinbase/filled/");
        assert_eq!(r.end, "/coinbase/filled0");
        assert!(r.contains("/coinbase/filled/2024-01-01/00"));
        assert!(!r.contains("/coinbase/filled-old/x"));
        assert!(!r.contains("/coinbase/filled"));
        assert_eq!(path_range("/a/"), path_range("/a"));
    }

    #[test]
    fn test_empty_range() {
        assert!(KeyRange::new("b", "a").is_empty());
        assert!(!KeyRange::all().is_empty());
        assert!(KeyRange::all().contains("anything"));
    }
}
