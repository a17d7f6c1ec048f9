//! Ordered in-memory key-value engine with WAL durability
//!
//! [`MemDb`] keeps the whole key space in a `BTreeMap`. A read-write
//! transaction holds the map's write lock for its lifetime and stages its
//! writes; on commit the staged batch is appended to the write-ahead log and
//! fsynced before it touches the map. A batch that fails to sync is cut from
//! the log, so it is neither applied nor replayed. Reopening a directory
//! replays the log.

use crate::error::StorageResult;
use crate::kv::{Database, KeyRange, KvIter, Reader, Transaction, Writer};
use crate::wal::{Wal, WalEntry, WalStats};
use common::Ts;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

type Map = BTreeMap<String, Vec<u8>>;

/// One mutation inside a committed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Op {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// A committed transaction as written to the log
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Batch {
    seq: u64,
    ts: Ts,
    /// Replaces the whole key space when set
    snapshot: bool,
    ops: Vec<Op>,
}

impl WalEntry for Batch {
    fn timestamp(&self) -> Ts {
        self.ts
    }
}

impl Batch {
    fn apply(self, map: &mut Map) {
        if self.snapshot {
            map.clear();
        }
        for op in self.ops {
            match op {
                Op::Put { key, value } => {
                    map.insert(key, value);
                }
                Op::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
    }
}

/// In-memory ordered store, optionally backed by a write-ahead log
pub struct MemDb {
    map: RwLock<Map>,
    wal: Option<Mutex<Wal>>,
    seq: AtomicU64,
}

impl Default for MemDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemDb {
    /// Volatile store; nothing survives the process
    #[must_use]
    pub fn new() -> Self {
        Self { map: RwLock::new(Map::new()), wal: None, seq: AtomicU64::new(0) }
    }

    /// Open a durable store in `dir`, replaying its log
    ///
    /// # Errors
    /// Returns an error if the directory or a log segment cannot be read.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        let wal = Wal::new(dir, None)?;
        let mut map = Map::new();
        let mut seq = 0;
        let mut batches = 0u64;

        let mut iter = wal.stream::<Batch>(None)?;
        while let Some(batch) = iter.read_next_entry()? {
            seq = seq.max(batch.seq);
            batches += 1;
            batch.apply(&mut map);
        }

        info!(dir = %dir.display(), batches, keys = map.len(), "opened store");
        Ok(Self { map: RwLock::new(map), wal: Some(Mutex::new(wal)), seq: AtomicU64::new(seq) })
    }

    /// Rewrite the log as a single snapshot of the current contents
    ///
    /// Older segments are removed once the snapshot is durable.
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be written; the older segments
    /// are kept in that case.
    pub fn checkpoint(&self) -> StorageResult<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        let map = self.map.write();
        let mut wal = wal.lock();

        let batch = Batch {
            seq: self.seq.load(Ordering::Acquire),
            ts: Ts::now(),
            snapshot: true,
            ops: map
                .iter()
                .map(|(key, value)| Op::Put { key: key.clone(), value: value.clone() })
                .collect(),
        };
        let segment = wal.rotate()?;
        wal.commit(&batch)?;
        let removed = wal.remove_before(segment)?;

        info!(keys = map.len(), removed, "checkpointed store");
        Ok(())
    }

    /// Log statistics, `None` for a volatile store
    ///
    /// # Errors
    /// Returns an error if the log directory cannot be read.
    pub fn wal_stats(&self) -> StorageResult<Option<WalStats>> {
        match &self.wal {
            Some(wal) => Ok(Some(wal.lock().stats()?)),
            None => Ok(None),
        }
    }

    /// Number of keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Check if the store holds no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

fn scan<'a>(map: &'a Map, range: &KeyRange) -> impl DoubleEndedIterator<Item = (String, Vec<u8>)> + use<'a> {
    let iter = if range.is_empty() { None } else { Some(map.range::<str, _>(range.bounds())) };
    iter.into_iter().flatten().map(|(k, v)| (k.clone(), v.clone()))
}

struct ReadTx<'a> {
    map: RwLockReadGuard<'a, Map>,
}

impl Reader for ReadTx<'_> {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn ascend(&self, range: &KeyRange) -> StorageResult<KvIter<'_>> {
        Ok(Box::new(scan(&self.map, range)))
    }

    fn descend(&self, range: &KeyRange) -> StorageResult<KvIter<'_>> {
        Ok(Box::new(scan(&self.map, range).rev()))
    }
}

struct WriteTx<'a> {
    db: &'a MemDb,
    map: RwLockWriteGuard<'a, Map>,
    staged: BTreeMap<String, Option<Vec<u8>>>,
}

impl WriteTx<'_> {
    /// Committed contents overlaid with staged writes, in key order
    fn merged(&self, range: &KeyRange) -> Vec<(String, Vec<u8>)> {
        let mut view: BTreeMap<String, Vec<u8>> = scan(&self.map, range).collect();
        for (key, value) in &self.staged {
            if !range.contains(key) {
                continue;
            }
            match value {
                Some(v) => {
                    view.insert(key.clone(), v.clone());
                }
                None => {
                    view.remove(key);
                }
            }
        }
        view.into_iter().collect()
    }
}

impl Reader for WriteTx<'_> {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        match self.staged.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => Ok(self.map.get(key).cloned()),
        }
    }

    fn ascend(&self, range: &KeyRange) -> StorageResult<KvIter<'_>> {
        Ok(Box::new(self.merged(range).into_iter()))
    }

    fn descend(&self, range: &KeyRange) -> StorageResult<KvIter<'_>> {
        Ok(Box::new(self.merged(range).into_iter().rev()))
    }
}

impl Writer for WriteTx<'_> {
    fn set(&mut self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.staged.insert(key.to_string(), Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> StorageResult<()> {
        self.staged.insert(key.to_string(), None);
        Ok(())
    }
}

impl Transaction for WriteTx<'_> {
    fn commit(self: Box<Self>) -> StorageResult<()> {
        let WriteTx { db, mut map, staged } = *self;
        if staged.is_empty() {
            return Ok(());
        }

        let batch = Batch {
            seq: db.seq.load(Ordering::Acquire) + 1,
            ts: Ts::now(),
            snapshot: false,
            ops: staged
                .into_iter()
                .map(|(key, value)| match value {
                    Some(value) => Op::Put { key, value },
                    None => Op::Delete { key },
                })
                .collect(),
        };

        if let Some(wal) = &db.wal {
            wal.lock().commit(&batch)?;
        }

        let seq = batch.seq;
        let ops = batch.ops.len();
        batch.apply(&mut map);
        db.seq.store(seq, Ordering::Release);
        debug!(seq, ops, "committed batch");
        Ok(())
    }
}

impl Database for MemDb {
    fn begin_read(&self) -> StorageResult<Box<dyn Reader + '_>> {
        Ok(Box::new(ReadTx { map: self.map.read() }))
    }

    fn begin_write(&self) -> StorageResult<Box<dyn Transaction + '_>> {
        Ok(Box::new(WriteTx { db: self, map: self.map.write(), staged: BTreeMap::new() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::kv::{path_range, with_read_writer, with_reader};

    fn keys(db: &MemDb, range: &KeyRange) -> Vec<String> {
        with_reader(db, |r| Ok::<_, StorageError>(r.ascend(range)?.map(|(k, _)| k).collect()))
            .unwrap()
    }

    #[test]
    fn test_uncommitted_writes_are_discarded() {
        let db = MemDb::new();
        {
            let mut tx = db.begin_write().unwrap();
            tx.set("/a", b"1".to_vec()).unwrap();
            assert_eq!(tx.get("/a").unwrap(), Some(b"1".to_vec()));
        }
        assert!(db.is_empty());
    }

    #[test]
    fn test_write_tx_sees_own_writes_in_scans() {
        let db = MemDb::new();
        with_read_writer(&db, |tx| {
            tx.set("/d/1", vec![1])?;
            tx.set("/d/3", vec![3])?;
            Ok::<_, StorageError>(())
        })
        .unwrap();

        with_read_writer(&db, |tx| {
            tx.set("/d/2", vec![2])?;
            tx.delete("/d/3")?;
            let seen: Vec<String> = tx.ascend(&path_range("/d"))?.map(|(k, _)| k).collect();
            assert_eq!(seen, vec!["/d/1", "/d/2"]);
            let last: Vec<String> = tx.descend(&path_range("/d"))?.take(1).map(|(k, _)| k).collect();
            assert_eq!(last, vec!["/d/2"]);
            Ok::<_, StorageError>(())
        })
        .unwrap();

        assert_eq!(keys(&db, &path_range("/d")), vec!["/d/1", "/d/2"]);
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let db = MemDb::new();
        with_read_writer(&db, |tx| tx.set("/k", vec![0])).unwrap();
        assert!(keys(&db, &KeyRange::new("/z", "/a")).is_empty());
    }

    #[test]
    fn test_failed_commit_is_neither_applied_nor_replayed() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = MemDb::open(dir.path()).unwrap();
            with_read_writer(&db, |tx| tx.set("/a", vec![1])).unwrap();

            if let Some(wal) = &db.wal {
                wal.lock().fail_next_flush = true;
            }
            assert!(with_read_writer(&db, |tx| tx.set("/b", vec![2])).is_err());
            assert_eq!(keys(&db, &path_range("/")), vec!["/a"]);

            with_read_writer(&db, |tx| tx.set("/c", vec![3])).unwrap();
        }

        let db = MemDb::open(dir.path()).unwrap();
        assert_eq!(keys(&db, &path_range("/")), vec!["/a", "/c"]);
    }
}
