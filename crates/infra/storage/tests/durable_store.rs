//! Integration tests for the WAL-backed key-value store

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use storage::{Database, KeyRange, MemDb, StorageError, kvutil, path_range, with_read_writer, with_reader};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Record {
    id: u64,
    name: String,
}

fn record(id: u64) -> Record {
    Record { id, name: format!("record-{id}") }
}

fn dump(db: &MemDb) -> Result<Vec<(String, Vec<u8>)>> {
    Ok(with_reader(db, |r| Ok::<_, StorageError>(r.ascend(&KeyRange::all())?.collect()))?)
}

#[test]
fn test_reopen_replays_committed_transactions() -> Result<()> {
    let temp_dir = TempDir::new()?;

    let before = {
        let db = MemDb::open(temp_dir.path())?;
        for i in 0..500u64 {
            with_read_writer(&db, |tx| {
                kvutil::set(tx, &format!("/records/{i:06}"), &record(i))?;
                if i % 7 == 0 {
                    tx.delete(&format!("/records/{:06}", i / 2))?;
                }
                Ok::<_, StorageError>(())
            })?;
        }
        dump(&db)?
    };

    let first = MemDb::open(temp_dir.path())?;
    assert_eq!(dump(&first)?, before);
    drop(first);

    let second = MemDb::open(temp_dir.path())?;
    assert_eq!(dump(&second)?, before);
    Ok(())
}

#[test]
fn test_crash_without_close_keeps_committed_data() -> Result<()> {
    let temp_dir = TempDir::new()?;
    {
        let db = MemDb::open(temp_dir.path())?;
        for i in 0..100u64 {
            kvutil::set_db(&db, &format!("/r/{i:03}"), &record(i))?;
        }
        // Skip the orderly segment close a normal drop would perform.
        std::mem::forget(db);
    }

    let db = MemDb::open(temp_dir.path())?;
    let all: Vec<(String, Record)> = with_reader(&db, |r| kvutil::list_dir(r, "/r"))?;
    assert_eq!(all.len(), 100);
    assert_eq!(all[42].1, record(42));
    Ok(())
}

#[test]
fn test_failed_transaction_is_not_persisted() -> Result<()> {
    let temp_dir = TempDir::new()?;
    {
        let db = MemDb::open(temp_dir.path())?;
        kvutil::set_db(&db, "/keep", &record(1))?;
        let res: Result<(), StorageError> = with_read_writer(&db, |tx| {
            kvutil::set(tx, "/lost", &record(2))?;
            Err(StorageError::Wal(anyhow::anyhow!("abort")))
        });
        assert!(res.is_err());
    }

    let db = MemDb::open(temp_dir.path())?;
    assert_eq!(kvutil::get_db::<Record>(&db, "/keep")?, Some(record(1)));
    assert_eq!(kvutil::get_db::<Record>(&db, "/lost")?, None);
    Ok(())
}

#[test]
fn test_checkpoint_compacts_log() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let expected = {
        let db = MemDb::open(temp_dir.path())?;
        for i in 0..50u64 {
            kvutil::set_db(&db, "/counter", &i)?;
        }
        db.checkpoint()?;
        kvutil::set_db(&db, "/after", &record(7))?;
        let stats = db.wal_stats()?.ok_or_else(|| anyhow::anyhow!("durable store has stats"))?;
        assert_eq!(stats.segment_count, 1);
        dump(&db)?
    };

    let db = MemDb::open(temp_dir.path())?;
    assert_eq!(dump(&db)?, expected);
    assert_eq!(kvutil::get_db::<u64>(&db, "/counter")?, Some(49));
    Ok(())
}

#[test]
fn test_decode_error_names_key() -> Result<()> {
    let db = MemDb::new();
    with_read_writer(&db, |tx| tx.set("/bad/value", vec![1]))?;
    let err = kvutil::get_db::<Record>(&db, "/bad/value").err().map(|e| e.to_string()).unwrap_or_default();
    assert!(err.contains("/bad/value"), "{err}");
    Ok(())
}

#[test]
fn test_concurrent_writers() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let db = Arc::new(MemDb::open(temp_dir.path())?);

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || -> Result<(), StorageError> {
                for i in 0..100u64 {
                    kvutil::set_db(db.as_ref(), &format!("/t{t}/{i:03}"), &record(i))?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().map_err(|_| anyhow::anyhow!("writer thread panicked"))??;
    }
    drop(db);

    let db = MemDb::open(temp_dir.path())?;
    for t in 0..4u64 {
        let n = with_reader(&db, |r| Ok::<_, StorageError>(r.ascend(&path_range(&format!("/t{t}")))?.count()))?;
        assert_eq!(n, 100);
    }
    let db: &dyn Database = &db;
    assert!(kvutil::get_db::<Record>(db, "/t0/000")?.is_some());
    Ok(())
}
