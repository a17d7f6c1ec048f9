//! Typed helpers over the key-value capability
//!
//! Values are encoded with bincode. Decode failures name the offending key.

use crate::error::{StorageError, StorageResult};
use crate::kv::{Database, KeyRange, Reader, Writer, with_read_writer, with_reader};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Decode a value read from `key`
///
/// # Errors
/// Returns [`StorageError::Decode`] naming `key` when the bytes do not decode.
pub fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> StorageResult<T> {
    bincode::deserialize(bytes).map_err(|source| StorageError::Decode { key: key.to_string(), source })
}

/// Encode a value destined for `key`
///
/// # Errors
/// Returns [`StorageError::Encode`] naming `key` when the value does not encode.
pub fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> StorageResult<Vec<u8>> {
    bincode::serialize(value).map_err(|source| StorageError::Encode { key: key.to_string(), source })
}

/// Read and decode the value at `key`
///
/// # Errors
/// Returns an error if the read fails or the value does not decode.
pub fn get<T: DeserializeOwned, R: Reader + ?Sized>(r: &R, key: &str) -> StorageResult<Option<T>> {
    match r.get(key)? {
        Some(bytes) => decode(key, &bytes).map(Some),
        None => Ok(None),
    }
}

/// Encode and store `value` at `key`
///
/// # Errors
/// Returns an error if the value does not encode or the write fails.
pub fn set<T: Serialize + ?Sized, W: Writer + ?Sized>(w: &mut W, key: &str, value: &T) -> StorageResult<()> {
    let bytes = encode(key, value)?;
    w.set(key, bytes)
}

/// [`get`] in its own read transaction
///
/// # Errors
/// Returns an error if the read fails or the value does not decode.
pub fn get_db<T: DeserializeOwned>(db: &dyn Database, key: &str) -> StorageResult<Option<T>> {
    with_reader(db, |r| get(r, key))
}

/// [`set`] in its own committed read-write transaction
///
/// # Errors
/// Returns an error if encoding, writing or committing fails.
pub fn set_db<T: Serialize + ?Sized>(db: &dyn Database, key: &str, value: &T) -> StorageResult<()> {
    with_read_writer(db, |tx| set(tx, key, value))
}

/// Decode every value in `range` in ascending key order and hand it to `f`
///
/// An error from `f` stops the scan and is returned.
///
/// # Errors
/// Returns decode errors and errors from `f`.
pub fn ascend<T, R, E, F>(r: &R, range: &KeyRange, mut f: F) -> Result<(), E>
where
    T: DeserializeOwned,
    R: Reader + ?Sized,
    E: From<StorageError>,
    F: FnMut(&str, T) -> Result<(), E>,
{
    for (key, bytes) in r.ascend(range)? {
        let value = decode(&key, &bytes)?;
        f(&key, value)?;
    }
    Ok(())
}

/// Descending counterpart of [`ascend`]
///
/// # Errors
/// Returns decode errors and errors from `f`.
pub fn descend<T, R, E, F>(r: &R, range: &KeyRange, mut f: F) -> Result<(), E>
where
    T: DeserializeOwned,
    R: Reader + ?Sized,
    E: From<StorageError>,
    F: FnMut(&str, T) -> Result<(), E>,
{
    for (key, bytes) in r.descend(range)? {
        let value = decode(&key, &bytes)?;
        f(&key, value)?;
    }
    Ok(())
}

/// Collect every key and decoded value under the directory `dir`
///
/// # Errors
/// Returns read and decode errors.
pub fn list_dir<T: DeserializeOwned, R: Reader + ?Sized>(r: &R, dir: &str) -> StorageResult<Vec<(String, T)>> {
    let mut out = Vec::new();
    ascend(r, &crate::kv::path_range(dir), |key, value| {
        out.push((key.to_string(), value));
        Ok::<_, StorageError>(())
    })?;
    Ok(out)
}
