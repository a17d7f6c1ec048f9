//! Error types for the storage layer

use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// A value could not be decoded
    #[error("failed to decode value at {key}: {source}")]
    Decode {
        /// Key holding the undecodable value
        key: String,
        /// Underlying codec error
        source: bincode::Error,
    },

    /// A value could not be encoded
    #[error("failed to encode value for {key}: {source}")]
    Encode {
        /// Key the value was destined for
        key: String,
        /// Underlying codec error
        source: bincode::Error,
    },

    /// Write-ahead log failure; the transaction was not applied
    #[error("write-ahead log error: {0}")]
    Wal(#[from] anyhow::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
