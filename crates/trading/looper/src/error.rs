//! Looper error types

use common::{CancelCause, Qty};
use exchange::ExchangeError;
use storage::StorageError;
use thiserror::Error;

/// Errors returned by legs and loopers
#[derive(Error, Debug)]
pub enum LooperError {
    /// Configuration rejected at construction
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What is wrong
        reason: String,
    },

    /// No persisted state under the id
    #[error("not found: {uid}")]
    NotFound {
        /// The missing id
        uid: String,
    },

    /// Exchange failure; see [`ExchangeError::is_retryable`]
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// Persisting or loading state failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Bought minus sold went below zero; the looper stopped trading
    #[error("looper {uid} holds negative size {holdings}")]
    NegativeHoldings {
        /// Looper id
        uid: String,
        /// Bought minus sold
        holdings: Qty,
    },

    /// Cancelled from above
    #[error("cancelled: {0}")]
    Cancelled(CancelCause),
}

impl From<CancelCause> for LooperError {
    fn from(cause: CancelCause) -> Self {
        Self::Cancelled(cause)
    }
}

/// Result alias for looper operations
pub type LooperResult<T> = Result<T, LooperError>;
