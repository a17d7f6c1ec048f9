//! Error types for exchange access and fill storage

use common::{OrderId, Qty};
use storage::StorageError;
use thiserror::Error;

/// Errors returned by exchange products and adapters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// Order size outside the product's limits; nothing was sent
    #[error("order size {size} outside [{min}, {max}]")]
    InvalidSize {
        /// Requested size
        size: Qty,
        /// Product minimum
        min: Qty,
        /// Product maximum
        max: Qty,
    },

    /// The exchange refused the request
    #[error("rejected by exchange: {reason}")]
    Rejected {
        /// Failure reason reported by the exchange, verbatim
        reason: String,
    },

    /// Network or transport failure; the request may or may not have
    /// reached the exchange
    #[error("transport error: {0}")]
    Transport(String),

    /// The exchange does not know the order
    #[error("order not found: {order_id}")]
    OrderNotFound {
        /// The unknown order id
        order_id: OrderId,
    },

    /// The exchange does not list the product
    #[error("unknown product: {product_id}")]
    UnknownProduct {
        /// The unknown product id
        product_id: String,
    },

    /// The product or client was closed
    #[error("closed")]
    Closed,
}

impl ExchangeError {
    /// Whether retrying the same request later can succeed
    ///
    /// Only transport failures qualify; validation errors and exchange
    /// rejections are final.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result alias for exchange operations
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Errors returned by the [`Datastore`](crate::Datastore)
#[derive(Error, Debug)]
pub enum DatastoreError {
    /// Underlying key-value failure, including undecodable buckets
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A bucket key does not carry a `YYYY-MM-DD/HH` suffix
    #[error("malformed bucket key {key}")]
    BadKey {
        /// The offending key
        key: String,
    },
}

/// Result alias for datastore operations
pub type DatastoreResult<T> = Result<T, DatastoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_taxonomy() {
        assert!(ExchangeError::Transport("timeout".into()).is_retryable());
        assert!(!ExchangeError::Rejected { reason: "INSUFFICIENT_FUND".into() }.is_retryable());
        assert!(
            !ExchangeError::InvalidSize { size: Qty::ZERO, min: Qty::new(1.0), max: Qty::new(2.0) }
                .is_retryable()
        );
    }
}
