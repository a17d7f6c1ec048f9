//! Common types and utilities for the ladder trading bot

#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod cancel;
pub mod market;
pub mod order;
pub mod types;

pub use cancel::{CancelCause, CancelScope};
pub use market::{Candle, Point, Ticker};
pub use order::{ClientOrderId, Order, OrderId, OrderStatus};
pub use types::*;
