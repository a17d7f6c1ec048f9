//! Exchange access for the ladder engine
//!
//! - [`ExchangeApi`]: raw transport seam to one exchange
//! - [`Client`] / [`ClientProduct`]: order tracking, idempotent submission
//!   and price watching on top of any [`ExchangeApi`]
//! - [`Product`]: the per-product capability the engine trades through
//! - [`Datastore`]: hour-bucketed storage of filled orders and candles
//! - [`PaperExchange`]: in-process exchange for dry runs and tests

#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod api;
pub mod client;
pub mod datastore;
pub mod error;
pub mod paper;
pub mod product;
pub mod submitter;
pub mod watcher;

pub use api::{CancelOrderResponse, CreateOrderRequest, CreateOrderResponse, ExchangeApi, ProductInfo};
pub use client::{Client, ClientOptions, ClientProduct};
pub use datastore::Datastore;
pub use error::{DatastoreError, DatastoreResult, ExchangeError, ExchangeResult};
pub use paper::{PaperConfig, PaperExchange, PaperProductConfig};
pub use product::Product;
pub use submitter::Submitter;
pub use watcher::{CandleBuilder, Watcher, WatcherOptions};
