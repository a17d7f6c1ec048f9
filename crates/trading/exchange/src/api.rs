//! Transport seam to a concrete exchange
//!
//! An [`ExchangeApi`] speaks to one exchange: REST-like request/response
//! calls plus streaming ticker and order feeds. Everything above it
//! (idempotent submission, order fan-out, candle capture) lives in
//! [`Client`](crate::Client) and is shared by every adapter.

use crate::error::ExchangeResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ClientOrderId, Order, OrderId, Px, Qty, Side, Ticker};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Static product limits and the latest price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    /// Product id, e.g. `BTC-USD`
    pub product_id: String,
    /// Smallest accepted order size
    pub base_min_size: Qty,
    /// Largest accepted order size
    pub base_max_size: Qty,
    /// Last traded price
    pub price: Px,
}

/// Limit order creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOrderRequest {
    /// Client id making the request replay-safe
    pub client_order_id: ClientOrderId,
    /// Product to trade
    pub product_id: String,
    /// Side
    pub side: Side,
    /// Base size
    pub size: Qty,
    /// Limit price
    pub price: Px,
}

/// Exchange answer to a create request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOrderResponse {
    /// Whether the order was accepted
    pub success: bool,
    /// Server id of the accepted order
    pub order_id: Option<OrderId>,
    /// Reason for a refusal
    pub failure_reason: Option<String>,
}

/// Exchange answer to a cancel request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOrderResponse {
    /// Whether the cancel was accepted
    pub success: bool,
    /// Reason for a refusal
    pub failure_reason: Option<String>,
}

/// Raw exchange transport
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Exchange name, used as the storage keyspace
    fn name(&self) -> &str;

    /// Limits and price of one product
    async fn product_info(&self, product_id: &str) -> ExchangeResult<ProductInfo>;

    /// Create a limit order
    async fn create_order(&self, request: CreateOrderRequest) -> ExchangeResult<CreateOrderResponse>;

    /// Cancel an order
    async fn cancel_order(&self, order_id: &OrderId) -> ExchangeResult<CancelOrderResponse>;

    /// Current view of one order
    async fn get_order(&self, order_id: &OrderId) -> ExchangeResult<Order>;

    /// Open orders of a product
    async fn list_open_orders(&self, product_id: &str) -> ExchangeResult<Vec<Order>>;

    /// Orders of any status, optionally of one product, created or filled
    /// at or after `since`; every order when `since` is `None`
    async fn list_orders(&self, product_id: Option<&str>, since: Option<DateTime<Utc>>) -> ExchangeResult<Vec<Order>>;

    /// Live ticker feed for a product; ends when the connection drops
    async fn subscribe_tickers(&self, product_id: &str) -> ExchangeResult<mpsc::UnboundedReceiver<Ticker>>;

    /// Live feed of order changes for the account; ends when the
    /// connection drops
    async fn subscribe_orders(&self) -> ExchangeResult<mpsc::UnboundedReceiver<Order>>;
}
