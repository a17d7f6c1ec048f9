//! Per-product trading capability used by the ladder engine

use crate::error::ExchangeResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ClientOrderId, Order, OrderId, Px, Qty, Ticker};

/// Trading operations on one product of one exchange
#[async_trait]
pub trait Product: Send + Sync {
    /// Product id, e.g. `BTC-USD`
    fn product_id(&self) -> &str;

    /// Name of the exchange listing the product
    fn exchange_name(&self) -> &str;

    /// Smallest accepted order size
    fn base_min_size(&self) -> Qty;

    /// Place a limit buy. Repeating a call with the same `client_id` never
    /// creates a second order.
    ///
    /// # Errors
    /// Validation errors for sizes outside the product limits, exchange
    /// rejections and transport failures.
    async fn limit_buy(&self, client_id: &ClientOrderId, size: Qty, price: Px) -> ExchangeResult<OrderId>;

    /// Place a limit sell; see [`Product::limit_buy`]
    ///
    /// # Errors
    /// Same as [`Product::limit_buy`].
    async fn limit_sell(&self, client_id: &ClientOrderId, size: Qty, price: Px) -> ExchangeResult<OrderId>;

    /// Cancel an order
    ///
    /// # Errors
    /// Exchange rejections and transport failures.
    async fn cancel(&self, order_id: &OrderId) -> ExchangeResult<()>;

    /// Current view of an order
    ///
    /// # Errors
    /// Unknown orders and transport failures.
    async fn get(&self, order_id: &OrderId) -> ExchangeResult<Order>;

    /// Open orders of this product
    ///
    /// # Errors
    /// Transport failures.
    async fn list(&self) -> ExchangeResult<Vec<Order>>;

    /// Orders of this product in any status, created or filled at or after
    /// `since`. Done orders are included, so a submission whose
    /// acknowledgement was lost can be found after it filled.
    ///
    /// # Errors
    /// Transport failures.
    async fn list_since(&self, since: Option<DateTime<Utc>>) -> ExchangeResult<Vec<Order>>;

    /// Subscribe to prices; the latest known price is delivered first.
    /// Dropping the receiver ends the subscription.
    ///
    /// # Errors
    /// Fails once the product is closed.
    fn ticker_stream(&self) -> ExchangeResult<bus::Receiver<Ticker>>;

    /// Subscribe to updates of one order, `None` when the order is not
    /// known to this process
    fn order_updates(&self, order_id: &OrderId) -> Option<bus::Receiver<Order>>;
}
