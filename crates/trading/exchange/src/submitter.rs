//! Idempotent limit order submission
//!
//! The submitter remembers which client ids the exchange has already
//! acknowledged (directly, or through the order feed) for a short while. A
//! retried submission with a remembered client id returns the known order id
//! without touching the network.

use crate::api::{CreateOrderRequest, ExchangeApi, ProductInfo};
use crate::error::{ExchangeError, ExchangeResult};
use common::{ClientOrderId, OrderId, Px, Qty, Side};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Client-id keyed cache of acknowledged submissions
pub struct Submitter {
    ttl: Duration,
    acked: Mutex<FxHashMap<ClientOrderId, (OrderId, Instant)>>,
}

impl Submitter {
    /// Create a submitter remembering acknowledgements for `ttl`
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, acked: Mutex::new(FxHashMap::default()) }
    }

    /// Remember that `client_id` was acknowledged as `order_id`
    pub fn record(&self, client_id: &ClientOrderId, order_id: &OrderId) {
        let mut acked = self.acked.lock();
        let now = Instant::now();
        acked.retain(|_, (_, at)| now.duration_since(*at) < self.ttl);
        acked.insert(client_id.clone(), (order_id.clone(), now));
    }

    /// Order id previously acknowledged for `client_id`, if still cached
    #[must_use]
    pub fn lookup(&self, client_id: &ClientOrderId) -> Option<OrderId> {
        let acked = self.acked.lock();
        acked
            .get(client_id)
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(id, _)| id.clone())
    }

    /// Submit a limit order at most once per client id
    ///
    /// # Errors
    /// [`ExchangeError::InvalidSize`] without a network call when `size` is
    /// outside the product limits; [`ExchangeError::Rejected`] carrying the
    /// exchange's reason when it refuses the order; transport errors from
    /// the adapter unchanged.
    pub async fn submit(
        &self,
        api: &dyn ExchangeApi,
        info: &ProductInfo,
        client_id: &ClientOrderId,
        side: Side,
        size: Qty,
        price: Px,
    ) -> ExchangeResult<OrderId> {
        if size < info.base_min_size || size > info.base_max_size {
            return Err(ExchangeError::InvalidSize {
                size,
                min: info.base_min_size,
                max: info.base_max_size,
            });
        }

        if let Some(order_id) = self.lookup(client_id) {
            debug!(%client_id, %order_id, "reusing acknowledged submission");
            return Ok(order_id);
        }

        let request = CreateOrderRequest {
            client_order_id: client_id.clone(),
            product_id: info.product_id.clone(),
            side,
            size,
            price,
        };
        let response = api.create_order(request).await?;
        if !response.success {
            let reason = response.failure_reason.unwrap_or_default();
            warn!(%client_id, %reason, "create order was rejected");
            return Err(ExchangeError::Rejected { reason });
        }
        let order_id = response.order_id.ok_or_else(|| ExchangeError::Rejected {
            reason: "accepted without an order id".to_string(),
        })?;

        self.record(client_id, &order_id);
        info!(%client_id, %order_id, %side, %size, %price, "created limit order");
        Ok(order_id)
    }
}
