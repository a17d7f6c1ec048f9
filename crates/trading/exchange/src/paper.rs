//! In-process paper exchange
//!
//! Keeps resting limit orders per product and fills them at their limit
//! price when the product price crosses. Prices move through
//! [`PaperExchange::set_price`] or the random walk driver. Fault knobs let
//! tests drop acknowledgements, reject or fail creates, and cut the feeds.

use crate::api::{CancelOrderResponse, CreateOrderRequest, CreateOrderResponse, ExchangeApi, ProductInfo};
use crate::error::{ExchangeError, ExchangeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CancelScope, Order, OrderId, OrderStatus, Px, Qty, Side, Ticker};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One listed product
#[derive(Debug, Clone)]
pub struct PaperProductConfig {
    /// Product id
    pub product_id: String,
    /// Smallest accepted size
    pub base_min_size: Qty,
    /// Largest accepted size
    pub base_max_size: Qty,
    /// Opening price
    pub price: Px,
}

/// Paper exchange settings
#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Exchange name and storage keyspace
    pub name: String,
    /// Fee charged on every fill, in basis points of the notional
    pub fee_bps: i64,
    /// Listed products
    pub products: Vec<PaperProductConfig>,
    /// Largest relative price move per random walk step
    pub volatility: f64,
    /// Random walk step interval
    pub tick_interval: Duration,
    /// Random walk seed, entropy when unset
    pub seed: Option<u64>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            name: "paper".to_string(),
            fee_bps: 0,
            products: Vec::new(),
            volatility: 0.002,
            tick_interval: Duration::from_secs(1),
            seed: None,
        }
    }
}

struct Market {
    info: ProductInfo,
    feeds: Vec<mpsc::UnboundedSender<Ticker>>,
}

struct Resting {
    order: Order,
    size: Qty,
    limit: Px,
}

#[derive(Default)]
struct Faults {
    reject_next: Option<String>,
    drop_next_ack: bool,
    fail_creates: usize,
    partial_fill: Option<Qty>,
}

#[derive(Default)]
struct State {
    markets: FxHashMap<String, Market>,
    orders: FxHashMap<OrderId, Resting>,
    order_feeds: Vec<mpsc::UnboundedSender<Order>>,
    next_id: u64,
    created: usize,
    faults: Faults,
}

impl State {
    fn publish_order(&mut self, order: &Order) {
        self.order_feeds.retain(|tx| tx.send(order.clone()).is_ok());
    }
}

/// Simulated exchange implementing [`ExchangeApi`]
pub struct PaperExchange {
    name: String,
    fee_bps: i64,
    volatility: f64,
    tick_interval: Duration,
    seed: Option<u64>,
    state: Mutex<State>,
}

impl PaperExchange {
    /// Create an exchange listing `config.products`
    #[must_use]
    pub fn new(config: PaperConfig) -> Self {
        let mut state = State::default();
        for p in config.products {
            let info = ProductInfo {
                product_id: p.product_id.clone(),
                base_min_size: p.base_min_size,
                base_max_size: p.base_max_size,
                price: p.price,
            };
            state.markets.insert(p.product_id, Market { info, feeds: Vec::new() });
        }
        Self {
            name: config.name,
            fee_bps: config.fee_bps,
            volatility: config.volatility,
            tick_interval: config.tick_interval,
            seed: config.seed,
            state: Mutex::new(state),
        }
    }

    /// Move the price of `product_id`, publish a ticker and fill crossed
    /// orders at their limit price
    pub fn set_price(&self, product_id: &str, price: Px) {
        let mut state = self.state.lock();
        let Some(market) = state.markets.get_mut(product_id) else {
            return;
        };
        market.info.price = price;
        let ticker = Ticker { price, last_size: Qty::ZERO, timestamp: Utc::now() };
        market.feeds.retain(|tx| tx.send(ticker).is_ok());
        self.match_orders(&mut state, product_id, price);
    }

    fn match_orders(&self, state: &mut State, product_id: &str, price: Px) {
        let partial = state.faults.partial_fill;
        let mut updates = Vec::new();
        for resting in state.orders.values_mut() {
            let order = &mut resting.order;
            if order.product_id != product_id || order.is_terminal() {
                continue;
            }
            let crossed = match order.side {
                Some(Side::Buy) => price <= resting.limit,
                Some(Side::Sell) => price >= resting.limit,
                None => false,
            };
            if !crossed {
                continue;
            }
            let remaining = resting.size - order.filled_size;
            let fill = partial.map_or(remaining, |p| p.min(remaining));
            order.filled_size += fill;
            order.filled_price = resting.limit;
            order.fee += resting.limit.notional(fill).bps(self.fee_bps);
            order.last_fill_time = Some(Utc::now());
            if order.filled_size == resting.size {
                order.status = OrderStatus::Filled;
                order.done = true;
                order.done_reason = Some("FILLED".to_string());
            }
            debug!(order_id = %order.order_id, %fill, %price, "paper fill");
            updates.push(order.clone());
        }
        for order in &updates {
            state.publish_order(order);
        }
    }

    /// Reject the next create with `reason`
    pub fn reject_next(&self, reason: &str) {
        self.state.lock().faults.reject_next = Some(reason.to_string());
    }

    /// Accept the next create but report a transport error to the caller
    pub fn drop_next_ack(&self) {
        self.state.lock().faults.drop_next_ack = true;
    }

    /// Fail the next `n` creates with a transport error before they reach
    /// the book
    pub fn fail_next_creates(&self, n: usize) {
        self.state.lock().faults.fail_creates = n;
    }

    /// Cap every fill at `size`, `None` fills completely
    pub fn set_partial_fill(&self, size: Option<Qty>) {
        self.state.lock().faults.partial_fill = size;
    }

    /// End every open ticker and order feed
    pub fn disconnect_feeds(&self) {
        let mut state = self.state.lock();
        state.order_feeds.clear();
        for market in state.markets.values_mut() {
            market.feeds.clear();
        }
    }

    /// Number of orders that reached the book
    #[must_use]
    pub fn orders_created(&self) -> usize {
        self.state.lock().created
    }

    /// Every order ever created, in no particular order
    #[must_use]
    pub fn orders(&self) -> Vec<Order> {
        self.state.lock().orders.values().map(|r| r.order.clone()).collect()
    }

    /// Drive the price of `product_id` by a bounded random walk until
    /// `scope` is cancelled
    pub fn spawn_random_walk(self: &Arc<Self>, product_id: &str, scope: CancelScope) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let product_id = product_id.to_string();
        tokio::spawn(async move {
            let mut rng = this.seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
            let volatility = this.volatility.clamp(0.0001, 0.1);
            let mut interval = tokio::time::interval(this.tick_interval.max(Duration::from_millis(10)));
            info!(product_id, volatility, "random walk started");
            loop {
                if scope.run(interval.tick()).await.is_err() {
                    break;
                }
                let current = {
                    let state = this.state.lock();
                    match state.markets.get(&product_id) {
                        Some(m) => m.info.price.as_f64(),
                        None => break,
                    }
                };
                let step: f64 = rng.gen_range(-volatility..=volatility);
                let next = (current * (1.0 + step)).max(0.0001);
                this.set_price(&product_id, Px::new(next));
            }
            debug!(product_id, "random walk stopped");
        })
    }
}

#[async_trait]
impl ExchangeApi for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn product_info(&self, product_id: &str) -> ExchangeResult<ProductInfo> {
        let state = self.state.lock();
        state
            .markets
            .get(product_id)
            .map(|m| m.info.clone())
            .ok_or_else(|| ExchangeError::UnknownProduct { product_id: product_id.to_string() })
    }

    async fn create_order(&self, request: CreateOrderRequest) -> ExchangeResult<CreateOrderResponse> {
        let mut state = self.state.lock();
        if state.faults.fail_creates > 0 {
            state.faults.fail_creates -= 1;
            return Err(ExchangeError::Transport("connection reset".to_string()));
        }
        if let Some(reason) = state.faults.reject_next.take() {
            return Ok(CreateOrderResponse { success: false, order_id: None, failure_reason: Some(reason) });
        }
        let Some(price) = state.markets.get(&request.product_id).map(|m| m.info.price) else {
            return Ok(CreateOrderResponse {
                success: false,
                order_id: None,
                failure_reason: Some("UNKNOWN_PRODUCT".to_string()),
            });
        };

        // Client ids are unique per account: a repeat returns the first order.
        let repeat = state
            .orders
            .values()
            .find(|r| r.order.client_order_id.as_ref() == Some(&request.client_order_id))
            .map(|r| r.order.order_id.clone());
        if let Some(order_id) = repeat {
            debug!(%order_id, client_id = %request.client_order_id, "repeated client id");
            return Ok(CreateOrderResponse { success: true, order_id: Some(order_id), failure_reason: None });
        }

        state.next_id += 1;
        state.created += 1;
        let order_id = OrderId::new(format!("paper-{:06}", state.next_id));
        let order = Order {
            order_id: order_id.clone(),
            client_order_id: Some(request.client_order_id),
            product_id: request.product_id.clone(),
            side: Some(request.side),
            status: OrderStatus::Open,
            create_time: Some(Utc::now()),
            ..Order::default()
        };
        state.publish_order(&order);
        state.orders.insert(order_id.clone(), Resting { order, size: request.size, limit: request.price });
        self.match_orders(&mut state, &request.product_id, price);

        if std::mem::take(&mut state.faults.drop_next_ack) {
            return Err(ExchangeError::Transport("response lost".to_string()));
        }
        Ok(CreateOrderResponse { success: true, order_id: Some(order_id), failure_reason: None })
    }

    async fn cancel_order(&self, order_id: &OrderId) -> ExchangeResult<CancelOrderResponse> {
        let mut state = self.state.lock();
        let Some(resting) = state.orders.get_mut(order_id) else {
            return Err(ExchangeError::OrderNotFound { order_id: order_id.clone() });
        };
        if resting.order.is_terminal() {
            return Ok(CancelOrderResponse { success: false, failure_reason: Some("ORDER_IS_DONE".to_string()) });
        }
        resting.order.status = OrderStatus::Cancelled;
        resting.order.done = true;
        resting.order.done_reason = Some("CANCELLED".to_string());
        let order = resting.order.clone();
        state.publish_order(&order);
        Ok(CancelOrderResponse { success: true, failure_reason: None })
    }

    async fn get_order(&self, order_id: &OrderId) -> ExchangeResult<Order> {
        let state = self.state.lock();
        state
            .orders
            .get(order_id)
            .map(|r| r.order.clone())
            .ok_or_else(|| ExchangeError::OrderNotFound { order_id: order_id.clone() })
    }

    async fn list_open_orders(&self, product_id: &str) -> ExchangeResult<Vec<Order>> {
        let state = self.state.lock();
        Ok(state
            .orders
            .values()
            .filter(|r| r.order.product_id == product_id && !r.order.is_terminal())
            .map(|r| r.order.clone())
            .collect())
    }

    async fn list_orders(&self, product_id: Option<&str>, since: Option<DateTime<Utc>>) -> ExchangeResult<Vec<Order>> {
        let state = self.state.lock();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .map(|r| &r.order)
            .filter(|o| product_id.is_none_or(|p| o.product_id == p))
            .filter(|o| since.is_none_or(|t| o.last_fill_time.or(o.create_time).is_some_and(|at| at >= t)))
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        Ok(orders)
    }

    async fn subscribe_tickers(&self, product_id: &str) -> ExchangeResult<mpsc::UnboundedReceiver<Ticker>> {
        let mut state = self.state.lock();
        let market = state
            .markets
            .get_mut(product_id)
            .ok_or_else(|| ExchangeError::UnknownProduct { product_id: product_id.to_string() })?;
        let (tx, rx) = mpsc::unbounded_channel();
        market.feeds.push(tx);
        Ok(rx)
    }

    async fn subscribe_orders(&self) -> ExchangeResult<mpsc::UnboundedReceiver<Order>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().order_feeds.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ClientOrderId;

    fn config(fee_bps: i64) -> PaperConfig {
        PaperConfig {
            fee_bps,
            products: vec![PaperProductConfig {
                product_id: "BTC-USD".to_string(),
                base_min_size: Qty::new(0.01),
                base_max_size: Qty::new(10.0),
                price: Px::new(105.0),
            }],
            ..PaperConfig::default()
        }
    }

    fn exchange(fee_bps: i64) -> PaperExchange {
        PaperExchange::new(config(fee_bps))
    }

    fn request(side: Side, price: f64) -> CreateOrderRequest {
        CreateOrderRequest {
            client_order_id: ClientOrderId::new("c-1"),
            product_id: "BTC-USD".to_string(),
            side,
            size: Qty::new(2.0),
            price: Px::new(price),
        }
    }

    #[tokio::test]
    async fn test_buy_fills_when_price_crosses() {
        let ex = exchange(10);
        let mut feed = ex.subscribe_orders().await.unwrap();
        let id = ex.create_order(request(Side::Buy, 100.0)).await.unwrap().order_id.unwrap();
        assert_eq!(feed.recv().await.unwrap().status, OrderStatus::Open);

        ex.set_price("BTC-USD", Px::new(101.0));
        assert!(feed.try_recv().is_err());

        ex.set_price("BTC-USD", Px::new(99.0));
        let filled = feed.recv().await.unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(filled.filled_size, Qty::new(2.0));
        assert_eq!(filled.filled_price, Px::new(100.0));
        assert_eq!(filled.fee, Px::new(100.0).notional(Qty::new(2.0)).bps(10));
        assert_eq!(ex.get_order(&id).await.unwrap(), filled);
        assert!(ex.list_open_orders("BTC-USD").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_fills_accumulate() {
        let ex = exchange(0);
        ex.set_partial_fill(Some(Qty::new(0.5)));
        let id = ex.create_order(request(Side::Sell, 110.0)).await.unwrap().order_id.unwrap();

        ex.set_price("BTC-USD", Px::new(110.0));
        let order = ex.get_order(&id).await.unwrap();
        assert_eq!(order.filled_size, Qty::new(0.5));
        assert!(!order.is_terminal());

        ex.set_partial_fill(None);
        ex.set_price("BTC-USD", Px::new(111.0));
        assert_eq!(ex.get_order(&id).await.unwrap().status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_dropped_ack_still_creates() {
        let ex = exchange(0);
        ex.drop_next_ack();
        let err = ex.create_order(request(Side::Buy, 100.0)).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(ex.orders_created(), 1);

        ex.fail_next_creates(1);
        assert!(ex.create_order(request(Side::Buy, 100.0)).await.is_err());
        assert_eq!(ex.orders_created(), 1);
    }

    #[tokio::test]
    async fn test_cancel_done_order_is_refused() {
        let ex = exchange(0);
        let id = ex.create_order(request(Side::Buy, 100.0)).await.unwrap().order_id.unwrap();
        assert!(ex.cancel_order(&id).await.unwrap().success);
        let again = ex.cancel_order(&id).await.unwrap();
        assert!(!again.success);
        assert!(matches!(
            ex.cancel_order(&OrderId::new("nope")).await,
            Err(ExchangeError::OrderNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_repeated_client_id_returns_first_order() {
        let ex = exchange(0);
        let first = ex.create_order(request(Side::Buy, 100.0)).await.unwrap().order_id.unwrap();
        ex.set_price("BTC-USD", Px::new(99.0));
        let again = ex.create_order(request(Side::Buy, 100.0)).await.unwrap();
        assert!(again.success);
        assert_eq!(again.order_id, Some(first));
        assert_eq!(ex.orders_created(), 1);
    }

    #[tokio::test]
    async fn test_list_orders_includes_done_orders() {
        let ex = exchange(0);
        let before = Utc::now();
        let filled = ex.create_order(request(Side::Buy, 110.0)).await.unwrap().order_id.unwrap();
        let open = ex
            .create_order(CreateOrderRequest { client_order_id: ClientOrderId::new("c-2"), ..request(Side::Buy, 90.0) })
            .await
            .unwrap()
            .order_id
            .unwrap();

        let all = ex.list_orders(Some("BTC-USD"), Some(before)).await.unwrap();
        let ids: Vec<OrderId> = all.iter().map(|o| o.order_id.clone()).collect();
        assert_eq!(ids, vec![filled.clone(), open]);
        assert!(all[0].done);

        assert!(ex.list_orders(Some("ETH-USD"), None).await.unwrap().is_empty());
        let later = Utc::now() + chrono::Duration::hours(1);
        assert!(ex.list_orders(None, Some(later)).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_walk_moves_price() {
        let ex = Arc::new(PaperExchange::new(PaperConfig {
            seed: Some(7),
            tick_interval: Duration::from_millis(100),
            ..config(0)
        }));
        let mut tickers = ex.subscribe_tickers("BTC-USD").await.unwrap();
        let scope = CancelScope::new();
        let handle = ex.spawn_random_walk("BTC-USD", scope.clone());

        for _ in 0..3 {
            let t = tickers.recv().await.unwrap();
            assert!(t.price > Px::ZERO);
        }
        scope.cancel(common::CancelCause::Shutdown);
        handle.await.unwrap();
    }
}
