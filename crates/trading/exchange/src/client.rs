//! Exchange client shared by every product of one exchange
//!
//! The client owns the account-wide order feed. Every order view it learns
//! about, from the feed, from polling or from explicit lookups, is merged
//! into a per-order record and republished to that order's subscribers only
//! when the merge changed something. Filled orders go to the datastore.

use crate::api::{ExchangeApi, ProductInfo};
use crate::datastore::Datastore;
use crate::error::{ExchangeError, ExchangeResult};
use crate::product::Product;
use crate::submitter::Submitter;
use crate::watcher::{Watcher, WatcherOptions};
use async_trait::async_trait;
use bus::{Receiver, Topic};
use chrono::{DateTime, Utc};
use common::{CancelCause, CancelScope, ClientOrderId, Order, OrderId, OrderStatus, Px, Qty, Side, Ticker};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// How long acknowledged client ids are remembered
    pub submit_cache_ttl: Duration,
    /// Delay before resubscribing to a failed feed
    pub feed_retry_interval: Duration,
    /// Interval between polls of open orders
    pub order_poll_interval: Duration,
    /// Candle width in seconds
    pub candle_interval_secs: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            submit_cache_ttl: Duration::from_secs(600),
            feed_retry_interval: Duration::from_secs(5),
            order_poll_interval: Duration::from_secs(30),
            candle_interval_secs: 60,
        }
    }
}

struct OrderEntry {
    order: Order,
    topic: Topic<Order>,
}

struct Shared {
    api: Arc<dyn ExchangeApi>,
    submitter: Submitter,
    orders: Mutex<FxHashMap<OrderId, OrderEntry>>,
    datastore: Option<Arc<Datastore>>,
}

impl Shared {
    /// Merge `update` into the known view and return the result
    fn dispatch(&self, update: &Order) -> Order {
        let merged = {
            let mut orders = self.orders.lock();
            match orders.get_mut(&update.order_id) {
                Some(entry) => {
                    let merged = Order::merge(&entry.order, update);
                    if merged != entry.order {
                        entry.order = merged.clone();
                        entry.topic.publish(merged.clone());
                    }
                    merged
                }
                None => {
                    let topic = Topic::new();
                    topic.publish(update.clone());
                    orders.insert(update.order_id.clone(), OrderEntry { order: update.clone(), topic });
                    update.clone()
                }
            }
        };

        if let Some(client_id) = &merged.client_order_id {
            self.submitter.record(client_id, &merged.order_id);
        }
        if merged.is_terminal() && !merged.filled_size.is_zero() {
            if let Some(ds) = &self.datastore {
                if let Err(e) = ds.save_filled_orders(std::slice::from_ref(&merged)) {
                    warn!(order_id = %merged.order_id, "could not save filled order: {e}");
                }
            }
        }
        merged
    }

    /// Start tracking an order this process just created
    fn track(&self, order_id: &OrderId, client_id: &ClientOrderId, product_id: &str, side: Side) {
        let mut orders = self.orders.lock();
        orders.entry(order_id.clone()).or_insert_with(|| OrderEntry {
            order: Order {
                order_id: order_id.clone(),
                client_order_id: Some(client_id.clone()),
                product_id: product_id.to_string(),
                side: Some(side),
                status: OrderStatus::Pending,
                ..Order::default()
            },
            topic: Topic::new(),
        });
    }

    /// List recent orders of every status and dispatch them; returns how
    /// many were listed
    async fn backfill(&self, lookback: Duration) -> ExchangeResult<usize> {
        let mut since = Utc::now() - chrono::Duration::from_std(lookback).unwrap_or(chrono::Duration::zero());
        if let Some(ds) = &self.datastore {
            match ds.last_filled_time() {
                Ok(Some(last)) => since = since.min(last),
                Ok(None) => {}
                Err(e) => warn!("could not read last fill time: {e}"),
            }
        }
        let orders = self.api.list_orders(None, Some(since)).await?;
        for order in &orders {
            self.dispatch(order);
        }
        debug!(%since, count = orders.len(), "backfilled orders");
        Ok(orders.len())
    }

    fn open_order_ids(&self) -> Vec<OrderId> {
        let orders = self.orders.lock();
        orders.values().filter(|e| !e.order.is_terminal()).map(|e| e.order.order_id.clone()).collect()
    }
}

/// Connection to one exchange
///
/// Opened with [`Client::connect`].
pub struct Client {
    shared: Arc<Shared>,
    opts: ClientOptions,
    scope: CancelScope,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    products: Mutex<Vec<Arc<ClientProduct>>>,
}

impl Client {
    /// Connect through `api`, saving filled orders and candles into
    /// `datastore` when given
    ///
    /// The order feed is subscribed before this returns. Recent orders of
    /// every status are then listed and dispatched, which remembers their
    /// client ids for idempotent resubmission and saves fills made while no
    /// client was running. The listing starts at the last saved fill bucket
    /// or one submit-cache TTL ago, whichever is earlier.
    ///
    /// # Errors
    /// Transport failures while subscribing or listing.
    pub async fn connect(
        api: Arc<dyn ExchangeApi>,
        opts: ClientOptions,
        datastore: Option<Arc<Datastore>>,
    ) -> ExchangeResult<Self> {
        let shared = Arc::new(Shared {
            api,
            submitter: Submitter::new(opts.submit_cache_ttl),
            orders: Mutex::new(FxHashMap::default()),
            datastore,
        });
        let feed = shared.api.subscribe_orders().await?;
        let backfilled = shared.backfill(opts.submit_cache_ttl).await?;

        let scope = CancelScope::new();
        let tasks = vec![
            tokio::spawn(order_feed(Arc::clone(&shared), scope.clone(), opts.feed_retry_interval, feed)),
            tokio::spawn(order_poller(Arc::clone(&shared), scope.clone(), opts.order_poll_interval)),
        ];
        info!(exchange = shared.api.name(), backfilled, "exchange client started");
        Ok(Self { shared, opts, scope, tasks: Mutex::new(tasks), products: Mutex::new(Vec::new()) })
    }

    /// Exchange name
    #[must_use]
    pub fn exchange_name(&self) -> &str {
        self.shared.api.name()
    }

    /// Datastore receiving fills and candles
    #[must_use]
    pub fn datastore(&self) -> Option<&Arc<Datastore>> {
        self.shared.datastore.as_ref()
    }

    /// Order id the exchange acknowledged for `client_id`, if remembered
    #[must_use]
    pub fn lookup_client_id(&self, client_id: &ClientOrderId) -> Option<OrderId> {
        self.shared.submitter.lookup(client_id)
    }

    /// Open `product_id` for trading and start watching its price
    ///
    /// # Errors
    /// Unknown products, transport failures, and [`ExchangeError::Closed`]
    /// after [`Client::close`].
    pub async fn open_product(&self, product_id: &str) -> ExchangeResult<Arc<ClientProduct>> {
        if self.scope.is_cancelled() {
            return Err(ExchangeError::Closed);
        }
        let info = self.shared.api.product_info(product_id).await?;
        let watcher = Watcher::start(
            Arc::clone(&self.shared.api),
            &info,
            self.shared.datastore.clone(),
            &self.scope,
            WatcherOptions {
                retry_interval: self.opts.feed_retry_interval,
                candle_interval_secs: self.opts.candle_interval_secs,
            },
        );
        let product = Arc::new(ClientProduct {
            shared: Arc::downgrade(&self.shared),
            exchange_name: self.shared.api.name().to_string(),
            info,
            watcher,
            closed: AtomicBool::new(false),
        });
        self.products.lock().push(Arc::clone(&product));
        debug!(product_id, "opened product");
        Ok(product)
    }

    /// Close every product, stop the feeds and end every order subscription
    pub async fn close(&self) {
        let products = std::mem::take(&mut *self.products.lock());
        for product in products {
            product.close().await;
        }
        self.scope.cancel(CancelCause::Closed);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("client task failed: {e}");
            }
        }
        for entry in self.shared.orders.lock().values() {
            entry.topic.close();
        }
        info!(exchange = self.shared.api.name(), "exchange client closed");
    }
}

async fn order_feed(
    shared: Arc<Shared>,
    scope: CancelScope,
    retry: Duration,
    first: mpsc::UnboundedReceiver<Order>,
) {
    let mut connected = Some(first);
    loop {
        let feed = match connected.take() {
            Some(feed) => Ok(feed),
            None => match scope.run(shared.api.subscribe_orders()).await {
                Err(_) => return,
                Ok(feed) => feed,
            },
        };
        match feed {
            Err(e) => warn!("order feed subscription failed: {e}"),
            Ok(mut feed) => {
                info!("order feed connected");
                loop {
                    match scope.run(feed.recv()).await {
                        Err(_) => return,
                        Ok(Some(order)) => {
                            shared.dispatch(&order);
                        }
                        Ok(None) => {
                            warn!("order feed ended");
                            break;
                        }
                    }
                }
            }
        }
        if scope.sleep(retry).await.is_err() {
            return;
        }
    }
}

async fn order_poller(shared: Arc<Shared>, scope: CancelScope, every: Duration) {
    while scope.sleep(every).await.is_ok() {
        for order_id in shared.open_order_ids() {
            match scope.run(shared.api.get_order(&order_id)).await {
                Err(_) => return,
                Ok(Ok(order)) => {
                    shared.dispatch(&order);
                }
                Ok(Err(e)) => debug!(%order_id, "order poll failed: {e}"),
            }
        }
    }
}

/// One product of a [`Client`]
pub struct ClientProduct {
    shared: Weak<Shared>,
    exchange_name: String,
    info: ProductInfo,
    watcher: Watcher,
    closed: AtomicBool,
}

impl ClientProduct {
    fn shared(&self) -> ExchangeResult<Arc<Shared>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExchangeError::Closed);
        }
        self.shared.upgrade().ok_or(ExchangeError::Closed)
    }

    async fn limit(&self, side: Side, client_id: &ClientOrderId, size: Qty, price: Px) -> ExchangeResult<OrderId> {
        let shared = self.shared()?;
        let order_id = shared.submitter.submit(shared.api.as_ref(), &self.info, client_id, side, size, price).await?;
        shared.track(&order_id, client_id, &self.info.product_id, side);
        Ok(order_id)
    }

    /// Product limits as reported when the product was opened
    #[must_use]
    pub const fn info(&self) -> &ProductInfo {
        &self.info
    }

    /// Stop the price watcher; later calls do nothing
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.watcher.close().await;
        debug!(product_id = %self.info.product_id, "closed product");
    }
}

#[async_trait]
impl Product for ClientProduct {
    fn product_id(&self) -> &str {
        &self.info.product_id
    }

    fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    fn base_min_size(&self) -> Qty {
        self.info.base_min_size
    }

    async fn limit_buy(&self, client_id: &ClientOrderId, size: Qty, price: Px) -> ExchangeResult<OrderId> {
        self.limit(Side::Buy, client_id, size, price).await
    }

    async fn limit_sell(&self, client_id: &ClientOrderId, size: Qty, price: Px) -> ExchangeResult<OrderId> {
        self.limit(Side::Sell, client_id, size, price).await
    }

    async fn cancel(&self, order_id: &OrderId) -> ExchangeResult<()> {
        let shared = self.shared()?;
        let response = shared.api.cancel_order(order_id).await?;
        if !response.success {
            return Err(ExchangeError::Rejected { reason: response.failure_reason.unwrap_or_default() });
        }
        Ok(())
    }

    async fn get(&self, order_id: &OrderId) -> ExchangeResult<Order> {
        let shared = self.shared()?;
        let order = shared.api.get_order(order_id).await?;
        Ok(shared.dispatch(&order))
    }

    async fn list(&self) -> ExchangeResult<Vec<Order>> {
        let shared = self.shared()?;
        let orders = shared.api.list_open_orders(&self.info.product_id).await?;
        Ok(orders.iter().map(|o| shared.dispatch(o)).collect())
    }

    async fn list_since(&self, since: Option<DateTime<Utc>>) -> ExchangeResult<Vec<Order>> {
        let shared = self.shared()?;
        let orders = shared.api.list_orders(Some(&self.info.product_id), since).await?;
        Ok(orders.iter().map(|o| shared.dispatch(o)).collect())
    }

    fn ticker_stream(&self) -> ExchangeResult<Receiver<Ticker>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExchangeError::Closed);
        }
        self.watcher.subscribe().map_err(|_| ExchangeError::Closed)
    }

    fn order_updates(&self, order_id: &OrderId) -> Option<Receiver<Order>> {
        let shared = self.shared.upgrade()?;
        let orders = shared.orders.lock();
        orders.get(order_id).and_then(|e| e.topic.subscribe(1, true).ok())
    }
}
