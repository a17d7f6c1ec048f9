//! Per-product price watcher
//!
//! Keeps one ticker subscription open to the exchange, reconnecting after
//! failures, and fans the prices out to any number of local subscribers
//! through a [`bus::Topic`]. Completed candles are handed to the datastore.

use crate::api::{ExchangeApi, ProductInfo};
use crate::datastore::Datastore;
use bus::{BusResult, Receiver, Topic};
use chrono::DateTime;
use common::{CancelCause, CancelScope, Candle, Ticker};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Folds tickers into fixed-width candles
#[derive(Debug)]
pub struct CandleBuilder {
    interval_secs: u32,
    current: Option<Candle>,
}

impl CandleBuilder {
    /// Build candles `interval_secs` wide
    #[must_use]
    pub fn new(interval_secs: u32) -> Self {
        Self { interval_secs: interval_secs.max(1), current: None }
    }

    /// Fold `ticker` in, returning the previous candle once a ticker of a
    /// later interval arrives. Tickers older than the open candle are
    /// ignored.
    pub fn push(&mut self, ticker: &Ticker) -> Option<Candle> {
        let width = i64::from(self.interval_secs);
        let secs = ticker.timestamp.timestamp();
        let start = DateTime::from_timestamp(secs - secs.rem_euclid(width), 0).unwrap_or(ticker.timestamp);

        if let Some(c) = &mut self.current {
            if start < c.start {
                return None;
            }
            if start == c.start {
                c.update(ticker);
                return None;
            }
        }
        self.current.replace(Candle::open_at(start, self.interval_secs, ticker))
    }

    /// The candle still being built
    #[must_use]
    pub const fn current(&self) -> Option<&Candle> {
        self.current.as_ref()
    }
}

/// Watcher settings
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Delay before resubscribing after the feed fails or ends
    pub retry_interval: Duration,
    /// Candle width in seconds
    pub candle_interval_secs: u32,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self { retry_interval: Duration::from_secs(5), candle_interval_secs: 60 }
    }
}

/// Ticker fan-out for one product
pub struct Watcher {
    product_id: String,
    topic: Topic<Ticker>,
    scope: CancelScope,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    /// Start watching `info.product_id`
    ///
    /// The product price from `info` is published right away so that new
    /// subscribers never start empty.
    #[must_use]
    pub fn start(
        api: Arc<dyn ExchangeApi>,
        info: &ProductInfo,
        datastore: Option<Arc<Datastore>>,
        parent: &CancelScope,
        opts: WatcherOptions,
    ) -> Self {
        let topic = Topic::new();
        topic.publish(Ticker { price: info.price, last_size: common::Qty::ZERO, timestamp: chrono::Utc::now() });

        let scope = parent.child();
        let task = tokio::spawn(watch(
            api,
            info.product_id.clone(),
            topic.clone(),
            datastore,
            scope.clone(),
            opts,
        ));
        Self { product_id: info.product_id.clone(), topic, scope, task: Mutex::new(Some(task)) }
    }

    /// Subscribe to prices, starting with the latest one
    ///
    /// # Errors
    /// Fails once the watcher is closed.
    pub fn subscribe(&self) -> BusResult<Receiver<Ticker>> {
        self.topic.subscribe(1, true)
    }

    /// Latest known price
    #[must_use]
    pub fn latest(&self) -> Option<Ticker> {
        self.topic.recent()
    }

    /// Stop the feed and end every subscription; later calls do nothing
    pub async fn close(&self) {
        self.scope.cancel(CancelCause::Closed);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(product_id = %self.product_id, "watcher task failed: {e}");
            }
        }
        self.topic.close();
    }
}

async fn watch(
    api: Arc<dyn ExchangeApi>,
    product_id: String,
    topic: Topic<Ticker>,
    datastore: Option<Arc<Datastore>>,
    scope: CancelScope,
    opts: WatcherOptions,
) {
    let mut candles = CandleBuilder::new(opts.candle_interval_secs);
    loop {
        match scope.run(api.subscribe_tickers(&product_id)).await {
            Err(_) => break,
            Ok(Err(e)) => warn!(%product_id, "ticker subscription failed: {e}"),
            Ok(Ok(mut feed)) => {
                info!(%product_id, "ticker feed connected");
                loop {
                    let ticker = match scope.run(feed.recv()).await {
                        Err(_) => return,
                        Ok(None) => {
                            warn!(%product_id, "ticker feed ended");
                            break;
                        }
                        Ok(Some(t)) => t,
                    };
                    topic.publish(ticker);
                    let (Some(done), Some(ds)) = (candles.push(&ticker), datastore.as_ref()) else {
                        continue;
                    };
                    if let Err(e) = ds.save_candles(&product_id, &[done]) {
                        warn!(%product_id, "could not save candle: {e}");
                    }
                }
            }
        }
        if scope.sleep(opts.retry_interval).await.is_err() {
            break;
        }
    }
    debug!(%product_id, "watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::{Px, Qty};

    fn tick(secs: i64, price: f64) -> Ticker {
        Ticker {
            price: Px::new(price),
            last_size: Qty::new(1.0),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_candle_rollover() {
        let mut b = CandleBuilder::new(60);
        // 1_700_000_000 is 20s into its minute.
        assert!(b.push(&tick(0, 100.0)).is_none());
        assert!(b.push(&tick(10, 104.0)).is_none());
        assert!(b.push(&tick(20, 98.0)).is_none());
        assert!(b.push(&tick(39, 101.0)).is_none());

        let done = b.push(&tick(40, 99.0)).unwrap();
        assert_eq!(done.start, Utc.timestamp_opt(1_699_999_980, 0).unwrap());
        assert_eq!(done.open, Px::new(100.0));
        assert_eq!(done.high, Px::new(104.0));
        assert_eq!(done.low, Px::new(98.0));
        assert_eq!(done.close, Px::new(101.0));
        assert_eq!(done.volume, Qty::new(4.0));
        assert_eq!(b.current().unwrap().open, Px::new(99.0));
    }

    #[test]
    fn test_late_ticker_ignored() {
        let mut b = CandleBuilder::new(60);
        b.push(&tick(40, 100.0));
        assert!(b.push(&tick(0, 50.0)).is_none());
        assert_eq!(b.current().unwrap().low, Px::new(100.0));
    }
}
