//! Durable, hour-bucketed history of filled orders and candles
//!
//! Layout under the exchange keyspace:
//!
//! - `/<exchange>/filled/<YYYY-MM-DD>/<HH>` holds every filled order whose
//!   last fill happened in that UTC hour, keyed by order id.
//! - `/<exchange>/candles/<YYYY-MM-DD>/<HH>` holds, per product, the candles
//!   starting in that hour sorted by start time.
//!
//! Writers read-modify-write one bucket per transaction batch. An order id
//! already present in its bucket is never overwritten, so replays are no-ops.

use crate::error::{DatastoreError, DatastoreResult};
use chrono::{DateTime, Duration, DurationRound, NaiveDate, Timelike, Utc};
use common::{Candle, Order, OrderId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use storage::{Database, KeyRange, StorageError, kvutil, path_range, with_read_writer, with_reader};
use tracing::{debug, info, warn};

/// Filled orders of one hour
#[derive(Debug, Default, Serialize, Deserialize)]
struct FilledBucket {
    orders: BTreeMap<String, Order>,
}

/// Candles of one hour, per product
#[derive(Debug, Default, Serialize, Deserialize)]
struct CandleBucket {
    products: BTreeMap<String, Vec<Candle>>,
}

/// Filled order and candle store for one exchange
pub struct Datastore {
    db: Arc<dyn Database>,
    keyspace: String,
    /// Orders saved by this process, sorted by (last fill time, order id)
    recent: Mutex<Vec<(DateTime<Utc>, OrderId)>>,
}

/// Bucket suffix `YYYY-MM-DD/HH` for a timestamp
fn bucket_suffix(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d/%H").to_string()
}

/// Time an order is bucketed by
fn fill_time(order: &Order) -> Option<DateTime<Utc>> {
    order.last_fill_time.or(order.create_time)
}

fn truncate_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1)).unwrap_or(ts)
}

impl Datastore {
    /// Create a store writing under `/<exchange>/`
    #[must_use]
    pub fn new(db: Arc<dyn Database>, exchange: &str) -> Self {
        Self { db, keyspace: format!("/{exchange}"), recent: Mutex::new(Vec::new()) }
    }

    fn filled_dir(&self) -> String {
        format!("{}/filled", self.keyspace)
    }

    fn candles_dir(&self) -> String {
        format!("{}/candles", self.keyspace)
    }

    fn filled_key(&self, ts: DateTime<Utc>) -> String {
        format!("{}/{}", self.filled_dir(), bucket_suffix(ts))
    }

    fn candles_key(&self, ts: DateTime<Utc>) -> String {
        format!("{}/{}", self.candles_dir(), bucket_suffix(ts))
    }

    /// Persist terminal orders with a non-zero filled size
    ///
    /// Orders still open, orders without fills, orders without a fill or
    /// create time, and orders this process already saved are skipped.
    /// Returns how many orders were newly written.
    ///
    /// # Errors
    /// Returns the storage error when the transaction fails; nothing is
    /// written in that case and the call may be retried with the same input.
    pub fn save_filled_orders(&self, orders: &[Order]) -> DatastoreResult<usize> {
        let mut recent = self.recent.lock();

        let mut buckets: BTreeMap<String, Vec<(DateTime<Utc>, &Order)>> = BTreeMap::new();
        for order in orders {
            if !order.is_terminal() || order.filled_size.is_zero() {
                continue;
            }
            let Some(at) = fill_time(order) else {
                warn!(order_id = %order.order_id, "filled order has no timestamp; not saved");
                continue;
            };
            let key = (at, order.order_id.clone());
            if recent.binary_search(&key).is_ok() {
                continue;
            }
            buckets.entry(self.filled_key(at)).or_default().push((at, order));
        }
        if buckets.is_empty() {
            return Ok(0);
        }

        let result = with_read_writer(self.db.as_ref(), |tx| {
            let mut inserted = 0;
            for (key, orders) in &buckets {
                let mut bucket: FilledBucket = kvutil::get(tx, key)?.unwrap_or_default();
                for (_, order) in orders {
                    if !bucket.orders.contains_key(order.order_id.as_str()) {
                        bucket.orders.insert(order.order_id.to_string(), (*order).clone());
                        inserted += 1;
                        debug!(order_id = %order.order_id, %key, "saving filled order");
                    }
                }
                kvutil::set(tx, key, &bucket)?;
            }
            Ok::<_, StorageError>(inserted)
        });

        let inserted = match result {
            Ok(n) => n,
            Err(e) => {
                warn!(orders = orders.len(), "could not save filled orders (will retry): {e}");
                return Err(e.into());
            }
        };

        recent.extend(buckets.into_values().flatten().map(|(at, o)| (at, o.order_id.clone())));
        recent.sort();
        recent.dedup();
        if inserted > 0 {
            info!(inserted, "saved filled orders");
        }
        Ok(inserted)
    }

    /// Visit every saved filled order in bucket order, optionally only those
    /// of `product`
    ///
    /// An error from `f` stops the scan and is returned.
    ///
    /// # Errors
    /// Storage and decode errors, and errors from `f`.
    pub fn scan_filled<E, F>(&self, product: Option<&str>, mut f: F) -> Result<(), E>
    where
        E: From<StorageError>,
        F: FnMut(&Order) -> Result<(), E>,
    {
        let range = path_range(&self.filled_dir());
        with_reader(self.db.as_ref(), |r| {
            kvutil::ascend(r, &range, |_key, bucket: FilledBucket| {
                for order in bucket.orders.values() {
                    if product.is_some_and(|p| p != order.product_id) {
                        continue;
                    }
                    f(order)?;
                }
                Ok(())
            })
        })
    }

    /// Start of the latest hour holding a filled order, `None` when nothing
    /// has been saved
    ///
    /// # Errors
    /// Storage errors and bucket keys that do not parse.
    pub fn last_filled_time(&self) -> DatastoreResult<Option<DateTime<Utc>>> {
        let dir = self.filled_dir();
        let range = path_range(&dir);
        let last = with_reader(self.db.as_ref(), |r| {
            Ok::<_, StorageError>(r.descend(&range)?.next().map(|(key, _)| key))
        })?;
        let Some(key) = last else {
            return Ok(None);
        };
        let suffix = key.strip_prefix(range.begin.as_str()).unwrap_or_default();
        parse_bucket(suffix).map(Some).ok_or(DatastoreError::BadKey { key })
    }

    /// Persist candles of `product`
    ///
    /// Candles are merged into their hour bucket; a candle with the same
    /// start time as a stored one replaces it.
    ///
    /// # Errors
    /// Returns the storage error when the transaction fails.
    pub fn save_candles(&self, product: &str, candles: &[Candle]) -> DatastoreResult<()> {
        if candles.is_empty() {
            return Ok(());
        }
        let _guard = self.recent.lock();

        let mut buckets: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
        for candle in candles {
            buckets.entry(self.candles_key(candle.start)).or_default().push(*candle);
        }

        with_read_writer(self.db.as_ref(), |tx| {
            for (key, fresh) in &buckets {
                let mut bucket: CandleBucket = kvutil::get(tx, key)?.unwrap_or_default();
                let stored = bucket.products.remove(product).unwrap_or_default();
                let mut by_start: BTreeMap<i64, Candle> =
                    stored.into_iter().map(|c| (c.start.timestamp(), c)).collect();
                for candle in fresh {
                    by_start.insert(candle.start.timestamp(), *candle);
                }
                bucket.products.insert(product.to_string(), by_start.into_values().collect());
                kvutil::set(tx, key, &bucket)?;
            }
            Ok::<_, StorageError>(())
        })?;
        debug!(product, candles = candles.len(), "saved candles");
        Ok(())
    }

    /// Visit candles of `product` starting in `[begin, end)` in time order;
    /// an unset bound is open
    ///
    /// # Errors
    /// Storage and decode errors, and errors from `f`.
    pub fn scan_candles<E, F>(
        &self,
        product: &str,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        mut f: F,
    ) -> Result<(), E>
    where
        E: From<StorageError>,
        F: FnMut(&Candle) -> Result<(), E>,
    {
        let dir = path_range(&self.candles_dir());
        let lo = begin.map_or(dir.begin.clone(), |b| self.candles_key(truncate_hour(b)));
        let hi = end.map_or(dir.end.clone(), |e| {
            let floor = truncate_hour(e);
            // A partial final hour still has to be read.
            if floor == e { self.candles_key(floor) } else { self.candles_key(floor + Duration::hours(1)) }
        });
        let range = KeyRange::new(lo, hi);

        with_reader(self.db.as_ref(), |r| {
            kvutil::ascend(r, &range, |_key, bucket: CandleBucket| {
                let Some(candles) = bucket.products.get(product) else {
                    return Ok(());
                };
                for candle in candles {
                    if begin.is_some_and(|b| candle.start < b) {
                        continue;
                    }
                    if end.is_some_and(|e| candle.start >= e) {
                        break;
                    }
                    f(candle)?;
                }
                Ok(())
            })
        })
    }
}

/// Parse a `YYYY-MM-DD/HH` bucket suffix into the start of that hour
fn parse_bucket(suffix: &str) -> Option<DateTime<Utc>> {
    let (date, hour) = suffix.split_once('/')?;
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    let hour: u32 = hour.parse().ok()?;
    let ts = date.and_hms_opt(hour, 0, 0)?.and_utc();
    (ts.hour() == hour).then_some(ts)
}
