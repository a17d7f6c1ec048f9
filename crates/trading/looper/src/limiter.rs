//! One ladder leg: a limit buy or sell driven until its size is filled
//!
//! A leg may need several exchange orders: an order cancelled on the
//! exchange with a partial fill is followed by another for the remainder.
//! Every change is persisted before the leg moves on, and every client id
//! is persisted before the order it names is submitted, so a restarted
//! process resubmits under the same id and never doubles the order.

use crate::error::{LooperError, LooperResult};
use crate::runtime::Runtime;
use crate::state_key;
use chrono::{DateTime, Duration, Utc};
use common::{Amount, CancelScope, ClientOrderId, Order, OrderId, OrderStatus, Point, Qty, Side};
use exchange::ExchangeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use storage::{Database, Reader, Writer, kvutil, with_read_writer};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of a leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegState {
    /// Nothing submitted yet
    Created,
    /// An order is live, nothing filled
    Submitted,
    /// Some but not all of the size filled
    PartiallyFilled,
    /// Fully filled
    Filled,
    /// Cancelled by the operator
    Cancelled,
}

impl LegState {
    /// Whether the leg will not trade again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled)
    }
}

impl fmt::Display for LegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Submitted => "submitted",
            Self::PartiallyFilled => "partially-filled",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LimiterState {
    uid: String,
    exchange: String,
    product_id: String,
    side: Side,
    point: Point,
    /// Number of client ids handed out
    attempts: u32,
    /// Client id persisted but not yet acknowledged
    pending_client_id: Option<ClientOrderId>,
    /// When the pending client id was handed out
    #[serde(default)]
    pending_since: Option<DateTime<Utc>>,
    orders: BTreeMap<OrderId, Order>,
    cancelled: bool,
}

/// Drives one limit order rung to completion
#[derive(Debug, Clone)]
pub struct Limiter {
    state: LimiterState,
}

impl Limiter {
    /// Create a leg that trades `point` on `side`
    ///
    /// # Errors
    /// [`LooperError::Invalid`] for a non-positive price or size.
    pub fn new(uid: &str, exchange: &str, product_id: &str, side: Side, point: Point) -> LooperResult<Self> {
        if point.price <= common::Px::ZERO || point.size <= Qty::ZERO {
            return Err(LooperError::Invalid { reason: format!("{uid}: point {}@{} must be positive", point.size, point.price) });
        }
        Ok(Self {
            state: LimiterState {
                uid: uid.to_string(),
                exchange: exchange.to_string(),
                product_id: product_id.to_string(),
                side,
                point,
                attempts: 0,
                pending_client_id: None,
                pending_since: None,
                orders: BTreeMap::new(),
                cancelled: false,
            },
        })
    }

    /// Load a leg saved under `uid`
    ///
    /// # Errors
    /// [`LooperError::NotFound`] when nothing is saved, storage errors
    /// otherwise.
    pub fn load<R: Reader + ?Sized>(r: &R, uid: &str) -> LooperResult<Self> {
        let state: LimiterState =
            kvutil::get(r, &state_key(uid))?.ok_or_else(|| LooperError::NotFound { uid: uid.to_string() })?;
        Ok(Self { state })
    }

    /// Write the leg into `w`
    ///
    /// # Errors
    /// Encoding and write errors.
    pub fn save<W: Writer + ?Sized>(&self, w: &mut W) -> LooperResult<()> {
        kvutil::set(w, &state_key(&self.state.uid), &self.state)?;
        Ok(())
    }

    fn persist(&self, db: &dyn Database) -> LooperResult<()> {
        with_read_writer(db, |tx| self.save(tx))
    }

    /// Apply `change` and persist it; the in-memory state is restored when
    /// persisting fails
    fn update<F: FnOnce(&mut LimiterState)>(&mut self, db: &dyn Database, change: F) -> LooperResult<bool> {
        let before = self.state.clone();
        change(&mut self.state);
        if self.state == before {
            return Ok(false);
        }
        if let Err(e) = self.persist(db) {
            warn!(uid = %self.state.uid, "could not persist leg: {e}");
            self.state = before;
            return Err(e);
        }
        Ok(true)
    }

    /// Leg id
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.state.uid
    }

    /// Buy or sell
    #[must_use]
    pub const fn side(&self) -> Side {
        self.state.side
    }

    /// Target price and size
    #[must_use]
    pub const fn point(&self) -> Point {
        self.state.point
    }

    /// Exchange orders placed for this leg
    #[must_use]
    pub fn order_ids(&self) -> Vec<OrderId> {
        self.state.orders.keys().cloned().collect()
    }

    /// Size filled across all orders
    #[must_use]
    pub fn filled_size(&self) -> Qty {
        self.state.orders.values().map(|o| o.filled_size).sum()
    }

    /// Size still to fill; zero once filled or cancelled
    #[must_use]
    pub fn pending_size(&self) -> Qty {
        if self.state.cancelled {
            return Qty::ZERO;
        }
        self.state.point.size.saturating_sub(self.filled_size())
    }

    /// Fees across all orders
    #[must_use]
    pub fn fees(&self) -> Amount {
        self.state.orders.values().map(|o| o.fee).sum()
    }

    /// Filled size times filled price across all orders
    #[must_use]
    pub fn value(&self) -> Amount {
        self.state.orders.values().map(Order::filled_value).sum()
    }

    /// [`Limiter::value`] of a buy leg, zero for sells
    #[must_use]
    pub fn bought_value(&self) -> Amount {
        if self.state.side == Side::Buy { self.value() } else { Amount::ZERO }
    }

    /// [`Limiter::value`] of a sell leg, zero for buys
    #[must_use]
    pub fn sold_value(&self) -> Amount {
        if self.state.side == Side::Sell { self.value() } else { Amount::ZERO }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> LegState {
        if self.state.cancelled {
            return LegState::Cancelled;
        }
        let filled = self.filled_size();
        if filled >= self.state.point.size {
            LegState::Filled
        } else if !filled.is_zero() {
            LegState::PartiallyFilled
        } else if self.state.orders.is_empty() && self.state.pending_client_id.is_none() {
            LegState::Created
        } else {
            LegState::Submitted
        }
    }

    fn live_order_id(&self) -> Option<OrderId> {
        self.state.orders.values().find(|o| !o.is_terminal()).map(|o| o.order_id.clone())
    }

    fn merge(&mut self, db: &dyn Database, update: &Order) -> LooperResult<()> {
        let changed = self.update(db, |s| {
            let Some(known) = s.orders.get_mut(&update.order_id) else {
                return;
            };
            *known = Order::merge(known, update);
            if s.pending_client_id.is_some() && s.pending_client_id == known.client_order_id {
                s.pending_client_id = None;
                s.pending_since = None;
            }
        })?;
        if changed {
            debug!(uid = %self.state.uid, order_id = %update.order_id, status = %update.status, filled = %update.filled_size, "leg order updated");
        }
        Ok(())
    }

    /// Client id for the next order, persisted before it is used
    fn next_client_id(&mut self, db: &dyn Database) -> LooperResult<ClientOrderId> {
        if let Some(cid) = &self.state.pending_client_id {
            return Ok(cid.clone());
        }
        let name = format!("{}#{}", self.state.uid, self.state.attempts);
        let cid = ClientOrderId::new(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string());
        self.update(db, |s| {
            s.attempts += 1;
            s.pending_client_id = Some(cid.clone());
            s.pending_since = Some(Utc::now());
        })?;
        Ok(cid)
    }

    async fn submit(&mut self, rt: &Runtime, scope: &CancelScope) -> LooperResult<OrderId> {
        let db = rt.database.as_ref();
        let client_id = self.next_client_id(db)?;
        let size = self.pending_size();
        let price = self.state.point.price;
        let result = match self.state.side {
            Side::Buy => scope.run(rt.product.limit_buy(&client_id, size, price)).await?,
            Side::Sell => scope.run(rt.product.limit_sell(&client_id, size, price)).await?,
        };
        let order_id = match result {
            Ok(id) => id,
            Err(e) if e.is_retryable() => return Err(e.into()),
            Err(e) => {
                // The exchange refused it; the next attempt gets a new id.
                warn!(uid = %self.state.uid, %client_id, "order refused: {e}");
                self.update(db, |s| {
                    s.pending_client_id = None;
                    s.pending_since = None;
                })?;
                return Err(e.into());
            }
        };

        let product_id = self.state.product_id.clone();
        let side = self.state.side;
        self.update(db, |s| {
            s.orders.entry(order_id.clone()).or_insert_with(|| Order {
                order_id: order_id.clone(),
                client_order_id: Some(client_id.clone()),
                product_id,
                side: Some(side),
                status: OrderStatus::Pending,
                ..Order::default()
            });
            s.pending_client_id = None;
            s.pending_since = None;
        })?;
        info!(uid = %self.state.uid, %order_id, %client_id, %side, %size, %price, "leg order placed");
        Ok(order_id)
    }

    /// Wait on `order_id` until it is terminal
    async fn follow(&mut self, rt: &Runtime, scope: &CancelScope, order_id: &OrderId) -> LooperResult<()> {
        let db = rt.database.as_ref();
        let mut updates = match rt.product.order_updates(order_id) {
            Some(rx) => rx,
            None => {
                // Not seen by this process yet; a lookup starts tracking it.
                let order = scope.run(rt.product.get(order_id)).await??;
                self.merge(db, &order)?;
                if order.is_terminal() {
                    return Ok(());
                }
                rt.product
                    .order_updates(order_id)
                    .ok_or_else(|| ExchangeError::OrderNotFound { order_id: order_id.clone() })?
            }
        };
        loop {
            let Some(order) = scope.run(updates.recv()).await? else {
                return Err(ExchangeError::Closed.into());
            };
            self.merge(db, &order)?;
            if self.state.orders.get(order_id).is_none_or(Order::is_terminal) {
                return Ok(());
            }
        }
    }

    /// Drive the leg until it is filled or cancelled
    ///
    /// # Errors
    /// The cancel cause when `scope` is cancelled, exchange and storage
    /// errors otherwise. State reached before the error is persisted and a
    /// later call continues from it.
    pub async fn run(&mut self, rt: &Runtime, scope: &CancelScope) -> LooperResult<()> {
        while !self.pending_size().is_zero() {
            let order_id = match self.live_order_id() {
                Some(id) => id,
                None => self.submit(rt, scope).await?,
            };
            self.follow(rt, scope, &order_id).await?;
        }
        debug!(uid = %self.state.uid, state = %self.state(), "leg complete");
        Ok(())
    }

    /// Query the exchange for every order of the leg and merge the answers
    ///
    /// Also adopts the order carrying the pending client id, open or done,
    /// so a submission acknowledged just before a crash is not repeated.
    ///
    /// # Errors
    /// Cancellation, exchange and storage errors.
    pub async fn fix(&mut self, rt: &Runtime, scope: &CancelScope) -> LooperResult<()> {
        let db = rt.database.as_ref();
        if let Some(cid) = self.state.pending_client_id.clone() {
            // Exchange clocks may trail ours.
            let since = self.state.pending_since.map(|t| t - Duration::minutes(5));
            let recent = scope.run(rt.product.list_since(since)).await??;
            if let Some(order) = recent.into_iter().find(|o| o.client_order_id.as_ref() == Some(&cid)) {
                info!(uid = %self.state.uid, order_id = %order.order_id, status = %order.status, "adopting order of pending client id");
                self.update(db, |s| {
                    s.orders.insert(order.order_id.clone(), order);
                    s.pending_client_id = None;
                    s.pending_since = None;
                })?;
            }
        }
        for order_id in self.order_ids() {
            let order = scope.run(rt.product.get(&order_id)).await??;
            self.merge(db, &order)?;
        }
        Ok(())
    }

    /// Poll the exchange for the orders that are not yet terminal
    ///
    /// # Errors
    /// Cancellation, exchange and storage errors.
    pub async fn refresh(&mut self, rt: &Runtime, scope: &CancelScope) -> LooperResult<()> {
        let db = rt.database.as_ref();
        let open: Vec<OrderId> =
            self.state.orders.values().filter(|o| !o.is_terminal()).map(|o| o.order_id.clone()).collect();
        for order_id in open {
            let order = scope.run(rt.product.get(&order_id)).await??;
            self.merge(db, &order)?;
        }
        Ok(())
    }

    /// Cancel the live order and stop the leg; what already filled stays
    ///
    /// # Errors
    /// Cancellation, exchange and storage errors.
    pub async fn cancel(&mut self, rt: &Runtime, scope: &CancelScope) -> LooperResult<()> {
        let db = rt.database.as_ref();
        if let Some(order_id) = self.live_order_id() {
            match scope.run(rt.product.cancel(&order_id)).await? {
                Ok(()) | Err(ExchangeError::Rejected { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            let order = scope.run(rt.product.get(&order_id)).await??;
            self.merge(db, &order)?;
        }
        self.update(db, |s| {
            s.cancelled = true;
            s.pending_client_id = None;
            s.pending_since = None;
        })?;
        info!(uid = %self.state.uid, filled = %self.filled_size(), "leg cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Px;
    use storage::MemDb;

    fn leg() -> Limiter {
        Limiter::new("l-1/buy-000000", "paper", "BTC-USD", Side::Buy, Point::new(Px::new(100.0), Qty::new(2.0)))
            .unwrap()
    }

    fn filled(id: &str, size: f64) -> Order {
        Order {
            order_id: OrderId::new(id),
            product_id: "BTC-USD".to_string(),
            status: OrderStatus::Cancelled,
            filled_size: Qty::new(size),
            filled_price: Px::new(100.0),
            fee: Amount::new(0.1),
            done: true,
            ..Order::default()
        }
    }

    #[test]
    fn test_rejects_bad_point() {
        let err = Limiter::new("x", "paper", "BTC-USD", Side::Sell, Point::new(Px::new(100.0), Qty::ZERO)).unwrap_err();
        assert!(matches!(err, LooperError::Invalid { .. }));
    }

    #[test]
    fn test_accessors_aggregate_orders() {
        let mut l = leg();
        assert_eq!(l.state(), LegState::Created);
        l.state.orders.insert(OrderId::new("a"), filled("a", 0.5));
        l.state.orders.insert(OrderId::new("b"), filled("b", 1.0));

        assert_eq!(l.filled_size(), Qty::new(1.5));
        assert_eq!(l.pending_size(), Qty::new(0.5));
        assert_eq!(l.fees(), Amount::new(0.2));
        assert_eq!(l.bought_value(), Amount::new(150.0));
        assert_eq!(l.sold_value(), Amount::ZERO);
        assert_eq!(l.state(), LegState::PartiallyFilled);
        assert_eq!(l.live_order_id(), None);
    }

    #[test]
    fn test_client_id_is_persisted_and_stable() {
        let db = MemDb::new();
        let mut l = leg();
        let a = l.next_client_id(&db).unwrap();
        assert_eq!(l.next_client_id(&db).unwrap(), a);
        assert_eq!(l.state(), LegState::Submitted);

        let loaded = storage::with_reader(&db, |r| Limiter::load(r, "l-1/buy-000000")).unwrap();
        assert_eq!(loaded.state.pending_client_id, Some(a.clone()));

        l.state.pending_client_id = None;
        assert_ne!(l.next_client_id(&db).unwrap(), a);
    }

    #[test]
    fn test_merge_ignores_foreign_orders() {
        let db = MemDb::new();
        let mut l = leg();
        l.merge(&db, &filled("stranger", 1.0)).unwrap();
        assert!(l.order_ids().is_empty());
        assert!(matches!(
            storage::with_reader(&db, |r| Limiter::load(r, "l-1/buy-000000")),
            Err(LooperError::NotFound { .. })
        ));
    }
}
