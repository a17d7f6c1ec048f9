//! Buy/sell pair coordinator
//!
//! A looper keeps buying at its buy point while it holds less than the buy
//! size and selling at its sell point once it holds at least the sell size.
//! Holdings are always recomputed from the legs' filled sizes, so a restarted
//! looper picks up exactly where the persisted legs left it.

use crate::error::{LooperError, LooperResult};
use crate::limiter::{LegState, Limiter};
use crate::runtime::Runtime;
use crate::{LOOPERS_DIR, state_key};
use chrono::Utc;
use common::{Amount, CancelCause, CancelScope, Point, Px, Qty, Side};
use exchange::ExchangeError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use storage::{Database, Reader, Writer, kvutil, path_range, with_read_writer};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LooperState {
    uid: String,
    exchange: String,
    product_id: String,
    buy_point: Point,
    sell_point: Point,
    buys: Vec<String>,
    sells: Vec<String>,
}

#[derive(Debug, Default)]
struct Legs {
    buys: Vec<Limiter>,
    sells: Vec<Limiter>,
}

impl Legs {
    fn bought(&self) -> Qty {
        self.buys.iter().map(Limiter::filled_size).sum()
    }

    fn sold(&self) -> Qty {
        self.sells.iter().map(Limiter::filled_size).sum()
    }
}

/// Snapshot of one leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegStatus {
    /// Leg id
    pub uid: String,
    /// Lifecycle state
    pub state: LegState,
    /// Filled size
    pub filled: Qty,
    /// Size still to fill
    pub pending: Qty,
    /// Fees paid
    pub fees: Amount,
    /// Filled value
    pub value: Amount,
    /// Exchange orders placed
    pub orders: usize,
}

impl LegStatus {
    fn of(leg: &Limiter) -> Self {
        Self {
            uid: leg.uid().to_string(),
            state: leg.state(),
            filled: leg.filled_size(),
            pending: leg.pending_size(),
            fees: leg.fees(),
            value: leg.value(),
            orders: leg.order_ids().len(),
        }
    }
}

/// Snapshot of a looper
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LooperStatus {
    /// Looper id
    pub uid: String,
    /// Exchange name
    pub exchange: String,
    /// Product id
    pub product_id: String,
    /// Buy rung
    pub buy_point: Point,
    /// Sell rung
    pub sell_point: Point,
    /// Bought minus sold
    pub holdings: Qty,
    /// Sum of fees over all legs
    pub fees: Amount,
    /// Profit over pairs whose sell leg filled
    pub profit: Amount,
    /// Buy legs in creation order
    pub buys: Vec<LegStatus>,
    /// Sell legs in creation order
    pub sells: Vec<LegStatus>,
}

fn pair_profit(buy: &Limiter, sell: &Limiter) -> Amount {
    sell.sold_value() - buy.bought_value() - (buy.fees() + sell.fees())
}

fn snapshot(state: &LooperState, legs: &Legs) -> LooperStatus {
    let buys: Vec<LegStatus> = legs.buys.iter().map(LegStatus::of).collect();
    let sells: Vec<LegStatus> = legs.sells.iter().map(LegStatus::of).collect();
    let fees: Amount = buys.iter().chain(&sells).map(|l| l.fees).sum();
    let profit: Amount = legs
        .buys
        .iter()
        .zip(&legs.sells)
        .filter(|(_, s)| s.state() == LegState::Filled)
        .map(|(b, s)| pair_profit(b, s))
        .sum();
    LooperStatus {
        uid: state.uid.clone(),
        exchange: state.exchange.clone(),
        product_id: state.product_id.clone(),
        buy_point: state.buy_point,
        sell_point: state.sell_point,
        holdings: legs.bought() - legs.sold(),
        fees,
        profit,
        buys,
        sells,
    }
}

/// Buy/sell pair coordinator for one product
pub struct Looper {
    state: LooperState,
    legs: AsyncMutex<Legs>,
    status: Mutex<Option<LooperStatus>>,
}

impl Looper {
    /// Create a looper trading `product_id` between `buy` and `sell`
    ///
    /// # Errors
    /// [`LooperError::Invalid`] unless both points are positive and the buy
    /// price is below the sell price.
    pub fn new(uid: &str, exchange: &str, product_id: &str, buy: Point, sell: Point) -> LooperResult<Self> {
        if buy.price <= Px::ZERO || buy.size <= Qty::ZERO || sell.price <= Px::ZERO || sell.size <= Qty::ZERO {
            return Err(LooperError::Invalid { reason: "buy and sell points must be positive".to_string() });
        }
        if buy.price >= sell.price {
            return Err(LooperError::Invalid {
                reason: format!("buy price {} must be below sell price {}", buy.price, sell.price),
            });
        }
        if uid.is_empty() || uid.contains('/') {
            return Err(LooperError::Invalid { reason: format!("bad looper id {uid:?}") });
        }
        let state = LooperState {
            uid: uid.to_string(),
            exchange: exchange.to_string(),
            product_id: product_id.to_string(),
            buy_point: buy,
            sell_point: sell,
            buys: Vec::new(),
            sells: Vec::new(),
        };
        Ok(Self::from_parts(state, Legs::default()))
    }

    fn from_parts(state: LooperState, legs: Legs) -> Self {
        let status = snapshot(&state, &legs);
        Self { state, legs: AsyncMutex::new(legs), status: Mutex::new(Some(status)) }
    }

    /// Load the looper saved under `uid` with all its legs
    ///
    /// # Errors
    /// [`LooperError::NotFound`] when nothing is saved under `uid`, storage
    /// errors otherwise.
    pub fn load<R: Reader + ?Sized>(r: &R, uid: &str) -> LooperResult<Self> {
        let state: LooperState =
            kvutil::get(r, &state_key(uid))?.ok_or_else(|| LooperError::NotFound { uid: uid.to_string() })?;
        let buys = state.buys.iter().map(|id| Limiter::load(r, id)).collect::<LooperResult<Vec<_>>>()?;
        let sells = state.sells.iter().map(|id| Limiter::load(r, id)).collect::<LooperResult<Vec<_>>>()?;
        Ok(Self::from_parts(state, Legs { buys, sells }))
    }

    /// Ids of every saved looper
    ///
    /// # Errors
    /// Storage errors.
    pub fn list_ids<R: Reader + ?Sized>(r: &R) -> LooperResult<Vec<String>> {
        let range = path_range(LOOPERS_DIR);
        let ids = r
            .ascend(&range)?
            .filter_map(|(key, _)| {
                let id = key.strip_prefix(range.begin.as_str())?;
                (!id.contains('/')).then(|| id.to_string())
            })
            .collect();
        Ok(ids)
    }

    /// Save the looper and its legs in one transaction
    ///
    /// Waits for a running [`Looper::run`], [`Looper::fix`] or
    /// [`Looper::refresh`] to finish.
    ///
    /// # Errors
    /// Encoding, write and commit errors.
    pub async fn persist(&self, db: &dyn Database) -> LooperResult<()> {
        let legs = self.legs.lock().await;
        with_read_writer(db, |tx| self.save_with(tx, &legs))
    }

    fn save_with<W: Writer + ?Sized>(&self, w: &mut W, legs: &Legs) -> LooperResult<()> {
        let mut state = self.state.clone();
        state.buys = legs.buys.iter().map(|l| l.uid().to_string()).collect();
        state.sells = legs.sells.iter().map(|l| l.uid().to_string()).collect();
        kvutil::set(w, &state_key(&state.uid), &state)?;
        for leg in legs.buys.iter().chain(&legs.sells) {
            leg.save(w)?;
        }
        Ok(())
    }

    /// Looper id
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.state.uid
    }

    /// Latest snapshot, refreshed on every step of [`Looper::run`] and after
    /// [`Looper::fix`] and [`Looper::refresh`]
    #[must_use]
    pub fn status(&self) -> Option<LooperStatus> {
        self.status.lock().clone()
    }

    fn publish_status(&self, legs: &Legs) {
        let status = snapshot(&self.state, legs);
        *self.status.lock() = Some(status);
    }

    /// Re-query the exchange for every leg; used once at startup
    ///
    /// # Errors
    /// The first leg error.
    pub async fn fix(&self, rt: &Runtime, scope: &CancelScope) -> LooperResult<()> {
        let mut guard = self.legs.lock().await;
        let legs = &mut *guard;
        let result = async {
            for leg in legs.buys.iter_mut().chain(legs.sells.iter_mut()) {
                leg.fix(rt, scope).await?;
            }
            Ok(())
        }
        .await;
        self.publish_status(&legs);
        result
    }

    /// Poll the exchange for the open orders of every leg
    ///
    /// # Errors
    /// The first leg error.
    pub async fn refresh(&self, rt: &Runtime, scope: &CancelScope) -> LooperResult<()> {
        let mut guard = self.legs.lock().await;
        let legs = &mut *guard;
        let result = async {
            for leg in legs.buys.iter_mut().chain(legs.sells.iter_mut()) {
                leg.refresh(rt, scope).await?;
            }
            Ok(())
        }
        .await;
        self.publish_status(&legs);
        result
    }

    async fn wait_price_above(&self, rt: &Runtime, scope: &CancelScope, price: Px) -> LooperResult<Px> {
        let mut tickers = rt.product.ticker_stream()?;
        loop {
            let Some(ticker) = scope.run(tickers.recv()).await? else {
                return Err(ExchangeError::Closed.into());
            };
            if !ticker.price.is_zero() && ticker.price > price {
                return Ok(ticker.price);
            }
        }
    }

    /// Append a new leg and persist the leg list; the leg is dropped again
    /// when persisting fails
    fn add_leg(&self, rt: &Runtime, legs: &mut Legs, side: Side) -> LooperResult<()> {
        let state = &self.state;
        let (point, list) = match side {
            Side::Buy => (state.buy_point, &mut legs.buys),
            Side::Sell => (state.sell_point, &mut legs.sells),
        };
        let uid = format!("{}/{}-{:06}", state.uid, side.as_str().to_lowercase(), list.len());
        list.push(Limiter::new(&uid, &state.exchange, &state.product_id, side, point)?);

        let saved = with_read_writer(rt.database.as_ref(), |tx| self.save_with(tx, legs));
        if let Err(e) = saved {
            match side {
                Side::Buy => legs.buys.pop(),
                Side::Sell => legs.sells.pop(),
            };
            return Err(e);
        }
        info!(%uid, "added new leg");
        Ok(())
    }

    async fn retry_after(&self, rt: &Runtime, scope: &CancelScope, what: &str, err: &LooperError) {
        if scope.is_cancelled() {
            return;
        }
        warn!(uid = %self.uid(), "{what} failed (retrying): {err}");
        let _ = scope.sleep(rt.options.retry_delay).await;
    }

    /// Trade until `scope` is cancelled
    ///
    /// # Errors
    /// Always returns an error once stopped: [`LooperError::Cancelled`] with
    /// the cancel cause, or [`LooperError::NegativeHoldings`] when holdings
    /// went negative. Negative holdings stop all trading but the call only
    /// returns after cancellation.
    pub async fn run(&self, rt: &Runtime, scope: &CancelScope) -> LooperResult<()> {
        let mut legs = self.legs.lock().await;
        let uid = self.uid();
        let (buy_point, sell_point) = (self.state.buy_point, self.state.sell_point);

        while !scope.is_cancelled() {
            self.publish_status(&legs);
            let (bought, sold) = (legs.bought(), legs.sold());
            let holdings = bought - sold;

            if holdings.is_negative() {
                warn!(%uid, %bought, %sold, %holdings, nbuys = legs.buys.len(), nsells = legs.sells.len(), "holdings are negative");
                for (i, b) in legs.buys.iter().enumerate() {
                    warn!(%uid, leg = %b.uid(), filled = %b.filled_size(), "buy {i}");
                }
                for (i, s) in legs.sells.iter().enumerate() {
                    warn!(%uid, leg = %s.uid(), filled = %s.filled_size(), "sell {i}");
                }
                let cause = scope.cancelled().await;
                info!(%uid, %cause, "looper stopped with negative holdings");
                return Err(LooperError::NegativeHoldings { uid: uid.to_string(), holdings });
            }

            if holdings < buy_point.size {
                info!(%uid, %holdings, size = %buy_point.size, "holding less than buy size, buying");
                if legs.buys.last().is_none_or(|b| b.pending_size().is_zero()) {
                    let added = async {
                        let price = self.wait_price_above(rt, scope, buy_point.price).await?;
                        info!(%uid, %price, buy_price = %buy_point.price, "price above buy point");
                        self.add_leg(rt, &mut legs, Side::Buy)
                    }
                    .await;
                    if let Err(e) = added {
                        self.retry_after(rt, scope, "adding buy leg", &e).await;
                        continue;
                    }
                }
                let Some(buy) = legs.buys.last_mut() else { continue };
                if let Err(e) = buy.run(rt, scope).await {
                    self.retry_after(rt, scope, "buy leg", &e).await;
                    continue;
                }
            }

            if holdings >= sell_point.size {
                info!(%uid, %holdings, size = %sell_point.size, "holding at least sell size, selling");
                if legs.sells.last().is_none_or(|s| s.pending_size().is_zero()) {
                    if let Err(e) = self.add_leg(rt, &mut legs, Side::Sell) {
                        self.retry_after(rt, scope, "adding sell leg", &e).await;
                        continue;
                    }
                }
                let Some(sell) = legs.sells.last_mut() else { continue };
                if let Err(e) = sell.run(rt, scope).await {
                    self.retry_after(rt, scope, "sell leg", &e).await;
                    continue;
                }

                if let (Some(buy), Some(sell)) = (legs.buys.last(), legs.sells.last()) {
                    let profit = pair_profit(buy, sell);
                    rt.messenger.send(
                        Utc::now(),
                        &format!(
                            "A sell is completed successfully at price {} in product {} ({}) with {} of profit.",
                            sell_point.price,
                            rt.product.product_id(),
                            rt.product.exchange_name(),
                            profit
                        ),
                    );
                }
            }
        }
        self.publish_status(&legs);
        Err(LooperError::Cancelled(scope.cause().unwrap_or(CancelCause::Shutdown)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryMessenger;
    use exchange::{Client, ClientOptions, PaperConfig, PaperExchange, PaperProductConfig};
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::Duration;
    use storage::{MemDb, with_reader};

    fn point(price: f64, size: f64) -> Point {
        Point::new(Px::new(price), Qty::new(size))
    }

    #[rstest]
    #[case::buy_above_sell("l", point(110.0, 1.0), point(100.0, 1.0))]
    #[case::zero_buy_size("l", point(100.0, 0.0), point(110.0, 1.0))]
    #[case::zero_sell_size("l", point(100.0, 1.0), point(110.0, 0.0))]
    #[case::slash_in_uid("a/b", point(100.0, 1.0), point(110.0, 1.0))]
    #[case::empty_uid("", point(100.0, 1.0), point(110.0, 1.0))]
    #[case::equal_prices("l", point(100.0, 1.0), point(100.0, 1.0))]
    fn test_rejects_bad_looper(#[case] uid: &str, #[case] buy: Point, #[case] sell: Point) {
        assert!(Looper::new(uid, "paper", "BTC-USD", buy, sell).is_err());
    }

    #[rstest]
    #[case::same_size(point(100.0, 1.0), point(110.0, 1.0))]
    #[case::sell_smaller(point(100.0, 2.0), point(110.0, 1.0))]
    fn test_accepts_looper(#[case] buy: Point, #[case] sell: Point) {
        assert!(Looper::new("l", "paper", "BTC-USD", buy, sell).is_ok());
    }

    #[tokio::test]
    async fn test_negative_holdings_stops_trading_until_cancelled() -> anyhow::Result<()> {
        let paper = Arc::new(PaperExchange::new(PaperConfig {
            products: vec![PaperProductConfig {
                product_id: "BTC-USD".to_string(),
                base_min_size: Qty::new(0.01),
                base_max_size: Qty::new(10.0),
                price: Px::new(120.0),
            }],
            ..PaperConfig::default()
        }));
        let client = Client::connect(paper.clone(), ClientOptions::default(), None).await?;
        let product = client.open_product("BTC-USD").await?;
        let rt = Runtime::new(product, Arc::new(MemDb::new()), Arc::new(MemoryMessenger::default()));
        let scope = CancelScope::new();

        // A filled sell with no buy behind it.
        let mut sell = Limiter::new("neg/sell-000000", "paper", "BTC-USD", Side::Sell, point(110.0, 1.0))?;
        sell.run(&rt, &scope).await?;
        assert_eq!(sell.filled_size(), Qty::new(1.0));
        assert_eq!(paper.orders_created(), 1);

        let looper = Arc::new(Looper::new("neg", "paper", "BTC-USD", point(100.0, 1.0), point(110.0, 1.0))?);
        looper.legs.lock().await.sells.push(sell);
        let handle = tokio::spawn({
            let (looper, rt, scope) = (looper.clone(), rt.clone(), scope.clone());
            async move { looper.run(&rt, &scope).await }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());
        assert_eq!(paper.orders_created(), 1);
        assert_eq!(looper.status().map(|s| s.holdings), Some(Qty::new(-1.0)));

        scope.cancel(CancelCause::Shutdown);
        let err = handle.await?.unwrap_err();
        assert!(matches!(err, LooperError::NegativeHoldings { ref uid, holdings } if uid == "neg" && holdings == Qty::new(-1.0)), "{err}");
        assert_eq!(paper.orders_created(), 1);
        client.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_save_load_and_list() {
        let db = MemDb::new();
        let looper = Looper::new("l-1", "paper", "BTC-USD", point(100.0, 1.0), point(110.0, 1.0)).unwrap();
        {
            let mut legs = looper.legs.lock().await;
            legs.buys.push(Limiter::new("l-1/buy-000000", "paper", "BTC-USD", Side::Buy, point(100.0, 1.0)).unwrap());
        }
        looper.persist(&db).await.unwrap();

        let ids = with_reader(&db, |r| Looper::list_ids(r)).unwrap();
        assert_eq!(ids, vec!["l-1".to_string()]);

        let loaded = with_reader(&db, |r| Looper::load(r, "l-1")).unwrap();
        let status = loaded.status().unwrap();
        assert_eq!(status.buys.len(), 1);
        assert_eq!(status.buys[0].state, LegState::Created);
        assert_eq!(status.holdings, Qty::ZERO);
        assert!(matches!(with_reader(&db, |r| Looper::load(r, "nope")), Err(LooperError::NotFound { .. })));
    }
}
