//! Market data records

use crate::types::{Px, Qty};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Last trade observation for one instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    /// Last traded price
    pub price: Px,
    /// Size of the last trade
    pub last_size: Qty,
    /// Observation time
    pub timestamp: DateTime<Utc>,
}

/// OHLCV candle for one interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Interval start
    pub start: DateTime<Utc>,
    /// Interval length in seconds
    pub duration_secs: u32,
    /// Open price
    pub open: Px,
    /// High price
    pub high: Px,
    /// Low price
    pub low: Px,
    /// Close price
    pub close: Px,
    /// Traded volume
    pub volume: Qty,
}

impl Candle {
    /// Start a candle from its first ticker
    #[must_use]
    pub fn open_at(start: DateTime<Utc>, duration_secs: u32, ticker: &Ticker) -> Self {
        Self {
            start,
            duration_secs,
            open: ticker.price,
            high: ticker.price,
            low: ticker.price,
            close: ticker.price,
            volume: ticker.last_size,
        }
    }

    /// Fold one more ticker into the candle
    pub fn update(&mut self, ticker: &Ticker) {
        self.high = self.high.max(ticker.price);
        self.low = self.low.min(ticker.price);
        self.close = ticker.price;
        self.volume += ticker.last_size;
    }

    /// End of the interval (exclusive)
    #[must_use]
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::seconds(i64::from(self.duration_secs))
    }
}

/// One rung of the ladder: trigger price and order size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    /// Limit price
    pub price: Px,
    /// Order size
    pub size: Qty,
}

impl Point {
    /// Create a point
    #[must_use]
    pub const fn new(price: Px, size: Qty) -> Self {
        Self { price, size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_candle_update() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let t = |p: f64| Ticker { price: Px::new(p), last_size: Qty::new(0.5), timestamp: start };
        let mut candle = Candle::open_at(start, 60, &t(100.0));
        candle.update(&t(105.0));
        candle.update(&t(95.0));
        candle.update(&t(101.0));
        assert_eq!(candle.open, Px::new(100.0));
        assert_eq!(candle.high, Px::new(105.0));
        assert_eq!(candle.low, Px::new(95.0));
        assert_eq!(candle.close, Px::new(101.0));
        assert_eq!(candle.volume, Qty::new(2.0));
        assert_eq!(candle.end(), start + Duration::seconds(60));
    }
}
