//! Bot configuration loaded from TOML

use anyhow::{Context, Result, bail};
use common::{Point, Px, Qty};
use exchange::{ClientOptions, PaperConfig, PaperProductConfig};
use looper::LooperOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Directory holding the database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Simulated exchange
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Exchange client tuning
    #[serde(default)]
    pub client: ClientConfig,
    /// Looper tuning
    #[serde(default)]
    pub looper: LooperConfig,
    /// One entry per looper
    #[serde(default)]
    pub loopers: Vec<LadderConfig>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Paper exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Exchange name, also the datastore keyspace
    pub name: String,
    /// Fee in basis points
    pub fee_bps: i64,
    /// Random walk step size
    pub volatility: f64,
    /// Random walk step interval in milliseconds
    pub tick_interval_ms: u64,
    /// Random walk seed
    pub seed: Option<u64>,
    /// Listed products
    pub products: Vec<ProductConfig>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self { name: "paper".to_string(), fee_bps: 10, volatility: 0.002, tick_interval_ms: 1000, seed: None, products: Vec::new() }
    }
}

/// One listed product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductConfig {
    /// Product id
    pub product_id: String,
    /// Smallest order size
    pub base_min_size: f64,
    /// Largest order size
    pub base_max_size: f64,
    /// Opening price
    pub price: f64,
}

/// Exchange client tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long acknowledged client ids are remembered
    pub submit_cache_ttl_secs: u64,
    /// Feed reconnect delay in milliseconds
    pub feed_retry_interval_ms: u64,
    /// Open order poll interval in seconds
    pub order_poll_interval_secs: u64,
    /// Candle width in seconds
    pub candle_interval_secs: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let d = ClientOptions::default();
        Self {
            submit_cache_ttl_secs: d.submit_cache_ttl.as_secs(),
            feed_retry_interval_ms: u64::try_from(d.feed_retry_interval.as_millis()).unwrap_or(5000),
            order_poll_interval_secs: d.order_poll_interval.as_secs(),
            candle_interval_secs: d.candle_interval_secs,
        }
    }
}

/// Looper tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LooperConfig {
    /// Delay before retrying a failed leg, in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self { retry_delay_ms: 1000 }
    }
}

/// Price and size of a rung
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointConfig {
    /// Limit price
    pub price: f64,
    /// Order size
    pub size: f64,
}

impl From<PointConfig> for Point {
    fn from(p: PointConfig) -> Self {
        Self::new(Px::new(p.price), Qty::new(p.size))
    }
}

/// One buy/sell pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderConfig {
    /// Product traded
    pub product_id: String,
    /// Buy rung
    pub buy: PointConfig,
    /// Sell rung
    pub sell: PointConfig,
}

impl BotConfig {
    /// Read and validate the configuration at `path`
    ///
    /// # Errors
    /// Unreadable files, TOML errors and invalid ladders.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for ladder in &self.loopers {
            if !self.exchange.products.iter().any(|p| p.product_id == ladder.product_id) {
                bail!("looper product {} is not listed by the exchange", ladder.product_id);
            }
            if ladder.buy.price >= ladder.sell.price {
                bail!("{}: buy price {} must be below sell price {}", ladder.product_id, ladder.buy.price, ladder.sell.price);
            }
        }
        Ok(())
    }

    /// Paper exchange settings
    #[must_use]
    pub fn paper(&self) -> PaperConfig {
        PaperConfig {
            name: self.exchange.name.clone(),
            fee_bps: self.exchange.fee_bps,
            products: self
                .exchange
                .products
                .iter()
                .map(|p| PaperProductConfig {
                    product_id: p.product_id.clone(),
                    base_min_size: Qty::new(p.base_min_size),
                    base_max_size: Qty::new(p.base_max_size),
                    price: Px::new(p.price),
                })
                .collect(),
            volatility: self.exchange.volatility,
            tick_interval: Duration::from_millis(self.exchange.tick_interval_ms),
            seed: self.exchange.seed,
        }
    }

    /// Client settings
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            submit_cache_ttl: Duration::from_secs(self.client.submit_cache_ttl_secs),
            feed_retry_interval: Duration::from_millis(self.client.feed_retry_interval_ms),
            order_poll_interval: Duration::from_secs(self.client.order_poll_interval_secs),
            candle_interval_secs: self.client.candle_interval_secs,
        }
    }

    /// Looper settings
    #[must_use]
    pub fn looper_options(&self) -> LooperOptions {
        LooperOptions { retry_delay: Duration::from_millis(self.looper.retry_delay_ms) }
    }

    /// Database directory
    #[must_use]
    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}

impl LadderConfig {
    /// Stable looper id derived from the exchange, product and rungs
    #[must_use]
    pub fn uid(&self, exchange: &str) -> String {
        let name = format!(
            "{exchange}/{}/{}x{}/{}x{}",
            self.product_id, self.buy.price, self.buy.size, self.sell.price, self.sell.size
        );
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
data_dir = "/tmp/ladder"

[exchange]
fee_bps = 25
seed = 42

[[exchange.products]]
product_id = "BTC-USD"
base_min_size = 0.0001
base_max_size = 10.0
price = 100.0

[looper]
retry_delay_ms = 250

[[loopers]]
product_id = "BTC-USD"
buy = { price = 95.0, size = 0.5 }
sell = { price = 105.0, size = 0.5 }
"#;

    #[test]
    fn test_load_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = BotConfig::load(&path).unwrap();
        assert_eq!(config.db_dir(), PathBuf::from("/tmp/ladder/db"));
        assert_eq!(config.exchange.name, "paper");
        assert_eq!(config.paper().fee_bps, 25);
        assert_eq!(config.paper().products[0].price, Px::new(100.0));
        assert_eq!(config.looper_options().retry_delay, Duration::from_millis(250));
        assert_eq!(config.client_options().candle_interval_secs, 60);
        assert_eq!(Point::from(config.loopers[0].buy), Point::new(Px::new(95.0), Qty::new(0.5)));
    }

    #[test]
    fn test_uid_is_stable() {
        let config: BotConfig = toml::from_str(SAMPLE).unwrap();
        let ladder = &config.loopers[0];
        assert_eq!(ladder.uid("paper"), ladder.uid("paper"));
        assert_ne!(ladder.uid("paper"), ladder.uid("other"));
    }

    #[test]
    fn test_rejects_unlisted_product() {
        let mut config: BotConfig = toml::from_str(SAMPLE).unwrap();
        config.loopers[0].product_id = "ETH-USD".to_string();
        assert!(config.validate().is_err());
    }
}
