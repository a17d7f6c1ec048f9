//! ladderbot - runs buy/sell ladder loopers against the paper exchange

#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

mod config;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use common::{CancelCause, CancelScope};
use config::BotConfig;
use exchange::{Client, Datastore, ExchangeApi, PaperExchange};
use looper::{LogMessenger, Looper, LooperError, LooperStatus, Runtime};
use std::path::PathBuf;
use std::sync::Arc;
use storage::{MemDb, StorageError, with_reader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ladderbot")]
#[command(about = "Crash-recoverable ladder trading bot")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, short, default_value = "ladderbot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured looper until Ctrl-C
    Run,
    /// Print the saved state of every looper
    Status,
    /// Print saved filled orders
    Fills {
        /// Only this product
        #[arg(long)]
        product: Option<String>,
    },
    /// Print saved candles of a product
    Candles {
        /// Product id
        product: String,
        /// Inclusive start, RFC 3339
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Exclusive end, RFC 3339
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "ladderbot=info,looper=info,exchange=info".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = BotConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run => run(&config).await,
        Commands::Status => status(&config),
        Commands::Fills { product } => fills(&config, product.as_deref()),
        Commands::Candles { product, since, until } => candles(&config, &product, since, until),
    }
}

fn open_db(config: &BotConfig) -> Result<Arc<MemDb>> {
    let dir = config.db_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(Arc::new(MemDb::open(&dir)?))
}

async fn run(config: &BotConfig) -> Result<()> {
    let db = open_db(config)?;
    let datastore = Arc::new(Datastore::new(db.clone(), &config.exchange.name));
    let paper = Arc::new(PaperExchange::new(config.paper()));
    let client = Client::connect(paper.clone(), config.client_options(), Some(datastore)).await?;
    let messenger = Arc::new(LogMessenger);
    let scope = CancelScope::new();

    let mut tasks = Vec::new();
    for product in &config.exchange.products {
        tasks.push(paper.spawn_random_walk(&product.product_id, scope.child()));
    }

    let mut loopers = Vec::new();
    for ladder in &config.loopers {
        let uid = ladder.uid(paper.name());
        let product = client.open_product(&ladder.product_id).await?;
        let rt = Runtime::new(product, db.clone(), messenger.clone()).with_options(config.looper_options());

        let looper = match with_reader(db.as_ref(), |r| Looper::load(r, &uid)) {
            Ok(l) => l,
            Err(LooperError::NotFound { .. }) => {
                let l = Looper::new(&uid, paper.name(), &ladder.product_id, ladder.buy.into(), ladder.sell.into())?;
                l.persist(db.as_ref()).await?;
                info!(%uid, product_id = %ladder.product_id, "created looper");
                l
            }
            Err(e) => return Err(e.into()),
        };
        let looper = Arc::new(looper);
        if let Err(e) = looper.fix(&rt, &scope).await {
            error!(%uid, "could not repair looper state, not starting it: {e}");
            continue;
        }
        loopers.push((looper, rt));
    }

    let mut runs = Vec::new();
    for (looper, rt) in loopers {
        let scope = scope.child();
        runs.push(tokio::spawn(async move {
            let uid = looper.uid().to_string();
            match looper.run(&rt, &scope).await {
                Err(LooperError::Cancelled(cause)) => info!(%uid, %cause, "looper stopped"),
                Err(e) => error!(%uid, "looper stopped: {e}"),
                Ok(()) => {}
            }
        }));
    }
    info!(loopers = runs.len(), "running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    scope.cancel(CancelCause::Shutdown);
    for task in runs.into_iter().chain(tasks) {
        if let Err(e) = task.await {
            warn!("task failed: {e}");
        }
    }
    client.close().await;
    db.checkpoint()?;
    Ok(())
}

fn print_status(s: &LooperStatus) {
    println!("{} {} ({})", s.uid, s.product_id, s.exchange);
    println!("  buy {}@{}  sell {}@{}", s.buy_point.size, s.buy_point.price, s.sell_point.size, s.sell_point.price);
    println!("  holdings {}  fees {}  profit {}", s.holdings, s.fees, s.profit);
    for (side, legs) in [("buy", &s.buys), ("sell", &s.sells)] {
        for leg in legs {
            println!(
                "  {side} {} {} filled {} pending {} fees {} value {} orders {}",
                leg.uid, leg.state, leg.filled, leg.pending, leg.fees, leg.value, leg.orders
            );
        }
    }
}

fn status(config: &BotConfig) -> Result<()> {
    let db = open_db(config)?;
    with_reader(db.as_ref(), |r| {
        for uid in Looper::list_ids(r)? {
            if let Some(s) = Looper::load(r, &uid)?.status() {
                print_status(&s);
            }
        }
        Ok::<_, LooperError>(())
    })?;
    Ok(())
}

fn fills(config: &BotConfig, product: Option<&str>) -> Result<()> {
    let db = open_db(config)?;
    let datastore = Datastore::new(db, &config.exchange.name);
    datastore.scan_filled(product, |o| {
        println!("{o}");
        Ok::<_, StorageError>(())
    })?;
    match datastore.last_filled_time()? {
        Some(at) => println!("last fill bucket: {at}"),
        None => println!("no fills saved"),
    }
    Ok(())
}

fn candles(config: &BotConfig, product: &str, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Result<()> {
    let db = open_db(config)?;
    let datastore = Datastore::new(db, &config.exchange.name);
    datastore.scan_candles(product, since, until, |c| {
        println!("{} {}s o {} h {} l {} c {} v {}", c.start, c.duration_secs, c.open, c.high, c.low, c.close, c.volume);
        Ok::<_, StorageError>(())
    })?;
    Ok(())
}
