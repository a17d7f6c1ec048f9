//! Client behaviour against the paper exchange: idempotent submission
//! across lost acknowledgements, order fan-out, fill capture and shutdown.

use anyhow::Result;
use common::{ClientOrderId, OrderStatus, Px, Qty, Side};
use exchange::{
    Client, ClientOptions, ClientProduct, CreateOrderRequest, Datastore, ExchangeApi, ExchangeError, PaperConfig,
    PaperExchange, PaperProductConfig, Product,
};
use rstest::*;
use std::sync::{Arc, Once};
use std::time::Duration;
use storage::{MemDb, StorageError};
use tokio::time::{sleep, timeout};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "exchange=debug,warn".into()))
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .init();
    });
}

const WAIT: Duration = Duration::from_secs(5);

fn paper() -> Arc<PaperExchange> {
    Arc::new(PaperExchange::new(PaperConfig {
        fee_bps: 10,
        products: vec![PaperProductConfig {
            product_id: "BTC-USD".to_string(),
            base_min_size: Qty::new(0.01),
            base_max_size: Qty::new(10.0),
            price: Px::new(105.0),
        }],
        ..PaperConfig::default()
    }))
}

fn options() -> ClientOptions {
    ClientOptions {
        feed_retry_interval: Duration::from_millis(10),
        order_poll_interval: Duration::from_millis(50),
        ..ClientOptions::default()
    }
}

async fn connect(ex: &Arc<PaperExchange>, datastore: Option<Arc<Datastore>>) -> Result<(Client, Arc<ClientProduct>)> {
    init_test_logging();
    let client = Client::connect(ex.clone(), options(), datastore).await?;
    let product = client.open_product("BTC-USD").await?;
    // Let the price watcher subscribe.
    sleep(Duration::from_millis(30)).await;
    Ok((client, product))
}

#[tokio::test]
async fn test_retry_after_lost_ack_reuses_order() -> Result<()> {
    let ex = paper();
    let (client, product) = connect(&ex, None).await?;
    let cid = ClientOrderId::new("ladder-buy-1");

    ex.drop_next_ack();
    let err = product.limit_buy(&cid, Qty::new(1.0), Px::new(100.0)).await.unwrap_err();
    assert!(err.is_retryable());

    // The order feed reports the order with its client id.
    timeout(WAIT, async {
        while client.lookup_client_id(&cid).is_none() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    let order_id = product.limit_buy(&cid, Qty::new(1.0), Px::new(100.0)).await?;
    assert_eq!(ex.orders_created(), 1);
    assert_eq!(product.get(&order_id).await?.client_order_id, Some(cid));

    client.close().await;
    Ok(())
}

#[rstest]
#[case(Side::Buy, 100.0, 99.0)]
#[case(Side::Sell, 110.0, 110.0)]
#[tokio::test]
async fn test_order_updates_reach_fill(#[case] side: Side, #[case] limit: f64, #[case] cross: f64) -> Result<()> {
    let ex = paper();
    let (client, product) = connect(&ex, None).await?;
    let cid = ClientOrderId::new(format!("fill-{side}"));

    let order_id = match side {
        Side::Buy => product.limit_buy(&cid, Qty::new(1.0), Px::new(limit)).await?,
        Side::Sell => product.limit_sell(&cid, Qty::new(1.0), Px::new(limit)).await?,
    };
    let mut updates = product.order_updates(&order_id).expect("order is tracked");
    assert!(product.order_updates(&common::OrderId::new("unknown")).is_none());

    ex.set_price("BTC-USD", Px::new(cross));
    let filled = timeout(WAIT, async {
        loop {
            match updates.recv().await {
                Some(o) if o.status == OrderStatus::Filled => return Some(o),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await?
    .expect("fill before close");
    assert_eq!(filled.filled_size, Qty::new(1.0));
    assert_eq!(filled.filled_price, Px::new(limit));
    assert!(filled.done);

    client.close().await;
    assert!(updates.recv().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_fills_are_saved() -> Result<()> {
    let ex = paper();
    let ds = Arc::new(Datastore::new(Arc::new(MemDb::new()), "paper"));
    let (client, product) = connect(&ex, Some(ds.clone())).await?;

    let order_id = product.limit_buy(&ClientOrderId::new("c-1"), Qty::new(2.0), Px::new(100.0)).await?;
    ex.set_price("BTC-USD", Px::new(100.0));

    let saved = timeout(WAIT, async {
        loop {
            let mut found = Vec::new();
            ds.scan_filled(Some("BTC-USD"), |o| {
                found.push(o.clone());
                Ok::<_, StorageError>(())
            })
            .expect("scan");
            if !found.is_empty() {
                return found;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].order_id, order_id);
    assert_eq!(saved[0].filled_size, Qty::new(2.0));
    assert!(ds.last_filled_time()?.is_some());

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_ticker_stream_starts_with_latest_price() -> Result<()> {
    let ex = paper();
    let (client, product) = connect(&ex, None).await?;

    let mut tickers = product.ticker_stream()?;
    assert_eq!(timeout(WAIT, tickers.recv()).await?.map(|t| t.price), Some(Px::new(105.0)));

    ex.set_price("BTC-USD", Px::new(107.5));
    assert_eq!(timeout(WAIT, tickers.recv()).await?.map(|t| t.price), Some(Px::new(107.5)));

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_feeds_reconnect() -> Result<()> {
    let ex = paper();
    let (client, product) = connect(&ex, None).await?;
    let mut tickers = product.ticker_stream()?;
    tickers.recv().await;

    ex.disconnect_feeds();
    sleep(Duration::from_millis(100)).await;

    ex.set_price("BTC-USD", Px::new(99.0));
    assert_eq!(timeout(WAIT, tickers.recv()).await?.map(|t| t.price), Some(Px::new(99.0)));

    let cid = ClientOrderId::new("after-reconnect");
    ex.drop_next_ack();
    assert!(product.limit_sell(&cid, Qty::new(1.0), Px::new(120.0)).await.is_err());
    timeout(WAIT, async {
        while client.lookup_client_id(&cid).is_none() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_close_is_idempotent() -> Result<()> {
    let ex = paper();
    let (client, product) = connect(&ex, None).await?;
    let mut tickers = product.ticker_stream()?;

    product.close().await;
    product.close().await;
    assert!(matches!(product.ticker_stream(), Err(ExchangeError::Closed)));
    assert_eq!(
        product.limit_buy(&ClientOrderId::new("late"), Qty::new(1.0), Px::new(100.0)).await,
        Err(ExchangeError::Closed)
    );
    // The latest price is still delivered before the stream ends.
    while tickers.recv().await.is_some() {}

    client.close().await;
    assert!(matches!(client.open_product("BTC-USD").await, Err(ExchangeError::Closed)));
    assert_eq!(ex.orders_created(), 0);
    Ok(())
}

#[tokio::test]
async fn test_invalid_size_never_reaches_exchange() -> Result<()> {
    let ex = paper();
    let (client, product) = connect(&ex, None).await?;

    let err = product.limit_buy(&ClientOrderId::new("tiny"), Qty::new(0.001), Px::new(100.0)).await.unwrap_err();
    assert!(matches!(err, ExchangeError::InvalidSize { .. }));
    assert_eq!(product.base_min_size(), Qty::new(0.01));
    assert_eq!(ex.orders_created(), 0);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_connect_backfills_fills_made_while_down() -> Result<()> {
    init_test_logging();
    let ex = paper();
    let ds = Arc::new(Datastore::new(Arc::new(MemDb::new()), "paper"));
    let cid = ClientOrderId::new("while-down");

    // No client is running while this order is placed and filled.
    let placed = ex
        .create_order(CreateOrderRequest {
            client_order_id: cid.clone(),
            product_id: "BTC-USD".to_string(),
            side: Side::Buy,
            size: Qty::new(1.0),
            price: Px::new(110.0),
        })
        .await?
        .order_id
        .expect("order id");

    let client = Client::connect(ex.clone(), options(), Some(ds.clone())).await?;
    assert_eq!(client.lookup_client_id(&cid), Some(placed.clone()));

    let mut saved = Vec::new();
    ds.scan_filled(None, |o| {
        saved.push(o.order_id.clone());
        Ok::<_, StorageError>(())
    })?;
    assert_eq!(saved, vec![placed]);

    // Resubmitting the same client id is answered from the refilled cache.
    let product = client.open_product("BTC-USD").await?;
    product.limit_buy(&cid, Qty::new(1.0), Px::new(110.0)).await?;
    assert_eq!(ex.orders_created(), 1);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_list_since_returns_done_orders() -> Result<()> {
    let ex = paper();
    let (client, product) = connect(&ex, None).await?;
    let started = chrono::Utc::now();

    let order_id = product.limit_buy(&ClientOrderId::new("quick"), Qty::new(1.0), Px::new(110.0)).await?;
    assert!(product.list().await?.is_empty());

    let recent = product.list_since(Some(started)).await?;
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].order_id, order_id);
    assert_eq!(recent[0].status, OrderStatus::Filled);

    client.close().await;
    Ok(())
}
