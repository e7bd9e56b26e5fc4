use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};

use chartfeed::alerts::{AlertEngine, AlertStore, LogNotifier, MemoryAlertStore, SqliteAlertStore};
use chartfeed::config::Config;
use chartfeed::event::BarEvent;
use chartfeed::exchange::{BinanceKlines, BybitKlines, OkxKlines};
use chartfeed::historical::HistoricalAggregator;
use chartfeed::live_bars::{run_live_bars, LiveBarAggregator};
use chartfeed::model::{MarketType, Trade};
use chartfeed::server::{self, AppState};
use chartfeed::stream::{BookHandlers, BookTradeFeed, TickerStreamManager};

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        config
            .logging
            .level
            .parse()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn exchange_for(market: MarketType) -> &'static str {
    match market {
        MarketType::Spot => "BINANCE",
        MarketType::Futures => "BINANCE_FUTURES",
    }
}

fn build_aggregator(config: &Config) -> Result<HistoricalAggregator> {
    let timeout = config.historical.request_timeout()?;
    let http = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")?;
    let ex = &config.exchanges;
    Ok(
        HistoricalAggregator::new(timeout, config.historical.max_concurrency)
            .with_source(Arc::new(BinanceKlines::spot(http.clone(), &ex.binance_rest_url)))
            .with_source(Arc::new(BinanceKlines::futures(
                http.clone(),
                &ex.binance_futures_rest_url,
            )))
            .with_source(Arc::new(BybitKlines::new(http.clone(), &ex.bybit_rest_url)))
            .with_source(Arc::new(OkxKlines::new(http, &ex.okx_rest_url))),
    )
}

fn build_alert_engine(config: &Config) -> Result<AlertEngine> {
    let store: Arc<dyn AlertStore> = match SqliteAlertStore::open(&config.alerts.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(error = %e, path = %config.alerts.db_path, "Alert store unavailable, alerts will not persist");
            Arc::new(MemoryAlertStore::new())
        }
    };
    let engine = AlertEngine::with_store(store, Arc::new(LogNotifier))
        .with_signal_interval(config.alerts.signal_interval()?);
    engine.resume_signals();
    Ok(engine)
}

async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.changed().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            eprintln!("Set CHARTFEED_CONFIG or provide config/default.toml");
            std::process::exit(1);
        }
    };
    init_tracing(&config);

    let market = config.stream.market;
    let exchange = exchange_for(market);
    tracing::info!(
        bind = %config.server.bind,
        market = %market,
        chart_symbol = %config.stream.chart_symbol,
        "Starting chartfeed"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let aggregator = Arc::new(build_aggregator(&config)?);
    let alerts = Arc::new(build_alert_engine(&config)?);
    let settings = config.stream.settings()?;

    // Ticker stream drives the alert engine.
    let tickers = TickerStreamManager::new(settings.clone());
    let alert_engine = Arc::clone(&alerts);
    let ticker_sub = tickers.subscribe(&config.stream.ticker_symbols(), market, move |snapshot| {
        for tick in snapshot.values() {
            alert_engine.check_price(exchange, &tick.symbol.to_ascii_uppercase(), tick.price);
        }
    });

    let mut triggered = alerts.subscribe_triggered();
    tokio::spawn(async move {
        while let Ok(alert) = triggered.recv().await {
            tracing::info!(alert_id = %alert.id, market = %alert.market_key(), "Alert fired");
        }
    });

    // Trade tape feeds the live chart bar.
    let book_feed = BookTradeFeed::new(settings);
    let (trade_tx, trade_rx) = mpsc::unbounded_channel::<Trade>();
    let book_sub = book_feed.subscribe(
        &config.stream.chart_symbol,
        market,
        BookHandlers::new().on_trade(move |trade| {
            let _ = trade_tx.send(trade);
        }),
    );
    let live_bars = LiveBarAggregator::new(config.stream.chart_timeframe_secs()?);
    let live_task = tokio::spawn(run_live_bars(
        live_bars,
        trade_rx,
        Duration::from_secs(1),
        shutdown_rx.clone(),
        |event| {
            if let BarEvent::Closed(bar) = event {
                tracing::info!(time = bar.time, open = bar.open, close = bar.close, volume = bar.volume(), "Bar closed");
            }
        },
    ));

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(addr = %addr, exchanges = ?aggregator.exchanges(), "HTTP server listening");

    let app = server::app(AppState { aggregator });
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_rx))
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    ticker_sub.unsubscribe();
    book_sub.unsubscribe();
    tickers.shutdown();
    book_feed.shutdown();
    alerts.silence_all();

    let _ = live_task.await;
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server error"),
        Err(e) => tracing::error!(error = %e, "HTTP server task failed"),
    }
    tracing::info!("chartfeed stopped");
    Ok(())
}
