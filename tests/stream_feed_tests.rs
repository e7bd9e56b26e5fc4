use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chartfeed::event::ConnectionStatus;
use chartfeed::model::MarketType;
use chartfeed::stream::{BookHandlers, BookTradeFeed, StreamSettings, TickerStreamManager};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// Local combined-stream endpoint. Records each handshake path, forwards
/// client text frames and broadcasts pushed frames to every open socket.
struct FakeExchange {
    addr: SocketAddr,
    paths: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: broadcast::Sender<String>,
}

impl FakeExchange {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (path_tx, paths) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, _) = broadcast::channel::<String>(64);
        let fanout = outbound.clone();

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let path_tx = path_tx.clone();
                let inbound_tx = inbound_tx.clone();
                let mut pushed = fanout.subscribe();
                tokio::spawn(async move {
                    let record = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        let _ = path_tx.send(req.uri().to_string());
                        Ok(resp)
                    };
                    let Ok(ws) = accept_hdr_async(tcp, record).await else {
                        return;
                    };
                    let (mut write, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = inbound_tx.send(text);
                                }
                                Some(Ok(_)) => {}
                                _ => break,
                            },
                            out = pushed.recv() => match out {
                                Ok(text) => {
                                    if write.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            },
                        }
                    }
                });
            }
        });

        Self {
            addr,
            paths,
            inbound,
            outbound,
        }
    }

    fn push(&self, frame: String) {
        let _ = self.outbound.send(frame);
    }
}

fn settings(addr: SocketAddr) -> StreamSettings {
    StreamSettings {
        spot_url: format!("ws://{}/stream", addr),
        futures_url: format!("ws://{}/fstream", addr),
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
        max_attempts: 3,
        frame_buffer: 64,
    }
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

fn ticker_frame(symbol: &str, price: &str) -> String {
    serde_json::json!({
        "stream": format!("{}@ticker", symbol),
        "data": {"e": "24hrTicker", "c": price, "P": "1.5", "v": "100", "h": price, "l": price}
    })
    .to_string()
}

fn trade_frame(symbol: &str, id: u64, price: &str, buyer_is_maker: bool) -> String {
    serde_json::json!({
        "stream": format!("{}@trade", symbol),
        "data": {"e": "trade", "t": id, "p": price, "q": "0.5", "T": 1_700_000_000_000u64 + id, "m": buyer_is_maker}
    })
    .to_string()
}

#[tokio::test]
/// Verifies the shared ticker stream: one socket for the symbol set, frames
/// folded into a snapshot, and late joiners replayed the current snapshot
/// without a second connection.
async fn ticker_snapshot_is_shared_and_replayed() {
    let mut exchange = FakeExchange::start().await;
    let manager = TickerStreamManager::new(settings(exchange.addr));

    let (tx, mut ticks) = mpsc::unbounded_channel();
    let first = manager.subscribe(&["BTCUSDT", "ethusdt"], MarketType::Spot, move |snap| {
        let _ = tx.send(snap);
    });

    let path = next(&mut exchange.paths).await;
    assert!(path.starts_with("/stream?"), "path {}", path);
    assert!(path.contains("streams=btcusdt@ticker/ethusdt@ticker"), "path {}", path);

    exchange.push(ticker_frame("btcusdt", "65000.5"));
    let snap = next(&mut ticks).await;
    assert_eq!(snap.len(), 1);
    assert_eq!(snap["btcusdt"].price, 65000.5);

    // Acks and unrelated symbols never reach consumers.
    exchange.push(r#"{"result":null,"id":1}"#.to_string());
    exchange.push(ticker_frame("dogeusdt", "0.1"));
    exchange.push(ticker_frame("ethusdt", "3200"));
    let snap = next(&mut ticks).await;
    assert_eq!(snap.len(), 2);
    assert_eq!(snap["ethusdt"].price, 3200.0);
    assert_eq!(snap["btcusdt"].price, 65000.5);

    let (late_tx, mut late) = mpsc::unbounded_channel();
    let second = manager.subscribe(&["ETHUSDT", "btcusdt"], MarketType::Spot, move |snap| {
        let _ = late_tx.send(snap);
    });
    let replay = late.try_recv().expect("replay is delivered during subscribe");
    assert_eq!(replay.len(), 2);
    assert_eq!(manager.generation(), 1);
    assert_eq!(manager.consumer_count(), 2);

    assert!(second.unsubscribe());
    assert!(!second.unsubscribe());
    assert_eq!(manager.consumer_count(), 1);

    assert!(first.unsubscribe());
    assert_eq!(manager.consumer_count(), 0);
    assert!(manager.connection_status().is_none());
    assert!(manager.snapshot().is_empty());
}

#[tokio::test]
/// Verifies adding and removing a symbol on a live stream sends control
/// requests over the open socket instead of reconnecting.
async fn symbol_changes_use_control_messages() {
    let mut exchange = FakeExchange::start().await;
    let manager = TickerStreamManager::new(settings(exchange.addr));
    let (tx, mut ticks) = mpsc::unbounded_channel();
    let _sub = manager.subscribe(&["btcusdt"], MarketType::Spot, move |snap| {
        let _ = tx.send(snap);
    });
    next(&mut exchange.paths).await;
    exchange.push(ticker_frame("btcusdt", "100"));
    next(&mut ticks).await;

    assert!(manager.add_symbol("SOLUSDT"));
    assert!(!manager.add_symbol("solusdt"));
    let control: serde_json::Value = serde_json::from_str(&next(&mut exchange.inbound).await).unwrap();
    assert_eq!(control["method"], "SUBSCRIBE");
    assert_eq!(control["params"], serde_json::json!(["solusdt@ticker"]));
    assert_eq!(control["id"], 1);

    assert!(manager.remove_symbol("BTCUSDT"));
    let control: serde_json::Value = serde_json::from_str(&next(&mut exchange.inbound).await).unwrap();
    assert_eq!(control["method"], "UNSUBSCRIBE");
    assert_eq!(control["params"], serde_json::json!(["btcusdt@ticker"]));
    assert_eq!(control["id"], 2);

    assert!(!manager.snapshot().contains_key("btcusdt"));
    assert_eq!(manager.symbols(), vec!["solusdt".to_string()]);
    assert_eq!(manager.generation(), 1);
}

#[tokio::test]
/// Verifies a subscribe with a different symbol set or market replaces the
/// connection and drops the previous consumers.
async fn new_stream_identity_replaces_consumers() {
    let mut exchange = FakeExchange::start().await;
    let manager = TickerStreamManager::new(settings(exchange.addr));
    let first = manager.subscribe(&["btcusdt"], MarketType::Spot, |_| {});
    next(&mut exchange.paths).await;

    let (tx, mut ticks) = mpsc::unbounded_channel();
    let _second = manager.subscribe(&["xrpusdt"], MarketType::Futures, move |snap| {
        let _ = tx.send(snap);
    });
    assert_eq!(manager.consumer_count(), 1);
    assert_eq!(manager.generation(), 2);
    assert!(!first.unsubscribe());

    let path = next(&mut exchange.paths).await;
    assert!(path.starts_with("/fstream?"), "path {}", path);
    assert!(path.contains("xrpusdt@ticker"), "path {}", path);

    exchange.push(ticker_frame("xrpusdt", "0.55"));
    let snap = next(&mut ticks).await;
    assert_eq!(snap.len(), 1);
    assert_eq!(snap["xrpusdt"].price, 0.55);
}

#[tokio::test]
/// Verifies reconnect gives up after the attempt budget and a later subscribe
/// with the same key opens a fresh connection.
async fn unreachable_endpoint_fails_then_resubscribe_reopens() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let manager = TickerStreamManager::new(settings(addr));
    let _sub = manager.subscribe(&["btcusdt"], MarketType::Spot, |_| {});
    let mut status = manager.connection_status().expect("connection opened");
    let terminal = timeout(Duration::from_secs(5), status.wait_for(|s| s.is_terminal()))
        .await
        .expect("timed out waiting for failure")
        .expect("status channel closed")
        .clone();
    assert_eq!(terminal, ConnectionStatus::Failed { attempts: 3 });

    let _again = manager.subscribe(&["btcusdt"], MarketType::Spot, |_| {});
    assert_eq!(manager.generation(), 2);
    assert_eq!(manager.consumer_count(), 2);
}

#[tokio::test]
/// Verifies the book feed publishes depth snapshots and trades, keeps the
/// tape newest first, and carries consumers across a symbol switch.
async fn book_feed_publishes_depth_and_trades() {
    let mut exchange = FakeExchange::start().await;
    let feed = BookTradeFeed::new(settings(exchange.addr));

    let (book_tx, mut books) = mpsc::unbounded_channel();
    let (trade_tx, mut trades) = mpsc::unbounded_channel();
    let sub = feed.subscribe(
        "BTCUSDT",
        MarketType::Spot,
        BookHandlers::new()
            .on_book(move |book| {
                let _ = book_tx.send(book);
            })
            .on_trade(move |trade| {
                let _ = trade_tx.send(trade);
            }),
    );
    let path = next(&mut exchange.paths).await;
    assert!(path.contains("btcusdt@depth20@100ms"), "path {}", path);
    assert!(path.contains("btcusdt@trade"), "path {}", path);

    exchange.push(
        serde_json::json!({
            "stream": "btcusdt@depth20@100ms",
            "data": {"lastUpdateId": 42, "bids": [["100.0", "1.5"], ["99.5", "2.0"]], "asks": [["100.5", "1.0"]]}
        })
        .to_string(),
    );
    let book = next(&mut books).await;
    assert_eq!(book.last_update_id, 42);
    assert_eq!(book.best_bid(), Some(100.0));
    assert_eq!(book.spread(), Some(0.5));
    assert_eq!(book.bids[1].total, 3.5);
    assert_eq!(feed.last_book(), Some(book));

    exchange.push(trade_frame("btcusdt", 1, "100.2", false));
    exchange.push(trade_frame("btcusdt", 2, "100.1", true));
    next(&mut trades).await;
    let second = next(&mut trades).await;
    assert_eq!(second.id, 2);
    let tape = feed.recent_trades();
    assert_eq!(tape.iter().map(|t| t.id).collect::<Vec<_>>(), vec![2, 1]);

    let _eth = feed.subscribe("ETHUSDT", MarketType::Spot, BookHandlers::new());
    assert_eq!(feed.generation(), 2);
    assert_eq!(feed.symbol().as_deref(), Some("ethusdt"));
    assert!(feed.recent_trades().is_empty());
    assert!(feed.last_book().is_none());

    let path = next(&mut exchange.paths).await;
    assert!(path.contains("ethusdt@trade"), "path {}", path);
    exchange.push(trade_frame("ethusdt", 7, "3200.0", false));
    let moved = next(&mut trades).await;
    assert_eq!(moved.id, 7);

    assert!(sub.unsubscribe());
    assert!(!sub.unsubscribe());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
/// Verifies a late joiner waits out an in-flight delivery and gets its replay
/// before any newer live snapshot.
async fn late_joiner_replay_precedes_live_deliveries() {
    let mut exchange = FakeExchange::start().await;
    let manager = TickerStreamManager::new(settings(exchange.addr));

    let (entered_tx, mut entered) = mpsc::unbounded_channel();
    let _slow = manager.subscribe(&["btcusdt"], MarketType::Spot, move |snap| {
        let _ = entered_tx.send(snap["btcusdt"].price);
        std::thread::sleep(Duration::from_millis(300));
    });
    next(&mut exchange.paths).await;
    exchange.push(ticker_frame("btcusdt", "100"));
    assert_eq!(next(&mut entered).await, 100.0);

    // The slow consumer is still inside the first delivery.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();
    let _late = manager.subscribe(&["btcusdt"], MarketType::Spot, {
        let seen = Arc::clone(&seen);
        move |snap| seen.lock().unwrap().push(snap["btcusdt"].price)
    });
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(*seen.lock().unwrap(), vec![100.0]);

    exchange.push(ticker_frame("btcusdt", "101"));
    assert_eq!(next(&mut entered).await, 101.0);
    timeout(Duration::from_secs(5), async {
        while seen.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("late joiner never saw the live snapshot");
    assert_eq!(*seen.lock().unwrap(), vec![100.0, 101.0]);
}
