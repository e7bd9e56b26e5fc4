use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::connection::{StreamConnection, StreamFrame};
use super::{lock, open_feed, FrameSink, StreamSettings};
use crate::event::ConnectionStatus;
use crate::exchange::types::{BinanceDepthEvent, BinanceTradeEvent, CombinedStreamEnvelope};
use crate::model::{MarketType, OrderBook, Trade};

pub const MAX_RECENT_TRADES: usize = 50;

pub type BookConsumer = Arc<dyn Fn(OrderBook) + Send + Sync>;
pub type TradeConsumer = Arc<dyn Fn(Trade) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum BookFrame {
    Book(OrderBook),
    Trade(Trade),
}

pub fn depth_stream(symbol: &str) -> String {
    format!("{}@depth20@100ms", symbol.to_ascii_lowercase())
}

pub fn trade_stream(symbol: &str) -> String {
    format!("{}@trade", symbol.to_ascii_lowercase())
}

pub fn decode_book_frame(text: &str) -> Option<BookFrame> {
    let envelope: CombinedStreamEnvelope = serde_json::from_str(text).ok()?;
    let channel = envelope.channel();
    if channel.starts_with("depth") {
        let event: BinanceDepthEvent = serde_json::from_value(envelope.data).ok()?;
        Some(BookFrame::Book(event.into_book()))
    } else if channel == "trade" {
        let event: BinanceTradeEvent = serde_json::from_value(envelope.data).ok()?;
        Some(BookFrame::Trade(event.into()))
    } else {
        None
    }
}

/// Callbacks for one book/trade consumer. Either side may be left out.
#[derive(Clone, Default)]
pub struct BookHandlers {
    on_book: Option<BookConsumer>,
    on_trade: Option<TradeConsumer>,
}

impl BookHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_book<F>(mut self, f: F) -> Self
    where
        F: Fn(OrderBook) + Send + Sync + 'static,
    {
        self.on_book = Some(Arc::new(f));
        self
    }

    pub fn on_trade<F>(mut self, f: F) -> Self
    where
        F: Fn(Trade) + Send + Sync + 'static,
    {
        self.on_trade = Some(Arc::new(f));
        self
    }
}

pub(crate) enum BookDelivery {
    Book(OrderBook, Vec<BookConsumer>),
    Trade(Trade, Vec<TradeConsumer>),
}

pub(crate) struct BookState {
    target: Option<(String, MarketType)>,
    generation: u64,
    connection: Option<StreamConnection>,
    dispatcher: Option<JoinHandle<()>>,
    consumers: BTreeMap<u64, BookHandlers>,
    recent_trades: VecDeque<Trade>,
    last_book: Option<OrderBook>,
    next_consumer_id: u64,
}

impl BookState {
    fn new() -> Self {
        Self {
            target: None,
            generation: 0,
            connection: None,
            dispatcher: None,
            consumers: BTreeMap::new(),
            recent_trades: VecDeque::with_capacity(MAX_RECENT_TRADES),
            last_book: None,
            next_consumer_id: 1,
        }
    }

    fn disconnect(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.close();
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
        self.recent_trades.clear();
        self.last_book = None;
    }

    fn connection_alive(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| !c.current_status().is_terminal())
    }

    fn push_trade(&mut self, trade: Trade) {
        self.recent_trades.push_front(trade);
        self.recent_trades.truncate(MAX_RECENT_TRADES);
    }
}

impl FrameSink for BookState {
    type Delivery = BookDelivery;

    fn accept(&mut self, frame: &StreamFrame) -> Option<BookDelivery> {
        if frame.generation != self.generation {
            tracing::trace!(
                frame_generation = frame.generation,
                generation = self.generation,
                "Dropping book frame from superseded connection"
            );
            return None;
        }
        match decode_book_frame(&frame.text)? {
            BookFrame::Book(book) => {
                self.last_book = Some(book.clone());
                let consumers = self
                    .consumers
                    .values()
                    .filter_map(|h| h.on_book.clone())
                    .collect();
                Some(BookDelivery::Book(book, consumers))
            }
            BookFrame::Trade(trade) => {
                self.push_trade(trade.clone());
                let consumers = self
                    .consumers
                    .values()
                    .filter_map(|h| h.on_trade.clone())
                    .collect();
                Some(BookDelivery::Trade(trade, consumers))
            }
        }
    }

    fn deliver(delivery: BookDelivery) {
        match delivery {
            BookDelivery::Book(book, consumers) => {
                for consumer in consumers {
                    consumer(book.clone());
                }
            }
            BookDelivery::Trade(trade, consumers) => {
                for consumer in consumers {
                    consumer(trade.clone());
                }
            }
        }
    }
}

/// Order-book depth and trade tape for a single symbol.
///
/// Switching symbol or market keeps the registered consumers and moves them
/// to the new stream. Handlers must not subscribe or shut the feed down from
/// inside a callback.
#[derive(Clone)]
pub struct BookTradeFeed {
    settings: Arc<StreamSettings>,
    state: Arc<Mutex<BookState>>,
    turn: Arc<Mutex<()>>,
}

impl BookTradeFeed {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            state: Arc::new(Mutex::new(BookState::new())),
            turn: Arc::new(Mutex::new(())),
        }
    }

    pub fn subscribe(&self, symbol: &str, market: MarketType, handlers: BookHandlers) -> BookSubscription {
        let target = (symbol.trim().to_ascii_lowercase(), market);
        let _turn = lock(&self.turn);
        let mut st = lock(&self.state);

        let id = st.next_consumer_id;
        st.next_consumer_id += 1;
        st.consumers.insert(id, handlers);

        let same_target = st.target.as_ref() == Some(&target);
        if !same_target || !st.connection_alive() {
            if let Some((old, _)) = st.target.as_ref().filter(|_| !same_target) {
                tracing::info!(from = %old, to = %target.0, "Switching book feed symbol");
            }
            st.disconnect();
            st.target = Some(target);
            self.reopen(&mut st);
        }

        BookSubscription {
            id,
            state: Arc::downgrade(&self.state),
        }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        remove_consumer(&self.state, id)
    }

    /// Most recent trades, newest first.
    pub fn recent_trades(&self) -> Vec<Trade> {
        lock(&self.state).recent_trades.iter().cloned().collect()
    }

    pub fn last_book(&self) -> Option<OrderBook> {
        lock(&self.state).last_book.clone()
    }

    pub fn symbol(&self) -> Option<String> {
        lock(&self.state).target.as_ref().map(|(s, _)| s.clone())
    }

    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    pub fn connection_status(&self) -> Option<watch::Receiver<ConnectionStatus>> {
        lock(&self.state).connection.as_ref().map(|c| c.status())
    }

    pub fn shutdown(&self) {
        let _turn = lock(&self.turn);
        let mut st = lock(&self.state);
        st.disconnect();
        st.consumers.clear();
        st.target = None;
    }

    fn reopen(&self, st: &mut BookState) {
        let Some((symbol, market)) = st.target.clone() else {
            return;
        };
        st.generation += 1;
        let generation = st.generation;
        tracing::info!(generation, symbol = %symbol, market = %market, "Opening book feed");
        let (connection, dispatcher) = open_feed(
            &self.settings,
            market,
            vec![depth_stream(&symbol), trade_stream(&symbol)],
            generation,
            Arc::downgrade(&self.state),
            Arc::clone(&self.turn),
        );
        st.connection = Some(connection);
        st.dispatcher = Some(dispatcher);
    }
}

fn remove_consumer(state: &Mutex<BookState>, id: u64) -> bool {
    let mut st = lock(state);
    if st.consumers.remove(&id).is_none() {
        return false;
    }
    if st.consumers.is_empty() {
        tracing::info!("Last book consumer left, closing feed");
        st.disconnect();
        st.target = None;
    }
    true
}

#[derive(Debug, Clone)]
pub struct BookSubscription {
    id: u64,
    state: Weak<Mutex<BookState>>,
}

impl BookSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(&self) -> bool {
        match self.state.upgrade() {
            Some(state) => remove_consumer(&state, self.id),
            None => false,
        }
    }
}
