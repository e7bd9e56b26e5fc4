use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::connection::{StreamConnection, StreamFrame};
use super::{lock, open_feed, FrameSink, StreamSettings};
use crate::event::ConnectionStatus;
use crate::exchange::types::{BinanceTickerEvent, CombinedStreamEnvelope};
use crate::model::{MarketType, Tick, TickSnapshot, TickUpdate};

pub type TickConsumer = Arc<dyn Fn(TickSnapshot) + Send + Sync>;

/// Identity of a ticker stream: the symbol set plus market type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamKey {
    pub symbols: BTreeSet<String>,
    pub market: MarketType,
}

impl StreamKey {
    pub fn new<S: AsRef<str>>(symbols: &[S], market: MarketType) -> Self {
        let symbols = symbols
            .iter()
            .map(|s| s.as_ref().trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self { symbols, market }
    }

    pub fn streams(&self) -> Vec<String> {
        self.symbols.iter().map(|s| ticker_stream(s)).collect()
    }
}

pub fn ticker_stream(symbol: &str) -> String {
    format!("{}@ticker", symbol.to_ascii_lowercase())
}

/// Decode a combined-stream ticker frame. Anything else (subscribe acks,
/// other channels, garbage) yields `None`.
pub fn decode_ticker_frame(text: &str) -> Option<(String, TickUpdate)> {
    let envelope: CombinedStreamEnvelope = serde_json::from_str(text).ok()?;
    if envelope.channel() != "ticker" {
        return None;
    }
    let symbol = envelope.symbol();
    match serde_json::from_value::<BinanceTickerEvent>(envelope.data) {
        Ok(event) => Some((symbol, event.into())),
        Err(e) => {
            tracing::debug!(symbol = %symbol, error = %e, "Undecodable ticker payload");
            None
        }
    }
}

pub(crate) struct TickerState {
    key: Option<StreamKey>,
    generation: u64,
    connection: Option<StreamConnection>,
    dispatcher: Option<JoinHandle<()>>,
    snapshot: TickSnapshot,
    consumers: BTreeMap<u64, TickConsumer>,
    next_consumer_id: u64,
}

impl TickerState {
    fn new() -> Self {
        Self {
            key: None,
            generation: 0,
            connection: None,
            dispatcher: None,
            snapshot: TickSnapshot::new(),
            consumers: BTreeMap::new(),
            next_consumer_id: 1,
        }
    }

    fn close_connection(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.close();
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }

    fn teardown(&mut self) {
        self.close_connection();
        self.snapshot.clear();
    }

    fn needs_connection(&self) -> bool {
        let has_symbols = self.key.as_ref().is_some_and(|k| !k.symbols.is_empty());
        let alive = self
            .connection
            .as_ref()
            .is_some_and(|c| !c.current_status().is_terminal());
        has_symbols && !alive
    }
}

impl FrameSink for TickerState {
    type Delivery = (TickSnapshot, Vec<TickConsumer>);

    fn accept(&mut self, frame: &StreamFrame) -> Option<Self::Delivery> {
        if frame.generation != self.generation {
            tracing::trace!(
                frame_generation = frame.generation,
                generation = self.generation,
                "Dropping frame from superseded connection"
            );
            return None;
        }
        let (symbol, update) = decode_ticker_frame(&frame.text)?;
        if !self.key.as_ref()?.symbols.contains(&symbol) {
            return None;
        }
        self.snapshot
            .entry(symbol.clone())
            .or_insert_with(|| Tick::empty(&symbol))
            .apply(&update);
        Some((
            self.snapshot.clone(),
            self.consumers.values().cloned().collect(),
        ))
    }

    fn deliver((snapshot, consumers): Self::Delivery) {
        for consumer in consumers {
            consumer(snapshot.clone());
        }
    }
}

/// Shares one ticker connection among many consumers.
///
/// Subscribing with the same symbol set and market type attaches to the
/// running stream and gets the current snapshot straight away. A different
/// set replaces the stream and drops every existing consumer.
///
/// Consumers must not subscribe, add symbols or shut the manager down from
/// inside their callback.
#[derive(Clone)]
pub struct TickerStreamManager {
    settings: Arc<StreamSettings>,
    state: Arc<Mutex<TickerState>>,
    turn: Arc<Mutex<()>>,
}

impl TickerStreamManager {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            state: Arc::new(Mutex::new(TickerState::new())),
            turn: Arc::new(Mutex::new(())),
        }
    }

    pub fn subscribe<S, F>(&self, symbols: &[S], market: MarketType, on_tick: F) -> TickerSubscription
    where
        S: AsRef<str>,
        F: Fn(TickSnapshot) + Send + Sync + 'static,
    {
        let key = StreamKey::new(symbols, market);
        let consumer: TickConsumer = Arc::new(on_tick);

        // Held through the replay so no live delivery overtakes it.
        let _turn = lock(&self.turn);
        let (id, replay) = {
            let mut st = lock(&self.state);
            let same_key = st.key.as_ref() == Some(&key);
            if !same_key {
                if st.key.is_some() {
                    tracing::info!(
                        dropped_consumers = st.consumers.len(),
                        market = %market,
                        "Ticker stream identity changed, replacing connection"
                    );
                }
                st.teardown();
                st.consumers.clear();
                st.key = Some(key);
            }

            let id = st.next_consumer_id;
            st.next_consumer_id += 1;
            st.consumers.insert(id, Arc::clone(&consumer));

            if st.needs_connection() {
                self.reopen(&mut st);
            }

            let replay = (same_key && !st.snapshot.is_empty()).then(|| st.snapshot.clone());
            (id, replay)
        };

        if let Some(snapshot) = replay {
            consumer(snapshot);
        }

        TickerSubscription {
            id,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Remove a consumer. The connection closes with the last one.
    pub fn unsubscribe(&self, id: u64) -> bool {
        remove_consumer(&self.state, id)
    }

    /// Start streaming one more symbol on the live socket.
    pub fn add_symbol(&self, symbol: &str) -> bool {
        let symbol = symbol.trim().to_ascii_lowercase();
        if symbol.is_empty() {
            return false;
        }
        let _turn = lock(&self.turn);
        let mut st = lock(&self.state);
        let Some(key) = st.key.as_mut() else {
            return false;
        };
        if !key.symbols.insert(symbol.clone()) {
            return false;
        }
        if st.needs_connection() {
            self.reopen(&mut st);
        } else if let Some(conn) = st.connection.as_ref() {
            conn.subscribe(vec![ticker_stream(&symbol)]);
        }
        tracing::info!(symbol = %symbol, "Added symbol to ticker stream");
        true
    }

    /// Stop streaming a symbol and evict it from the snapshot.
    pub fn remove_symbol(&self, symbol: &str) -> bool {
        let symbol = symbol.trim().to_ascii_lowercase();
        let mut st = lock(&self.state);
        let Some(key) = st.key.as_mut() else {
            return false;
        };
        if !key.symbols.remove(&symbol) {
            return false;
        }
        st.snapshot.remove(&symbol);
        if let Some(conn) = st.connection.as_ref() {
            conn.unsubscribe(vec![ticker_stream(&symbol)]);
        }
        tracing::info!(symbol = %symbol, "Removed symbol from ticker stream");
        true
    }

    pub fn snapshot(&self) -> TickSnapshot {
        lock(&self.state).snapshot.clone()
    }

    pub fn symbols(&self) -> Vec<String> {
        lock(&self.state)
            .key
            .as_ref()
            .map(|k| k.symbols.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    pub fn consumer_count(&self) -> usize {
        lock(&self.state).consumers.len()
    }

    /// Status of the current connection, if one is open.
    pub fn connection_status(&self) -> Option<watch::Receiver<ConnectionStatus>> {
        lock(&self.state).connection.as_ref().map(|c| c.status())
    }

    /// Drop all consumers and close the connection.
    pub fn shutdown(&self) {
        let _turn = lock(&self.turn);
        let mut st = lock(&self.state);
        st.teardown();
        st.consumers.clear();
        st.key = None;
        tracing::info!("Ticker stream manager shut down");
    }

    fn reopen(&self, st: &mut TickerState) {
        st.close_connection();
        let Some(key) = st.key.as_ref() else {
            return;
        };
        st.generation += 1;
        let generation = st.generation;
        let market = key.market;
        let streams = key.streams();
        tracing::info!(generation, market = %market, symbols = streams.len(), "Opening ticker stream");
        let (connection, dispatcher) = open_feed(
            &self.settings,
            market,
            streams,
            generation,
            Arc::downgrade(&self.state),
            Arc::clone(&self.turn),
        );
        st.connection = Some(connection);
        st.dispatcher = Some(dispatcher);
    }
}

fn remove_consumer(state: &Mutex<TickerState>, id: u64) -> bool {
    let mut st = lock(state);
    if st.consumers.remove(&id).is_none() {
        return false;
    }
    if st.consumers.is_empty() {
        tracing::info!("Last ticker consumer left, closing stream");
        st.teardown();
        st.key = None;
    }
    true
}

/// Handle returned by [`TickerStreamManager::subscribe`].
#[derive(Debug, Clone)]
pub struct TickerSubscription {
    id: u64,
    state: Weak<Mutex<TickerState>>,
}

impl TickerSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Detach this consumer. Returns `false` if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        match self.state.upgrade() {
            Some(state) => remove_consumer(&state, self.id),
            None => false,
        }
    }
}
