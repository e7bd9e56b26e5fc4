pub mod backoff;
pub mod book;
pub mod connection;
pub mod ticker;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use backoff::ReconnectPolicy;
pub use book::{BookHandlers, BookSubscription, BookTradeFeed};
pub use connection::{StreamConnection, StreamFrame};
pub use ticker::{TickerStreamManager, TickerSubscription};

pub(crate) use crate::lock;
use crate::model::MarketType;

/// Endpoints and reconnect tuning shared by every stream manager.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub spot_url: String,
    pub futures_url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    /// Capacity of the frame channel between a socket task and its dispatcher.
    pub frame_buffer: usize,
}

impl StreamSettings {
    pub fn url_for(&self, market: MarketType) -> &str {
        match market {
            MarketType::Spot => &self.spot_url,
            MarketType::Futures => &self.futures_url,
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.initial_backoff, self.max_backoff, self.max_attempts)
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            spot_url: "wss://stream.binance.com:9443/stream".to_string(),
            futures_url: "wss://fstream.binance.com/stream".to_string(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_attempts: 10,
            frame_buffer: 1024,
        }
    }
}

/// Manager state that turns raw frames into consumer deliveries.
pub(crate) trait FrameSink: Send + 'static {
    type Delivery: Send;

    /// Runs under the state lock. Must drop frames from stale generations.
    fn accept(&mut self, frame: &StreamFrame) -> Option<Self::Delivery>;

    /// Runs outside the state lock while the feed's delivery turn is held.
    fn deliver(delivery: Self::Delivery);
}

/// Open a socket for `streams` and spawn the task that drains its frames
/// into `state`.
///
/// `turn` is held from accept through delivery. Managers take it while they
/// replay snapshots or swap connections, so consumers see deliveries in the
/// order they were accepted and never a frame accepted before a reopen.
pub(crate) fn open_feed<S: FrameSink>(
    settings: &StreamSettings,
    market: MarketType,
    streams: Vec<String>,
    generation: u64,
    state: Weak<Mutex<S>>,
    turn: Arc<Mutex<()>>,
) -> (StreamConnection, JoinHandle<()>) {
    let (frame_tx, mut frame_rx) = mpsc::channel::<StreamFrame>(settings.frame_buffer.max(1));
    let connection = StreamConnection::open(
        settings.url_for(market),
        streams,
        generation,
        settings.policy(),
        frame_tx,
    );
    let dispatcher = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let Some(state) = state.upgrade() else {
                break;
            };
            {
                let _turn = lock(&turn);
                let delivery = lock(&state).accept(&frame);
                if let Some(delivery) = delivery {
                    S::deliver(delivery);
                }
            }
        }
        tracing::trace!(generation, "Frame dispatcher finished");
    });
    (connection, dispatcher)
}
