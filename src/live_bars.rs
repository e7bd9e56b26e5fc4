use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::event::BarEvent;
use crate::model::{floor_time, Bar, Trade};

pub const DEFAULT_TIMEFRAME_SECS: i64 = 300;

/// Builds the in-progress bar of a live chart from the trade tape.
#[derive(Debug, Clone)]
pub struct LiveBarAggregator {
    timeframe_secs: i64,
    active: Option<Bar>,
}

impl LiveBarAggregator {
    pub fn new(timeframe_secs: i64) -> Self {
        assert!(timeframe_secs > 0, "timeframe_secs must be > 0");
        Self {
            timeframe_secs,
            active: None,
        }
    }

    pub fn timeframe_secs(&self) -> i64 {
        self.timeframe_secs
    }

    pub fn active_bar(&self) -> Option<&Bar> {
        self.active.as_ref()
    }

    /// Merge one trade. Emits `Closed` for the previous bar when the trade
    /// falls in a new bucket, then `Update` for the active bar.
    pub fn on_trade(&mut self, trade: &Trade) -> Vec<BarEvent> {
        let bucket = floor_time((trade.time / 1000) as i64, self.timeframe_secs);
        let mut events = Vec::with_capacity(2);

        let stale = self.active.as_ref().is_some_and(|bar| bar.time != bucket);
        if stale {
            if let Some(prev) = self.active.take() {
                events.push(BarEvent::Closed(prev));
            }
        }

        let bar = self
            .active
            .get_or_insert_with(|| Bar::new(bucket, self.timeframe_secs));
        bar.merge_trade(trade.price, trade.quantity, trade.side);
        events.push(BarEvent::Update(bar.clone()));
        events
    }

    /// Wall-clock tick. Closes the active bar once `now_ms` has left its
    /// bucket and starts the next one at the previous close, so quiet
    /// markets still advance.
    pub fn roll(&mut self, now_ms: i64) -> Vec<BarEvent> {
        let Some(active) = self.active.as_ref() else {
            return Vec::new();
        };
        let bucket = floor_time(now_ms.div_euclid(1000), self.timeframe_secs);
        let mut events = Vec::with_capacity(2);

        if active.time != bucket {
            let previous_close = active.close;
            if let Some(prev) = self.active.replace(Bar::seeded(bucket, self.timeframe_secs, previous_close)) {
                events.push(BarEvent::Closed(prev));
            }
        }
        if let Some(bar) = self.active.as_ref() {
            events.push(BarEvent::Update(bar.clone()));
        }
        events
    }

    /// Continue from the last historical bar.
    pub fn init_active_bar(&mut self, bar: Option<Bar>) -> Option<BarEvent> {
        self.active = bar;
        self.active.clone().map(BarEvent::Update)
    }

    pub fn set_timeframe(&mut self, timeframe_secs: i64) {
        assert!(timeframe_secs > 0, "timeframe_secs must be > 0");
        self.timeframe_secs = timeframe_secs;
        self.active = None;
    }
}

/// Drive `aggregator` from a trade channel plus a periodic wall-clock roll,
/// handing every event to `sink` until shutdown or the channel closes.
pub async fn run_live_bars<F>(
    mut aggregator: LiveBarAggregator,
    mut trades: mpsc::UnboundedReceiver<Trade>,
    roll_every: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut sink: F,
) where
    F: FnMut(BarEvent) + Send,
{
    let mut ticker = tokio::time::interval(roll_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            trade = trades.recv() => match trade {
                Some(trade) => aggregator.on_trade(&trade).into_iter().for_each(&mut sink),
                None => break,
            },
            _ = ticker.tick() => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                aggregator.roll(now_ms).into_iter().for_each(&mut sink);
            }
        }
    }
    tracing::debug!("Live bar aggregation stopped");
}
