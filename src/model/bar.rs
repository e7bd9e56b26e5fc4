use serde::Serialize;

use super::tick::TradeSide;

/// Floor a timestamp in seconds to the start of its `timeframe` bucket.
pub fn floor_time(ts_secs: i64, timeframe_secs: i64) -> i64 {
    assert!(timeframe_secs > 0, "timeframe_secs must be > 0");
    ts_secs.div_euclid(timeframe_secs) * timeframe_secs
}

/// OHLCV bucket with separate buy/sell volume and trade counts.
///
/// A bar starts empty (`open == 0` on the wire). Emptiness is tracked by
/// `filled` rather than by the zero price so a trade printed at 0 still
/// counts as the opening trade.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub vbuy: f64,
    pub vsell: f64,
    pub cbuy: u64,
    pub csell: u64,
    #[serde(skip)]
    filled: bool,
}

impl Bar {
    /// Empty bar whose `time` is aligned to `timeframe_secs`.
    pub fn new(time: i64, timeframe_secs: i64) -> Self {
        Self {
            time: floor_time(time, timeframe_secs),
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            vbuy: 0.0,
            vsell: 0.0,
            cbuy: 0,
            csell: 0,
            filled: false,
        }
    }

    /// Bar built from vendor candle data. `time` is taken as-is.
    #[allow(clippy::too_many_arguments)]
    pub fn from_ohlcv(
        time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        vbuy: f64,
        vsell: f64,
        cbuy: u64,
        csell: u64,
    ) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            vbuy,
            vsell,
            cbuy,
            csell,
            filled: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.filled
    }

    pub fn volume(&self) -> f64 {
        self.vbuy + self.vsell
    }

    pub fn trade_count(&self) -> u64 {
        self.cbuy + self.csell
    }

    /// Fold a single trade into the bar.
    pub fn merge_trade(&mut self, price: f64, qty: f64, side: TradeSide) {
        if self.filled {
            self.high = self.high.max(price);
            self.low = self.low.min(price);
        } else {
            self.open = price;
            self.high = price;
            self.low = price;
            self.filled = true;
        }
        self.close = price;

        match side {
            TradeSide::Buy => {
                self.vbuy += qty;
                self.cbuy += 1;
            }
            TradeSide::Sell => {
                self.vsell += qty;
                self.csell += 1;
            }
        }
    }

    /// Fold another bar of the same bucket into this one.
    ///
    /// `close` is last-writer-wins, so callers merge in arrival order.
    pub fn merge_bar(&mut self, source: &Bar) {
        if source.filled {
            if self.filled {
                self.high = self.high.max(source.high);
                self.low = self.low.min(source.low);
            } else {
                self.open = source.open;
                self.high = source.high;
                self.low = source.low;
                self.filled = true;
            }
            self.close = source.close;
        }

        self.vbuy += source.vbuy;
        self.vsell += source.vsell;
        self.cbuy += source.cbuy;
        self.csell += source.csell;
    }

    /// Fresh bar for `time` whose OHLC all start at `price` with no volume.
    pub fn seeded(time: i64, timeframe_secs: i64, price: f64) -> Self {
        let mut bar = Self::new(time, timeframe_secs);
        bar.open = price;
        bar.high = price;
        bar.low = price;
        bar.close = price;
        bar.filled = true;
        bar
    }
}
