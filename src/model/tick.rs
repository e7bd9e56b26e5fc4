use std::collections::HashMap;

use serde::Serialize;

/// Latest 24h ticker snapshot for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub change24h: f64,
    pub volume24h: f64,
    pub high24h: f64,
    pub low24h: f64,
}

/// Snapshot map handed to ticker consumers, keyed by lowercase symbol.
pub type TickSnapshot = HashMap<String, Tick>;

/// Fields decoded from a single ticker message.
#[derive(Debug, Clone, PartialEq)]
pub struct TickUpdate {
    pub price: f64,
    pub change24h: f64,
    pub volume24h: f64,
    pub high24h: f64,
    pub low24h: f64,
}

impl Tick {
    pub fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            price: 0.0,
            change24h: 0.0,
            volume24h: 0.0,
            high24h: 0.0,
            low24h: 0.0,
        }
    }

    /// Overwrite the snapshot in place with a fresh update.
    pub fn apply(&mut self, update: &TickUpdate) {
        self.price = update.price;
        self.change24h = update.change24h;
        self.volume24h = update.volume24h;
        self.high24h = update.high24h;
        self.low24h = update.low24h;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// Binance `m` flag: buyer is maker means the aggressor sold.
    pub fn from_buyer_maker(is_buyer_maker: bool) -> Self {
        if is_buyer_maker {
            Self::Sell
        } else {
            Self::Buy
        }
    }
}

/// Single executed trade as printed on an exchange tape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: u64,
    pub price: f64,
    pub quantity: f64,
    pub quote_qty: f64,
    pub time: u64,
    pub side: TradeSide,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_overwrites_in_place() {
        let mut tick = Tick::empty("btcusdt");
        tick.apply(&TickUpdate {
            price: 100.0,
            change24h: 1.5,
            volume24h: 10.0,
            high24h: 101.0,
            low24h: 95.0,
        });
        assert_eq!(tick.symbol, "btcusdt");
        assert!((tick.price - 100.0).abs() < f64::EPSILON);
        assert!((tick.low24h - 95.0).abs() < f64::EPSILON);
    }

    #[test]
    fn buyer_maker_is_a_sell() {
        assert_eq!(TradeSide::from_buyer_maker(true), TradeSide::Sell);
        assert_eq!(TradeSide::from_buyer_maker(false), TradeSide::Buy);
    }
}
