use serde::Deserialize;
use serde_json::Value;

use crate::model::{OrderBook, TickUpdate, Trade, TradeSide};

/// Deserialize exchange string-encoded numbers to f64.
pub fn string_to_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse::<f64>().map_err(serde::de::Error::custom)
}

pub fn string_or_number_to_f64_default<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Null => Ok(0.0),
        Value::String(s) => s.parse::<f64>().map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("invalid number")),
        _ => Err(serde::de::Error::custom("invalid numeric value")),
    }
}

/// Read a JSON cell that may be a number or a numeric string.
pub fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Envelope of the `/stream?streams=` endpoint: `{"stream": "...", "data": {...}}`.
#[derive(Debug, Deserialize)]
pub struct CombinedStreamEnvelope {
    pub stream: String,
    pub data: Value,
}

impl CombinedStreamEnvelope {
    /// `btcusdt@ticker` -> `btcusdt`.
    pub fn symbol(&self) -> String {
        self.stream
            .split('@')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase()
    }

    /// `btcusdt@depth20@100ms` -> `depth20`.
    pub fn channel(&self) -> &str {
        self.stream.split('@').nth(1).unwrap_or_default()
    }
}

/// Binance 24hr rolling ticker event (symbol@ticker).
#[derive(Debug, Deserialize)]
pub struct BinanceTickerEvent {
    #[serde(rename = "c", deserialize_with = "string_or_number_to_f64_default")]
    pub last_price: f64,
    #[serde(
        rename = "P",
        default,
        deserialize_with = "string_or_number_to_f64_default"
    )]
    pub price_change_percent: f64,
    #[serde(
        rename = "v",
        default,
        deserialize_with = "string_or_number_to_f64_default"
    )]
    pub volume: f64,
    #[serde(
        rename = "h",
        default,
        deserialize_with = "string_or_number_to_f64_default"
    )]
    pub high: f64,
    #[serde(
        rename = "l",
        default,
        deserialize_with = "string_or_number_to_f64_default"
    )]
    pub low: f64,
}

impl From<BinanceTickerEvent> for TickUpdate {
    fn from(e: BinanceTickerEvent) -> Self {
        Self {
            price: e.last_price,
            change24h: e.price_change_percent,
            volume24h: e.volume,
            high24h: e.high,
            low24h: e.low,
        }
    }
}

/// Binance trade stream event (symbol@trade).
#[derive(Debug, Deserialize)]
pub struct BinanceTradeEvent {
    #[serde(rename = "t")]
    pub trade_id: u64,
    #[serde(rename = "p", deserialize_with = "string_to_f64")]
    pub price: f64,
    #[serde(rename = "q", deserialize_with = "string_to_f64")]
    pub qty: f64,
    #[serde(rename = "T")]
    pub trade_time: u64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

impl From<BinanceTradeEvent> for Trade {
    fn from(e: BinanceTradeEvent) -> Self {
        Self {
            id: e.trade_id,
            price: e.price,
            quantity: e.qty,
            quote_qty: e.price * e.qty,
            time: e.trade_time,
            side: TradeSide::from_buyer_maker(e.is_buyer_maker),
        }
    }
}

/// Partial book depth event (symbol@depth20@100ms). Spot uses
/// `bids/asks/lastUpdateId`, futures uses `b/a/u`.
#[derive(Debug, Deserialize)]
pub struct BinanceDepthEvent {
    #[serde(alias = "b", default)]
    pub bids: Vec<[String; 2]>,
    #[serde(alias = "a", default)]
    pub asks: Vec<[String; 2]>,
    #[serde(rename = "lastUpdateId", alias = "u", default)]
    pub last_update_id: u64,
}

impl BinanceDepthEvent {
    pub fn into_book(self) -> OrderBook {
        let parse = |levels: &[[String; 2]]| -> Vec<(f64, f64)> {
            levels
                .iter()
                .filter_map(|[p, q]| Some((p.parse().ok()?, q.parse().ok()?)))
                .collect()
        };
        OrderBook::from_levels(&parse(&self.bids), &parse(&self.asks), self.last_update_id)
    }
}
