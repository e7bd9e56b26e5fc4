use async_trait::async_trait;
use serde_json::Value;

use super::{candles_to_bars, read_json, KlineSource};
use crate::error::{MarketDataError, Result};
use crate::model::{Bar, MarketType};

const MAX_KLINES_PER_REQUEST: u32 = 1000;

/// Map a timeframe in seconds to a Binance kline interval.
///
/// Sub-minute and unlisted timeframes fall back to `1m`.
pub fn binance_interval(timeframe_secs: i64) -> &'static str {
    match timeframe_secs {
        300 => "5m",
        900 => "15m",
        1_800 => "30m",
        3_600 => "1h",
        7_200 => "2h",
        14_400 => "4h",
        21_600 => "6h",
        28_800 => "8h",
        43_200 => "12h",
        86_400 => "1d",
        259_200 => "3d",
        604_800 => "1w",
        _ => "1m",
    }
}

/// Parse a `/klines` response (oldest-first array of arrays).
pub fn parse_binance_klines(payload: &Value, timeframe_secs: i64) -> Result<Vec<Bar>> {
    if let Some(code) = payload.get("code").and_then(Value::as_i64) {
        let msg = payload
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(MarketDataError::Api {
            exchange: "BINANCE".to_string(),
            code,
            msg,
        });
    }
    let rows = payload
        .as_array()
        .ok_or_else(|| MarketDataError::Format("binance: klines payload is not an array".into()))?;
    candles_to_bars("BINANCE", rows, timeframe_secs)
}

/// Binance spot or USD-M futures kline client.
pub struct BinanceKlines {
    http: reqwest::Client,
    base_url: String,
    market: MarketType,
}

impl BinanceKlines {
    pub fn spot(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            market: MarketType::Spot,
        }
    }

    pub fn futures(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            market: MarketType::Futures,
        }
    }

    fn endpoint(&self) -> String {
        match self.market {
            MarketType::Spot => format!("{}/api/v3/klines", self.base_url),
            MarketType::Futures => format!("{}/fapi/v1/klines", self.base_url),
        }
    }
}

#[async_trait]
impl KlineSource for BinanceKlines {
    fn exchange(&self) -> &str {
        match self.market {
            MarketType::Spot => "BINANCE",
            MarketType::Futures => "BINANCE_FUTURES",
        }
    }

    async fn fetch(
        &self,
        pair: &str,
        from_ms: i64,
        to_ms: i64,
        timeframe_secs: i64,
    ) -> Result<Vec<Bar>> {
        let symbol = pair.to_ascii_uppercase();
        let interval = binance_interval(timeframe_secs);
        tracing::debug!(
            exchange = self.exchange(),
            symbol = %symbol,
            interval,
            from_ms,
            to_ms,
            "Fetching klines"
        );

        let resp = self
            .http
            .get(self.endpoint())
            .query(&[
                ("symbol", symbol.as_str()),
                ("interval", interval),
                ("startTime", from_ms.to_string().as_str()),
                ("endTime", to_ms.to_string().as_str()),
                ("limit", MAX_KLINES_PER_REQUEST.to_string().as_str()),
            ])
            .send()
            .await?;

        let payload = read_json(self.exchange(), resp).await?;
        let bars = parse_binance_klines(&payload, timeframe_secs)?;
        tracing::debug!(exchange = self.exchange(), symbol = %symbol, count = bars.len(), "Fetched klines");
        Ok(bars)
    }
}
