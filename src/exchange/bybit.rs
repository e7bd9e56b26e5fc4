use async_trait::async_trait;
use serde_json::Value;

use super::{candles_to_bars, read_json, KlineSource};
use crate::error::{MarketDataError, Result};
use crate::model::Bar;

/// Map a timeframe in seconds to a Bybit v5 kline interval. Defaults to `1`.
pub fn bybit_interval(timeframe_secs: i64) -> &'static str {
    match timeframe_secs {
        300 => "5",
        900 => "15",
        1_800 => "30",
        3_600 => "60",
        7_200 => "120",
        14_400 => "240",
        21_600 => "360",
        43_200 => "720",
        86_400 => "D",
        604_800 => "W",
        _ => "1",
    }
}

/// Parse a `/v5/market/kline` response. `result.list` is newest-first.
pub fn parse_bybit_klines(payload: &Value, timeframe_secs: i64) -> Result<Vec<Bar>> {
    let code = payload.get("retCode").and_then(Value::as_i64).unwrap_or(0);
    if code != 0 {
        return Err(MarketDataError::Api {
            exchange: "BYBIT".to_string(),
            code,
            msg: payload
                .get("retMsg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    let Some(rows) = payload
        .get("result")
        .and_then(|r| r.get("list"))
        .and_then(Value::as_array)
    else {
        return Err(MarketDataError::Format(
            "bybit: missing result.list".to_string(),
        ));
    };
    candles_to_bars("BYBIT", rows, timeframe_secs)
}

pub struct BybitKlines {
    http: reqwest::Client,
    base_url: String,
}

impl BybitKlines {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl KlineSource for BybitKlines {
    fn exchange(&self) -> &str {
        "BYBIT"
    }

    async fn fetch(
        &self,
        pair: &str,
        from_ms: i64,
        to_ms: i64,
        timeframe_secs: i64,
    ) -> Result<Vec<Bar>> {
        let symbol = pair.to_ascii_uppercase();
        let interval = bybit_interval(timeframe_secs);
        let url = format!("{}/v5/market/kline", self.base_url);
        tracing::debug!(exchange = "BYBIT", symbol = %symbol, interval, "Fetching klines");

        let resp = self
            .http
            .get(&url)
            .query(&[
                ("category", "spot"),
                ("symbol", symbol.as_str()),
                ("interval", interval),
                ("start", from_ms.to_string().as_str()),
                ("end", to_ms.to_string().as_str()),
                ("limit", "1000"),
            ])
            .send()
            .await?;

        let payload = read_json("BYBIT", resp).await?;
        parse_bybit_klines(&payload, timeframe_secs)
    }
}
