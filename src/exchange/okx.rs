use async_trait::async_trait;
use serde_json::Value;

use super::{candles_to_bars, read_json, KlineSource};
use crate::error::{MarketDataError, Result};
use crate::model::Bar;

const QUOTE_SUFFIXES: [&str; 3] = ["USDT", "USDC", "USD"];

/// Map a timeframe in seconds to an OKX `bar` value. Defaults to `1m`.
pub fn okx_interval(timeframe_secs: i64) -> &'static str {
    match timeframe_secs {
        300 => "5m",
        900 => "15m",
        1_800 => "30m",
        3_600 => "1H",
        7_200 => "2H",
        14_400 => "4H",
        21_600 => "6H",
        43_200 => "12H",
        86_400 => "1D",
        604_800 => "1W",
        _ => "1m",
    }
}

/// `BTCUSDT` -> `BTC-USDT`. Pairs already dashed are only upper-cased.
pub fn okx_inst_id(pair: &str) -> String {
    let pair = pair.trim().to_ascii_uppercase();
    if pair.contains('-') {
        return pair;
    }
    for quote in QUOTE_SUFFIXES {
        if let Some(base) = pair.strip_suffix(quote) {
            if !base.is_empty() {
                return format!("{}-{}", base, quote);
            }
        }
    }
    pair
}

/// Parse a `/api/v5/market/candles` response. `data` is newest-first.
pub fn parse_okx_candles(payload: &Value, timeframe_secs: i64) -> Result<Vec<Bar>> {
    let code = payload
        .get("code")
        .and_then(|c| c.as_str().map(str::to_string).or_else(|| c.as_i64().map(|n| n.to_string())))
        .unwrap_or_else(|| "0".to_string());
    if code != "0" {
        return Err(MarketDataError::Api {
            exchange: "OKX".to_string(),
            code: code.parse().unwrap_or(-1),
            msg: payload
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    let rows = payload
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| MarketDataError::Format("okx: missing data array".to_string()))?;
    candles_to_bars("OKX", rows, timeframe_secs)
}

pub struct OkxKlines {
    http: reqwest::Client,
    base_url: String,
}

impl OkxKlines {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl KlineSource for OkxKlines {
    fn exchange(&self) -> &str {
        "OKX"
    }

    async fn fetch(
        &self,
        pair: &str,
        from_ms: i64,
        to_ms: i64,
        timeframe_secs: i64,
    ) -> Result<Vec<Bar>> {
        let inst_id = okx_inst_id(pair);
        let bar = okx_interval(timeframe_secs);
        let url = format!("{}/api/v5/market/candles", self.base_url);
        tracing::debug!(exchange = "OKX", inst_id = %inst_id, bar, "Fetching candles");

        // OKX paginates backwards: `after` bounds the newest row, `before` the oldest.
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("instId", inst_id.as_str()),
                ("bar", bar),
                ("before", from_ms.to_string().as_str()),
                ("after", to_ms.to_string().as_str()),
                ("limit", "300"),
            ])
            .send()
            .await?;

        let payload = read_json("OKX", resp).await?;
        parse_okx_candles(&payload, timeframe_secs)
    }
}
