pub mod binance;
pub mod bybit;
pub mod okx;
pub mod types;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{MarketDataError, Result};
use crate::model::{floor_time, Bar};

pub use binance::BinanceKlines;
pub use bybit::BybitKlines;
pub use okx::OkxKlines;

/// Historical candle source for one exchange.
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Exchange name as it appears in `EXCHANGE:PAIR` market tokens.
    fn exchange(&self) -> &str;

    /// Fetch bars for `pair` in `[from_ms, to_ms]`, ascending by time.
    async fn fetch(
        &self,
        pair: &str,
        from_ms: i64,
        to_ms: i64,
        timeframe_secs: i64,
    ) -> Result<Vec<Bar>>;
}

/// Convert vendor candle rows `[open_time_ms, o, h, l, c, volume, ...]` into
/// ascending bars, one per `timeframe_secs` bucket. Rows finer than the
/// bucket (a fallback interval) are folded together in open-time order, and
/// repeated open times count once. Only total volume is known, so it is split
/// evenly between buy and sell.
pub(crate) fn candles_to_bars(
    exchange: &str,
    rows: &[Value],
    timeframe_secs: i64,
) -> Result<Vec<Bar>> {
    if timeframe_secs <= 0 {
        return Err(MarketDataError::Config(format!(
            "{exchange}: timeframe must be positive, got {timeframe_secs}s"
        )));
    }
    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let cells = row.as_array().ok_or_else(|| {
            MarketDataError::Format(format!("{exchange}: candle row is not an array"))
        })?;
        if cells.len() < 6 {
            return Err(MarketDataError::Format(format!(
                "{exchange}: candle row has {} cells, expected at least 6",
                cells.len()
            )));
        }
        let cell = |i: usize| {
            types::value_as_f64(&cells[i]).ok_or_else(|| {
                MarketDataError::Format(format!("{exchange}: non-numeric candle cell {i}"))
            })
        };
        let open_ms = types::value_as_i64(&cells[0]).ok_or_else(|| {
            MarketDataError::Format(format!("{exchange}: non-numeric candle open time"))
        })?;
        let volume = cell(5)?;
        let bar = Bar::from_ohlcv(
            floor_time(open_ms.div_euclid(1000), timeframe_secs),
            cell(1)?,
            cell(2)?,
            cell(3)?,
            cell(4)?,
            volume / 2.0,
            volume / 2.0,
            0,
            0,
        );
        candles.push((open_ms, bar));
    }
    candles.sort_by_key(|(open_ms, _)| *open_ms);
    candles.dedup_by_key(|(open_ms, _)| *open_ms);

    let mut bars: Vec<Bar> = Vec::with_capacity(candles.len());
    for (_, bar) in candles {
        match bars.last_mut() {
            Some(last) if last.time == bar.time => last.merge_bar(&bar),
            _ => bars.push(bar),
        }
    }
    Ok(bars)
}

/// Read a response body, turning non-2xx statuses into `MarketDataError::Http`.
pub(crate) async fn read_json(exchange: &str, resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(exchange, status = status.as_u16(), body = %body, "kline request failed");
        return Err(MarketDataError::Http {
            status: status.as_u16(),
            body,
        });
    }
    let text = resp.text().await?;
    Ok(serde_json::from_str(&text)?)
}
