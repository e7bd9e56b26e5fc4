use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use serde::Serialize;

use crate::error::{MarketDataError, Result};
use crate::exchange::KlineSource;
use crate::model::{Bar, Market};

/// Unified multi-exchange series plus each market's opening price.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalSeries {
    #[serde(rename = "data")]
    pub bars: Vec<Bar>,
    pub initial_prices: BTreeMap<String, f64>,
}

/// Fans a historical request out to per-exchange sources and merges the
/// results bucket by bucket.
pub struct HistoricalAggregator {
    sources: HashMap<String, Arc<dyn KlineSource>>,
    request_timeout: Duration,
    max_concurrency: usize,
}

impl HistoricalAggregator {
    pub fn new(request_timeout: Duration, max_concurrency: usize) -> Self {
        Self {
            sources: HashMap::new(),
            request_timeout,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Register a source under its exchange name. A later source with the
    /// same name replaces the earlier one.
    pub fn with_source(mut self, source: Arc<dyn KlineSource>) -> Self {
        self.sources
            .insert(source.exchange().to_ascii_uppercase(), source);
        self
    }

    pub fn exchanges(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }

    /// Fetch and merge `markets` (`EXCHANGE:PAIR` tokens) over `[from_ms, to_ms]`.
    ///
    /// Per-market failures are logged and leave that market out of the result.
    pub async fn aggregate(
        &self,
        markets: &[String],
        from_ms: i64,
        to_ms: i64,
        timeframe_secs: i64,
    ) -> Result<HistoricalSeries> {
        if timeframe_secs <= 0 {
            return Err(MarketDataError::Config(format!(
                "timeframe must be positive, got {}s",
                timeframe_secs
            )));
        }
        if from_ms > to_ms {
            return Err(MarketDataError::Config(format!(
                "from ({}) is after to ({})",
                from_ms, to_ms
            )));
        }

        let mut jobs = Vec::with_capacity(markets.len());
        for raw in markets {
            let Some(market) = Market::parse(raw) else {
                tracing::warn!(market = %raw, "Skipping malformed market token");
                continue;
            };
            let Some(source) = self.sources.get(&market.exchange).cloned() else {
                tracing::warn!(market = %raw, "No kline source for exchange, skipping");
                continue;
            };
            jobs.push((raw.clone(), market, source));
        }

        let timeout = self.request_timeout;
        // Box eagerly; the handler future is not Send over a lazy map.
        let fetches: Vec<_> = jobs
            .into_iter()
            .map(|(raw, market, source)| {
                async move {
                    let outcome = match tokio::time::timeout(
                        timeout,
                        source.fetch(&market.pair, from_ms, to_ms, timeframe_secs),
                    )
                    .await
                    {
                        Ok(res) => res,
                        Err(_) => Err(MarketDataError::Network(format!(
                            "timed out after {}ms",
                            timeout.as_millis()
                        ))),
                    };
                    (raw, outcome)
                }
                .boxed()
            })
            .collect();
        let mut results = stream::iter(fetches).buffer_unordered(self.max_concurrency);

        let mut merged: BTreeMap<i64, Bar> = BTreeMap::new();
        let mut initial_prices = BTreeMap::new();

        // Merge in completion order; close is last-writer-wins across markets.
        while let Some((raw, outcome)) = results.next().await {
            match outcome {
                Ok(bars) => {
                    tracing::debug!(market = %raw, count = bars.len(), "Merging bars");
                    if let Some(first) = bars.first() {
                        initial_prices.insert(raw.clone(), first.open);
                    }
                    merge_into(&mut merged, &bars, timeframe_secs);
                }
                Err(e) => {
                    tracing::warn!(market = %raw, error = %e, "Market contributes no data");
                }
            }
        }

        Ok(HistoricalSeries {
            bars: merged.into_values().collect(),
            initial_prices,
        })
    }
}

/// Fold `bars` into the `time -> Bar` map.
pub fn merge_into(merged: &mut BTreeMap<i64, Bar>, bars: &[Bar], timeframe_secs: i64) {
    for bar in bars {
        merged
            .entry(bar.time)
            .or_insert_with(|| Bar::new(bar.time, timeframe_secs))
            .merge_bar(bar);
    }
}
