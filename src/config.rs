use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::MarketType;
use crate::stream::StreamSettings;

pub const CONFIG_PATH_ENV: &str = "CHARTFEED_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub exchanges: ExchangesConfig,
    pub historical: HistoricalConfig,
    pub stream: StreamConfig,
    pub alerts: AlertsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangesConfig {
    pub binance_rest_url: String,
    pub binance_futures_rest_url: String,
    pub bybit_rest_url: String,
    pub okx_rest_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoricalConfig {
    pub request_timeout: String,
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub spot_ws_url: String,
    pub futures_ws_url: String,
    pub initial_backoff: String,
    pub max_backoff: String,
    pub max_attempts: u32,
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,
    #[serde(default)]
    pub market: MarketType,
    #[serde(default)]
    pub symbols: Vec<String>,
    pub chart_symbol: String,
    pub chart_timeframe: String,
}

fn default_frame_buffer() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    pub db_path: String,
    pub signal_interval: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

/// Parse an interval string (e.g. "1s", "1m", "1h", "1d", "1w", "1M") into milliseconds.
pub fn parse_interval_ms(s: &str) -> Result<u64> {
    if s.len() < 2 {
        bail!("invalid interval '{}': expected format like '1m'", s);
    }

    let (num_str, suffix) = s.split_at(s.len() - 1);
    let n: u64 = num_str.parse().with_context(|| {
        format!(
            "invalid interval '{}': quantity must be a positive integer",
            s
        )
    })?;
    if n == 0 {
        bail!("invalid interval '{}': quantity must be > 0", s);
    }

    let unit_ms = match suffix {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        "M" => 30 * 86_400_000,
        _ => bail!(
            "invalid interval '{}': unsupported suffix '{}', expected one of s/m/h/d/w/M",
            s,
            suffix
        ),
    };

    n.checked_mul(unit_ms)
        .with_context(|| format!("invalid interval '{}': value is too large", s))
}

fn parse_duration(field: &str, s: &str) -> Result<Duration> {
    parse_interval_ms(s)
        .map(Duration::from_millis)
        .with_context(|| format!("{} is invalid", field))
}

fn check_url(field: &str, raw: &str, schemes: &[&str]) -> Result<()> {
    let parsed = url::Url::parse(raw).with_context(|| format!("{} is not a valid URL: {}", field, raw))?;
    if !schemes.contains(&parsed.scheme()) {
        bail!(
            "{} must use one of {:?}, got '{}'",
            field,
            schemes,
            parsed.scheme()
        );
    }
    Ok(())
}

impl StreamConfig {
    pub fn initial_backoff(&self) -> Result<Duration> {
        parse_duration("stream.initial_backoff", &self.initial_backoff)
    }

    pub fn max_backoff(&self) -> Result<Duration> {
        parse_duration("stream.max_backoff", &self.max_backoff)
    }

    pub fn chart_timeframe_secs(&self) -> Result<i64> {
        let ms = parse_interval_ms(&self.chart_timeframe)
            .context("stream.chart_timeframe is invalid")?;
        Ok((ms / 1_000) as i64)
    }

    /// Ticker symbols, upper-cased and de-duplicated, chart symbol first.
    pub fn ticker_symbols(&self) -> Vec<String> {
        let mut out = Vec::new();
        for sym in std::iter::once(&self.chart_symbol).chain(self.symbols.iter()) {
            let s = sym.trim().to_ascii_uppercase();
            if !s.is_empty() && !out.iter().any(|v| v == &s) {
                out.push(s);
            }
        }
        out
    }

    pub fn settings(&self) -> Result<StreamSettings> {
        Ok(StreamSettings {
            spot_url: self.spot_ws_url.clone(),
            futures_url: self.futures_ws_url.clone(),
            initial_backoff: self.initial_backoff()?,
            max_backoff: self.max_backoff()?,
            max_attempts: self.max_attempts,
            frame_buffer: self.frame_buffer,
        })
    }
}

impl HistoricalConfig {
    pub fn request_timeout(&self) -> Result<Duration> {
        parse_duration("historical.request_timeout", &self.request_timeout)
    }
}

impl AlertsConfig {
    pub fn signal_interval(&self) -> Result<Duration> {
        parse_duration("alerts.signal_interval", &self.signal_interval)
    }
}

impl Config {
    /// Read `.env`, then the TOML file named by `CHARTFEED_CONFIG`
    /// (default `config/default.toml`).
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config: Config = toml::from_str(&config_str)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.server
            .bind
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("server.bind is not a socket address: {}", self.server.bind))?;

        let http = ["http", "https"];
        check_url("exchanges.binance_rest_url", &self.exchanges.binance_rest_url, &http)?;
        check_url(
            "exchanges.binance_futures_rest_url",
            &self.exchanges.binance_futures_rest_url,
            &http,
        )?;
        check_url("exchanges.bybit_rest_url", &self.exchanges.bybit_rest_url, &http)?;
        check_url("exchanges.okx_rest_url", &self.exchanges.okx_rest_url, &http)?;

        let ws = ["ws", "wss"];
        check_url("stream.spot_ws_url", &self.stream.spot_ws_url, &ws)?;
        check_url("stream.futures_ws_url", &self.stream.futures_ws_url, &ws)?;

        self.historical.request_timeout()?;
        if self.historical.max_concurrency == 0 {
            bail!("historical.max_concurrency must be > 0");
        }

        let initial = self.stream.initial_backoff()?;
        let max = self.stream.max_backoff()?;
        if max < initial {
            bail!("stream.max_backoff must not be shorter than stream.initial_backoff");
        }
        if self.stream.max_attempts == 0 {
            bail!("stream.max_attempts must be > 0");
        }
        self.stream.chart_timeframe_secs()?;
        if self.stream.chart_symbol.trim().is_empty() {
            bail!("stream.chart_symbol must not be empty");
        }

        self.alerts.signal_interval()?;
        Ok(())
    }
}
