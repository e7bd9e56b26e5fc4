use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("unexpected payload: {0}")]
    Format(String),

    #[error("{exchange} API error (code {code}): {msg}")]
    Api {
        exchange: String,
        code: i64,
        msg: String,
    },

    #[error("config error: {0}")]
    Config(String),
}

impl MarketDataError {
    /// Transport-level failures are worth retrying; payload and config problems are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Http { .. })
    }
}

impl From<reqwest::Error> for MarketDataError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Format(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for MarketDataError {
    fn from(e: serde_json::Error) -> Self {
        Self::Format(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MarketDataError>;
