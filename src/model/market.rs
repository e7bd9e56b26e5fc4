use serde::{Deserialize, Serialize};

/// Exchange + trading pair, written `EXCHANGE:PAIR` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Market {
    pub exchange: String,
    pub pair: String,
}

impl Market {
    /// Parse `BINANCE:BTCUSDT`. Returns `None` when either side is missing.
    pub fn parse(raw: &str) -> Option<Self> {
        let (exchange, pair) = raw.trim().split_once(':')?;
        let exchange = exchange.trim();
        let pair = pair.trim();
        if exchange.is_empty() || pair.is_empty() {
            return None;
        }
        Some(Self {
            exchange: exchange.to_ascii_uppercase(),
            pair: pair.to_ascii_uppercase(),
        })
    }
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.pair)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    #[default]
    Spot,
    Futures,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::Futures => "futures",
        }
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MarketType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spot" => Ok(Self::Spot),
            "futures" | "future" | "perp" => Ok(Self::Futures),
            other => Err(format!("unknown market type '{}'", other)),
        }
    }
}
