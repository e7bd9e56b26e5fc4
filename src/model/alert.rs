use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertDirection {
    Above,
    Below,
}

impl AlertDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Above => "above",
            Self::Below => "below",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "above" => Some(Self::Above),
            "below" => Some(Self::Below),
            _ => None,
        }
    }

    /// Direction implied by a threshold relative to the current price.
    pub fn relative_to(threshold: f64, current: f64) -> Self {
        if threshold > current {
            Self::Above
        } else {
            Self::Below
        }
    }
}

impl std::fmt::Display for AlertDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User threshold on one (exchange, pair).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceAlert {
    pub id: String,
    pub exchange: String,
    pub pair: String,
    pub price: f64,
    pub direction: AlertDirection,
    pub created_at: i64,
    pub is_triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<i64>,
}

impl PriceAlert {
    pub fn market_key(&self) -> String {
        market_key(&self.exchange, &self.pair)
    }

    /// Strict crossing test between two consecutive samples.
    pub fn crossed(&self, previous: f64, current: f64) -> bool {
        match self.direction {
            AlertDirection::Above => previous < self.price && current >= self.price,
            AlertDirection::Below => previous > self.price && current <= self.price,
        }
    }
}

pub fn market_key(exchange: &str, pair: &str) -> String {
    format!("{}:{}", exchange, pair)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(price: f64, direction: AlertDirection) -> PriceAlert {
        PriceAlert {
            id: "a".to_string(),
            exchange: "BINANCE".to_string(),
            pair: "BTCUSDT".to_string(),
            price,
            direction,
            created_at: 0,
            is_triggered: false,
            triggered_at: None,
        }
    }

    #[test]
    fn touching_from_the_far_side_counts_as_crossing() {
        let a = alert(105.0, AlertDirection::Above);
        assert!(a.crossed(104.0, 105.0));
        assert!(!a.crossed(105.0, 106.0));
        assert!(!a.crossed(106.0, 107.0));
    }

    #[test]
    fn below_requires_downward_move() {
        let a = alert(50.0, AlertDirection::Below);
        assert!(a.crossed(55.0, 49.0));
        assert!(!a.crossed(49.0, 48.0));
        assert!(!a.crossed(45.0, 55.0));
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(alert(1.0, AlertDirection::Below)).unwrap();
        assert_eq!(json["isTriggered"], false);
        assert_eq!(json["direction"], "below");
        assert!(json.get("triggeredAt").is_none());
    }
}
