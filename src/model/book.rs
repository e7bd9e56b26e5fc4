use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookLevel {
    pub price: f64,
    pub quantity: f64,
    /// Cumulative quantity from the top of book down to this level.
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub last_update_id: u64,
}

impl OrderBook {
    /// Build levels from `(price, quantity)` pairs, accumulating totals per side.
    pub fn from_levels(bids: &[(f64, f64)], asks: &[(f64, f64)], last_update_id: u64) -> Self {
        Self {
            bids: accumulate(bids),
            asks: accumulate(asks),
            last_update_id,
        }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn spread(&self) -> Option<f64> {
        Some(self.best_ask()? - self.best_bid()?)
    }
}

fn accumulate(levels: &[(f64, f64)]) -> Vec<BookLevel> {
    let mut total = 0.0;
    levels
        .iter()
        .map(|&(price, quantity)| {
            total += quantity;
            BookLevel {
                price,
                quantity,
                total,
            }
        })
        .collect()
}
