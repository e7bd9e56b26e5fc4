use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use super::notify::{format_price, Notifier, RepeatingSignal};
use super::store::{AlertStore, MemoryAlertStore};
use crate::error::{MarketDataError, Result};
use crate::lock;
use crate::model::alert::market_key;
use crate::model::{AlertDirection, PriceAlert};

pub const DEFAULT_SIGNAL_INTERVAL: Duration = Duration::from_secs(3);

/// Selects alerts by market and trigger state. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub exchange: Option<String>,
    pub pair: Option<String>,
    pub triggered: Option<bool>,
}

impl AlertFilter {
    pub fn market(exchange: &str, pair: &str) -> Self {
        Self {
            exchange: Some(exchange.to_string()),
            pair: Some(pair.to_string()),
            triggered: None,
        }
    }

    fn matches(&self, alert: &PriceAlert) -> bool {
        self.exchange
            .as_deref()
            .map_or(true, |e| e.eq_ignore_ascii_case(&alert.exchange))
            && self
                .pair
                .as_deref()
                .map_or(true, |p| p.eq_ignore_ascii_case(&alert.pair))
            && self.triggered.map_or(true, |t| t == alert.is_triggered)
    }
}

/// Notification text for a fired alert.
pub fn alert_message(alert: &PriceAlert) -> String {
    let verb = match alert.direction {
        AlertDirection::Above => "rose to",
        AlertDirection::Below => "fell to",
    };
    format!(
        "{} price {} {}",
        alert.pair.to_ascii_uppercase(),
        verb,
        format_price(alert.price)
    )
}

#[derive(Default)]
struct EngineState {
    alerts: Vec<PriceAlert>,
    last_prices: HashMap<String, f64>,
    signals: HashMap<String, RepeatingSignal>,
}

/// Per-market threshold crossing detector.
///
/// Every alert fires at most once: on the first sample pair that crosses its
/// threshold in the configured direction. The first price seen for a market
/// only primes the detector. A fired alert keeps signalling until dismissed.
pub struct AlertEngine {
    state: Mutex<EngineState>,
    store: Arc<dyn AlertStore>,
    notifier: Arc<dyn Notifier>,
    signal_interval: Duration,
    triggered_tx: broadcast::Sender<PriceAlert>,
}

impl AlertEngine {
    /// Engine backed by an in-memory store.
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self::with_store(Arc::new(MemoryAlertStore::new()), notifier)
    }

    /// Engine backed by `store`, restoring whatever it already holds.
    ///
    /// Restored triggered alerts stay silent until [`resume_signals`] is
    /// called, so the signal interval can be configured first.
    ///
    /// [`resume_signals`]: AlertEngine::resume_signals
    pub fn with_store(store: Arc<dyn AlertStore>, notifier: Arc<dyn Notifier>) -> Self {
        let alerts = match store.load_all() {
            Ok(alerts) => alerts,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to restore alerts, starting empty");
                Vec::new()
            }
        };
        tracing::info!(count = alerts.len(), "Alert engine ready");
        let (triggered_tx, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(EngineState {
                alerts,
                ..EngineState::default()
            }),
            store,
            notifier,
            signal_interval: DEFAULT_SIGNAL_INTERVAL,
            triggered_tx,
        }
    }

    pub fn with_signal_interval(mut self, every: Duration) -> Self {
        self.signal_interval = every;
        self
    }

    /// Start signalling every triggered alert that has no running signal,
    /// typically the ones restored from the store. Returns how many started.
    pub fn resume_signals(&self) -> usize {
        let silent: Vec<PriceAlert> = {
            let st = lock(&self.state);
            st.alerts
                .iter()
                .filter(|a| a.is_triggered)
                .filter(|a| !st.signals.get(&a.id).is_some_and(RepeatingSignal::is_running))
                .cloned()
                .collect()
        };
        for alert in &silent {
            tracing::info!(alert_id = %alert.id, market = %alert.market_key(), "Resuming alert signal");
            self.start_signal(alert);
        }
        silent.len()
    }

    /// Stream of alerts as they fire.
    pub fn subscribe_triggered(&self) -> broadcast::Receiver<PriceAlert> {
        self.triggered_tx.subscribe()
    }

    /// Create a pending alert.
    ///
    /// Without an explicit direction it is derived from `current_price`, then
    /// from the last price seen for the market, falling back to `Above`.
    pub fn create_alert(
        &self,
        exchange: &str,
        pair: &str,
        price: f64,
        direction: Option<AlertDirection>,
        current_price: Option<f64>,
    ) -> Result<PriceAlert> {
        if !price.is_finite() {
            return Err(MarketDataError::Config(format!(
                "alert threshold must be finite, got {}",
                price
            )));
        }
        let exchange = exchange.trim().to_ascii_uppercase();
        let pair = pair.trim().to_ascii_uppercase();

        let alert = {
            let mut st = lock(&self.state);
            let reference = current_price
                .filter(|p| p.is_finite())
                .or_else(|| st.last_prices.get(&market_key(&exchange, &pair)).copied());
            let direction = direction.unwrap_or_else(|| {
                reference
                    .map(|current| AlertDirection::relative_to(price, current))
                    .unwrap_or(AlertDirection::Above)
            });
            let alert = PriceAlert {
                id: uuid::Uuid::new_v4().to_string(),
                exchange,
                pair,
                price,
                direction,
                created_at: chrono::Utc::now().timestamp_millis(),
                is_triggered: false,
                triggered_at: None,
            };
            st.alerts.push(alert.clone());
            self.persist(&alert);
            alert
        };

        tracing::info!(
            alert_id = %alert.id,
            market = %alert.market_key(),
            price = alert.price,
            direction = %alert.direction,
            "Alert created"
        );
        Ok(alert)
    }

    /// Move a pending alert's threshold. Triggered alerts are immutable.
    pub fn update_alert(&self, id: &str, new_price: f64, current_price: f64) -> bool {
        if !new_price.is_finite() || !current_price.is_finite() {
            return false;
        }
        let updated = {
            let mut st = lock(&self.state);
            let Some(alert) = st
                .alerts
                .iter_mut()
                .find(|a| a.id == id && !a.is_triggered)
            else {
                return false;
            };
            alert.price = new_price;
            alert.direction = AlertDirection::relative_to(new_price, current_price);
            let updated = alert.clone();
            self.persist(&updated);
            updated
        };
        tracing::info!(alert_id = %id, price = new_price, direction = %updated.direction, "Alert updated");
        true
    }

    pub fn remove_alert(&self, id: &str) -> bool {
        let removed = {
            let mut st = lock(&self.state);
            if let Some(mut signal) = st.signals.remove(id) {
                signal.stop();
            }
            let before = st.alerts.len();
            st.alerts.retain(|a| a.id != id);
            let removed = st.alerts.len() != before;
            if removed {
                self.forget(id);
            }
            removed
        };
        if removed {
            tracing::info!(alert_id = %id, "Alert removed");
        }
        removed
    }

    /// Stop the alert's signal and remove it.
    pub fn dismiss(&self, id: &str) -> bool {
        let removed = self.remove_alert(id);
        if removed {
            tracing::info!(alert_id = %id, "Alert dismissed");
        }
        removed
    }

    /// Remove every triggered alert. Pending alerts are untouched.
    pub fn clear_triggered(&self) -> usize {
        let cleared: Vec<String> = {
            let mut st = lock(&self.state);
            let ids: Vec<String> = st
                .alerts
                .iter()
                .filter(|a| a.is_triggered)
                .map(|a| a.id.clone())
                .collect();
            st.alerts.retain(|a| !a.is_triggered);
            for id in &ids {
                if let Some(mut signal) = st.signals.remove(id) {
                    signal.stop();
                }
                self.forget(id);
            }
            ids
        };
        if !cleared.is_empty() {
            tracing::info!(count = cleared.len(), "Cleared triggered alerts");
        }
        cleared.len()
    }

    pub fn alerts(&self, filter: &AlertFilter) -> Vec<PriceAlert> {
        lock(&self.state)
            .alerts
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<PriceAlert> {
        lock(&self.state).alerts.iter().find(|a| a.id == id).cloned()
    }

    pub fn last_price(&self, exchange: &str, pair: &str) -> Option<f64> {
        let key = market_key(&exchange.trim().to_ascii_uppercase(), &pair.trim().to_ascii_uppercase());
        lock(&self.state).last_prices.get(&key).copied()
    }

    /// Number of alerts currently signalling.
    pub fn active_signals(&self) -> usize {
        lock(&self.state)
            .signals
            .values()
            .filter(|s| s.is_running())
            .count()
    }

    /// Stop all signals without removing any alert.
    pub fn silence_all(&self) {
        let mut st = lock(&self.state);
        for (_, mut signal) in st.signals.drain() {
            signal.stop();
        }
    }

    /// Feed one price sample. Returns the alerts that fired on it.
    pub fn check_price(&self, exchange: &str, pair: &str, price: f64) -> Vec<PriceAlert> {
        if !price.is_finite() {
            tracing::debug!(exchange, pair, "Ignoring non-finite price sample");
            return Vec::new();
        }
        let exchange = exchange.trim().to_ascii_uppercase();
        let pair = pair.trim().to_ascii_uppercase();

        let fired: Vec<PriceAlert> = {
            let mut st = lock(&self.state);
            let Some(previous) = st.last_prices.insert(market_key(&exchange, &pair), price) else {
                return Vec::new();
            };
            let now_ms = chrono::Utc::now().timestamp_millis();
            let fired: Vec<PriceAlert> = st
                .alerts
                .iter_mut()
                .filter(|a| !a.is_triggered && a.exchange == exchange && a.pair == pair)
                .filter(|a| a.crossed(previous, price))
                .map(|a| {
                    a.is_triggered = true;
                    a.triggered_at = Some(now_ms);
                    a.clone()
                })
                .collect();
            for alert in &fired {
                self.persist(alert);
            }
            fired
        };

        for alert in &fired {
            tracing::info!(
                alert_id = %alert.id,
                market = %alert.market_key(),
                threshold = alert.price,
                price,
                "Alert triggered"
            );
            self.start_signal(alert);
            let _ = self.triggered_tx.send(alert.clone());
        }
        fired
    }

    fn start_signal(&self, alert: &PriceAlert) {
        let signal = RepeatingSignal::start(
            Arc::clone(&self.notifier),
            alert.id.clone(),
            alert_message(alert),
            self.signal_interval,
        );
        let mut st = lock(&self.state);
        // Dismissed while the signal was starting: dropping it stops it.
        if !st.alerts.iter().any(|a| a.id == alert.id) {
            return;
        }
        if let Some(mut previous) = st.signals.insert(alert.id.clone(), signal) {
            previous.stop();
        }
    }

    // Store writes happen under the state lock so they land in the same
    // order as the in-memory changes.
    fn persist(&self, alert: &PriceAlert) {
        if let Err(e) = self.store.upsert(alert) {
            tracing::warn!(alert_id = %alert.id, error = %e, "Failed to persist alert");
        }
    }

    fn forget(&self, id: &str) {
        if let Err(e) = self.store.delete(id) {
            tracing::warn!(alert_id = %id, error = %e, "Failed to delete persisted alert");
        }
    }
}

impl Drop for AlertEngine {
    fn drop(&mut self) {
        self.silence_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_uses_four_decimals_below_one() {
        let mut alert = PriceAlert {
            id: "x".to_string(),
            exchange: "BINANCE".to_string(),
            pair: "dogeusdt".to_string(),
            price: 0.25,
            direction: AlertDirection::Below,
            created_at: 0,
            is_triggered: true,
            triggered_at: Some(1),
        };
        assert_eq!(alert_message(&alert), "DOGEUSDT price fell to 0.2500");
        alert.price = 65000.0;
        alert.direction = AlertDirection::Above;
        assert_eq!(alert_message(&alert), "DOGEUSDT price rose to 65000.00");
    }

    #[test]
    fn filter_matches_case_insensitively() {
        let filter = AlertFilter::market("binance", "btcusdt");
        let alert = PriceAlert {
            id: "y".to_string(),
            exchange: "BINANCE".to_string(),
            pair: "BTCUSDT".to_string(),
            price: 1.0,
            direction: AlertDirection::Above,
            created_at: 0,
            is_triggered: false,
            triggered_at: None,
        };
        assert!(filter.matches(&alert));
        assert!(!AlertFilter {
            triggered: Some(true),
            ..AlertFilter::default()
        }
        .matches(&alert));
    }
}
