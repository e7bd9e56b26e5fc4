use std::sync::{Arc, Mutex};
use std::time::Duration;

use chartfeed::alerts::{AlertEngine, AlertFilter, AlertStore, MemoryAlertStore, Notifier};
use chartfeed::error::MarketDataError;
use chartfeed::model::{AlertDirection, PriceAlert};

#[derive(Default)]
struct RecordingNotifier {
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn messages(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, alert_id: &str, message: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((alert_id.to_string(), message.to_string()));
    }
}

fn engine() -> (AlertEngine, Arc<RecordingNotifier>, Arc<MemoryAlertStore>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let store = Arc::new(MemoryAlertStore::new());
    let engine = AlertEngine::with_store(store.clone(), notifier.clone());
    (engine, notifier, store)
}

#[test]
/// Verifies upward crossing: [100, 104, 106] against 105/above fires only on
/// the 104 -> 106 sample, never on the first observation.
fn above_alert_fires_on_crossing_sample() {
    let (engine, notifier, _) = engine();
    let alert = engine
        .create_alert("BINANCE", "BTCUSDT", 105.0, Some(AlertDirection::Above), None)
        .unwrap();

    assert!(engine.check_price("BINANCE", "BTCUSDT", 100.0).is_empty());
    assert!(engine.check_price("BINANCE", "BTCUSDT", 104.0).is_empty());
    let fired = engine.check_price("BINANCE", "BTCUSDT", 106.0);

    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].id, alert.id);
    assert!(fired[0].is_triggered);
    assert!(fired[0].triggered_at.is_some());
    assert_eq!(notifier.messages(), vec!["BTCUSDT price rose to 105.00".to_string()]);
}

#[test]
/// Verifies downward crossing fires exactly once: [60, 55, 49] against
/// 50/below fires at 55 -> 49 and later samples do not re-fire.
fn below_alert_fires_exactly_once() {
    let (engine, _, _) = engine();
    engine
        .create_alert("BINANCE", "ETHUSDT", 50.0, Some(AlertDirection::Below), None)
        .unwrap();

    let mut fired = 0;
    for price in [60.0, 55.0, 49.0, 51.0, 48.0] {
        fired += engine.check_price("BINANCE", "ETHUSDT", price).len();
    }
    assert_eq!(fired, 1);
}

#[test]
/// Verifies the first observed price never fires, even when it is already
/// beyond the threshold.
fn first_sample_only_primes_detector() {
    let (engine, _, _) = engine();
    engine
        .create_alert("OKX", "SOLUSDT", 10.0, Some(AlertDirection::Above), None)
        .unwrap();
    assert!(engine.check_price("OKX", "SOLUSDT", 50.0).is_empty());
    assert!(engine.check_price("OKX", "SOLUSDT", 60.0).is_empty());
}

#[test]
/// Verifies non-finite samples are ignored entirely and do not replace the
/// last observed price.
fn non_finite_prices_are_ignored() {
    let (engine, _, _) = engine();
    engine
        .create_alert("BINANCE", "BTCUSDT", 105.0, Some(AlertDirection::Above), None)
        .unwrap();
    engine.check_price("BINANCE", "BTCUSDT", 100.0);
    assert!(engine.check_price("BINANCE", "BTCUSDT", f64::NAN).is_empty());
    assert!(engine.check_price("BINANCE", "BTCUSDT", f64::INFINITY).is_empty());
    assert_eq!(engine.last_price("BINANCE", "BTCUSDT"), Some(100.0));
    assert_eq!(engine.check_price("BINANCE", "BTCUSDT", 105.0).len(), 1);
}

#[test]
/// Verifies direction derivation: explicit wins, then the supplied current
/// price, then the last observed price, then `above`.
fn direction_is_derived_when_not_given() {
    let (engine, _, _) = engine();
    let a = engine.create_alert("BINANCE", "BTCUSDT", 90.0, None, Some(100.0)).unwrap();
    assert_eq!(a.direction, AlertDirection::Below);

    let b = engine.create_alert("BINANCE", "BTCUSDT", 90.0, None, None).unwrap();
    assert_eq!(b.direction, AlertDirection::Above);

    engine.check_price("BINANCE", "BTCUSDT", 80.0);
    let c = engine.create_alert("BINANCE", "BTCUSDT", 90.0, None, None).unwrap();
    assert_eq!(c.direction, AlertDirection::Above);
    let d = engine.create_alert("BINANCE", "BTCUSDT", 70.0, None, None).unwrap();
    assert_eq!(d.direction, AlertDirection::Below);

    let e = engine
        .create_alert("BINANCE", "BTCUSDT", 70.0, Some(AlertDirection::Above), Some(100.0))
        .unwrap();
    assert_eq!(e.direction, AlertDirection::Above);
}

#[test]
/// Verifies a non-finite threshold is rejected as a configuration error.
fn non_finite_threshold_is_rejected() {
    let (engine, _, _) = engine();
    assert!(matches!(
        engine.create_alert("BINANCE", "BTCUSDT", f64::NAN, None, None),
        Err(MarketDataError::Config(_))
    ));
}

#[test]
/// Verifies updates only apply to pending alerts and recompute direction.
fn update_only_touches_pending_alerts() {
    let (engine, _, _) = engine();
    let alert = engine
        .create_alert("BINANCE", "BTCUSDT", 105.0, Some(AlertDirection::Above), None)
        .unwrap();
    assert!(engine.update_alert(&alert.id, 95.0, 100.0));
    assert_eq!(engine.get(&alert.id).unwrap().direction, AlertDirection::Below);

    engine.check_price("BINANCE", "BTCUSDT", 100.0);
    engine.check_price("BINANCE", "BTCUSDT", 94.0);
    assert!(engine.get(&alert.id).unwrap().is_triggered);
    assert!(!engine.update_alert(&alert.id, 200.0, 100.0));
    assert_eq!(engine.get(&alert.id).unwrap().price, 95.0);
}

#[test]
/// Verifies clear_triggered removes triggered alerts and keeps pending ones.
fn clear_triggered_keeps_pending() {
    let (engine, _, store) = engine();
    let fired = engine
        .create_alert("BINANCE", "BTCUSDT", 105.0, Some(AlertDirection::Above), None)
        .unwrap();
    let pending = engine
        .create_alert("BINANCE", "BTCUSDT", 200.0, Some(AlertDirection::Above), None)
        .unwrap();
    engine.check_price("BINANCE", "BTCUSDT", 100.0);
    engine.check_price("BINANCE", "BTCUSDT", 110.0);

    assert_eq!(engine.clear_triggered(), 1);
    let left = engine.alerts(&AlertFilter::default());
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, pending.id);
    assert!(store.get(&fired.id).is_none());
    assert!(store.get(&pending.id).is_some());
}

#[test]
/// Verifies every mutation is written through to the store and that a new
/// engine restores persisted alerts.
fn store_is_written_through_and_restored() {
    let (engine, _, store) = engine();
    let alert = engine
        .create_alert("bybit", "btcusdt", 105.0, Some(AlertDirection::Above), None)
        .unwrap();
    assert_eq!(alert.exchange, "BYBIT");
    assert_eq!(alert.pair, "BTCUSDT");
    assert!(!store.get(&alert.id).unwrap().is_triggered);

    engine.check_price("BYBIT", "BTCUSDT", 100.0);
    engine.check_price("BYBIT", "BTCUSDT", 105.0);
    assert!(store.get(&alert.id).unwrap().is_triggered);

    let restored = AlertEngine::with_store(store.clone(), Arc::new(RecordingNotifier::default()));
    assert_eq!(restored.alerts(&AlertFilter::market("BYBIT", "BTCUSDT")).len(), 1);

    assert!(engine.dismiss(&alert.id));
    assert!(store.is_empty());
    assert!(!engine.dismiss(&alert.id));
}

#[test]
/// Verifies filtering by market and trigger state.
fn alerts_filter_by_market_and_state() {
    let (engine, _, _) = engine();
    engine
        .create_alert("BINANCE", "BTCUSDT", 1.0, Some(AlertDirection::Above), None)
        .unwrap();
    engine
        .create_alert("OKX", "BTCUSDT", 1.0, Some(AlertDirection::Above), None)
        .unwrap();
    assert_eq!(engine.alerts(&AlertFilter::default()).len(), 2);
    assert_eq!(engine.alerts(&AlertFilter::market("okx", "btcusdt")).len(), 1);
    let triggered = AlertFilter {
        triggered: Some(true),
        ..AlertFilter::default()
    };
    assert!(engine.alerts(&triggered).is_empty());
}

#[tokio::test]
/// Verifies the notification signal repeats until the alert is dismissed and
/// stops afterwards.
async fn signal_repeats_until_dismissed() {
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = AlertEngine::with_store(Arc::new(MemoryAlertStore::new()), notifier.clone())
        .with_signal_interval(Duration::from_millis(20));
    let mut triggered = engine.subscribe_triggered();

    let alert = engine
        .create_alert("BINANCE", "DOGEUSDT", 0.5, Some(AlertDirection::Below), None)
        .unwrap();
    engine.check_price("BINANCE", "DOGEUSDT", 0.6);
    engine.check_price("BINANCE", "DOGEUSDT", 0.4);
    assert_eq!(triggered.recv().await.unwrap().id, alert.id);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(notifier.count() >= 3, "expected repeats, got {}", notifier.count());
    assert_eq!(engine.active_signals(), 1);
    assert_eq!(notifier.messages()[0], "DOGEUSDT price fell to 0.5000");

    assert!(engine.dismiss(&alert.id));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after_dismiss = notifier.count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(notifier.count(), after_dismiss);
    assert_eq!(engine.active_signals(), 0);
}

#[test]
/// Verifies the store trait object is usable directly.
fn memory_store_load_all() {
    let store = MemoryAlertStore::new();
    assert!(store.load_all().unwrap().is_empty());
}

/// Store whose writes of triggered alerts are slow, widening the window
/// between a trigger and its store write.
#[derive(Default)]
struct SlowTriggerStore {
    inner: MemoryAlertStore,
}

impl AlertStore for SlowTriggerStore {
    fn upsert(&self, alert: &PriceAlert) -> anyhow::Result<()> {
        if alert.is_triggered {
            std::thread::sleep(Duration::from_millis(200));
        }
        self.inner.upsert(alert)
    }

    fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.inner.delete(id)
    }

    fn load_all(&self) -> anyhow::Result<Vec<PriceAlert>> {
        self.inner.load_all()
    }
}

#[test]
/// Verifies a dismiss racing a slow trigger write leaves nothing behind in
/// the store.
fn dismiss_during_trigger_write_is_not_undone() {
    let store = Arc::new(SlowTriggerStore::default());
    let engine = Arc::new(AlertEngine::with_store(
        store.clone(),
        Arc::new(RecordingNotifier::default()),
    ));
    let alert = engine
        .create_alert("BINANCE", "BTCUSDT", 105.0, Some(AlertDirection::Above), None)
        .unwrap();
    engine.check_price("BINANCE", "BTCUSDT", 100.0);

    let trigger = std::thread::spawn({
        let engine = Arc::clone(&engine);
        move || engine.check_price("BINANCE", "BTCUSDT", 106.0).len()
    });
    std::thread::sleep(Duration::from_millis(50));
    let dismissed = engine.dismiss(&alert.id);
    let fired = trigger.join().unwrap();

    assert_eq!(fired, 1);
    assert!(dismissed);
    assert!(engine.get(&alert.id).is_none());
    assert!(store.inner.get(&alert.id).is_none(), "dismissed alert came back");
    assert!(store.load_all().unwrap().is_empty());
}

#[tokio::test]
/// Verifies triggered alerts restored from the store signal again once the
/// engine resumes signals, and stop when dismissed.
async fn restored_triggered_alerts_resume_signalling() {
    let store = Arc::new(MemoryAlertStore::new());
    let alert = {
        let first = AlertEngine::with_store(store.clone(), Arc::new(RecordingNotifier::default()));
        let alert = first
            .create_alert("OKX", "ETHUSDT", 2_000.0, Some(AlertDirection::Above), None)
            .unwrap();
        first.check_price("OKX", "ETHUSDT", 1_990.0);
        assert_eq!(first.check_price("OKX", "ETHUSDT", 2_010.0).len(), 1);
        alert
    };
    store
        .upsert(&PriceAlert {
            id: "pending".to_string(),
            exchange: "OKX".to_string(),
            pair: "ETHUSDT".to_string(),
            price: 3_000.0,
            direction: AlertDirection::Above,
            created_at: 0,
            is_triggered: false,
            triggered_at: None,
        })
        .unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let restored = AlertEngine::with_store(store.clone(), notifier.clone())
        .with_signal_interval(Duration::from_millis(20));
    assert_eq!(restored.active_signals(), 0);

    assert_eq!(restored.resume_signals(), 1);
    assert_eq!(restored.resume_signals(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(restored.active_signals(), 1);
    assert!(notifier.count() >= 2, "expected repeats, got {}", notifier.count());
    assert_eq!(notifier.messages()[0], "ETHUSDT price rose to 2000.00");

    assert!(restored.dismiss(&alert.id));
    assert_eq!(restored.active_signals(), 0);
}
