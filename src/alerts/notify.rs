use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Receives alert notifications. Responsible for any audible or visual
/// signal and for delivery off-process.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert_id: &str, message: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, alert_id: &str, message: &str) {
        tracing::warn!(alert_id = %alert_id, "ALERT {}", message);
    }
}

/// Calls a notifier immediately and then on every interval until stopped.
pub struct RepeatingSignal {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl RepeatingSignal {
    /// Start the loop. Outside a Tokio runtime the notifier is called once
    /// and nothing repeats.
    pub fn start(
        notifier: Arc<dyn Notifier>,
        alert_id: String,
        message: String,
        every: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(alert_id = %alert_id, "No runtime, signalling once");
            notifier.notify(&alert_id, &message);
            return Self {
                stop: stop_tx,
                task: None,
            };
        };
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => notifier.notify(&alert_id, &message),
                }
            }
            tracing::debug!(alert_id = %alert_id, "Alert signal stopped");
        });
        Self {
            stop: stop_tx,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(&mut self) {
        if self.task.take().is_some() {
            let _ = self.stop.send(true);
        }
    }
}

impl Drop for RepeatingSignal {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `0.1234` below one, `65000.00` otherwise.
pub fn format_price(price: f64) -> String {
    if price < 1.0 {
        format!("{:.4}", price)
    } else {
        format!("{:.2}", price)
    }
}
