pub mod engine;
pub mod notify;
pub mod store;

pub use engine::{alert_message, AlertEngine, AlertFilter, DEFAULT_SIGNAL_INTERVAL};
pub use notify::{format_price, LogNotifier, Notifier, RepeatingSignal};
pub use store::{AlertStore, MemoryAlertStore, SqliteAlertStore};
