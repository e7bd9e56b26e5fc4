pub mod alerts;
pub mod config;
pub mod error;
pub mod event;
pub mod exchange;
pub mod historical;
pub mod live_bars;
pub mod model;
pub mod server;
pub mod stream;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
