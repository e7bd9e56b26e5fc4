use std::time::Duration;

/// Exponential reconnect backoff with a terminal attempt limit.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
    factor: f64,
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            factor: 2.0,
            max_attempts,
            attempt: 0,
        }
    }

    /// Consecutive failures recorded since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Record a failure and return the delay before the next attempt, or
    /// `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        let scaled = self.initial.as_secs_f64() * self.factor.powi(self.attempt as i32 - 1);
        Some(Duration::from_secs_f64(scaled.min(self.max.as_secs_f64())))
    }

    /// Called after a connection opens successfully.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 10)
    }
}
