use crate::config::RealtimeConfig;
use std::time::Duration;

/// Exponential reconnect schedule: `base * 2^attempt`, capped, with ±20%
/// jitter, for at most `max_attempts` tries.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

const JITTER: f64 = 0.2;

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_max_ms),
            config.reconnect_max_attempts,
        )
    }

    /// Delay before the given attempt (0-based), without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Next delay, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let nominal = self.nominal_delay(self.attempt);
        self.attempt += 1;
        let spread: f64 = rand::random::<f64>() * 2.0 - 1.0;
        let jittered = nominal.as_secs_f64() * (1.0 + spread * JITTER);
        Some(Duration::from_secs_f64(jittered.max(0.0)))
    }

    /// Attempts used so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
