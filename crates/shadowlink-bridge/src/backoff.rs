//! Exponential reconnect backoff with a cap and jitter.
//!
//! Retries are unbounded: [`Backoff::next_delay`] always yields a delay.

use std::time::Duration;

use rand::Rng;

use shadowlink_core::ReconnectConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    min_delay_ms: u64,
    max_delay_ms: u64,
    multiplier: f64,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            min_delay_ms: config.min_delay_ms.max(1),
            max_delay_ms: config.max_delay_ms.max(config.min_delay_ms),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay for a 1-based attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = (self.min_delay_ms as f64 * self.multiplier.powi(exponent))
            .min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }

    /// Delay before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let base = self.delay_for_attempt(self.attempt);
        if self.jitter == 0.0 {
            return base;
        }

        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let jittered = (base.as_millis() as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Start over from the minimum delay, after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
