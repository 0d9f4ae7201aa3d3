use rand::Rng;
use std::time::Duration;
use tracing::trace;

/// Delay schedule for a retry loop
pub trait Backoff: Send + Sync {
    /// Delay to wait after failed attempt number `attempt` (zero based)
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Doubling delay, capped and spread by random jitter
///
/// Used for the worker's shard listing, iterator and record fetch calls.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl ExponentialBackoff {
    pub fn builder() -> ExponentialBackoffBuilder {
        ExponentialBackoffBuilder::default()
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let growth = self.multiplier.powi(exponent);
        let capped = if growth.is_finite() {
            self.initial_delay.mul_f64(growth).min(self.max_delay)
        } else {
            self.max_delay
        };

        // jitter is taken from the capped delay so it stays proportional
        let spread = capped.mul_f64(self.jitter_factor);
        let delay = if spread.is_zero() {
            capped
        } else {
            let offset = rand::thread_rng().gen_range(0..=spread.as_millis() as u64 * 2);
            (capped + Duration::from_millis(offset))
                .saturating_sub(spread)
                .min(self.max_delay)
        };

        trace!(attempt, delay_ms = delay.as_millis() as u64, "Backoff delay");
        delay
    }
}

#[derive(Debug)]
pub struct ExponentialBackoffBuilder {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl Default for ExponentialBackoffBuilder {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoffBuilder {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Clamped to `0.0..=1.0`
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay.max(self.initial_delay),
            multiplier: self.multiplier,
            jitter_factor: self.jitter_factor,
        }
    }
}
