//! Retry and backoff functionality shared by the worker and the record processor

mod backoff;
mod error;

pub use backoff::{Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
pub use error::RetryError;

use std::time::Duration;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt (None for infinite)
    pub max_retries: Option<u32>,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn exponential_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::builder()
            .initial_delay(self.initial_backoff)
            .max_delay(self.max_backoff)
            .jitter_factor(self.jitter_factor)
            .build()
    }

    /// Fresh retry loop using this config's exponential schedule
    pub fn handle(&self) -> RetryHandle<ExponentialBackoff> {
        RetryHandle::new(self.clone(), self.exponential_backoff())
    }
}

/// Sleeps for `delay` unless the shutdown signal fires first.
///
/// Returns `true` when the sleep was cut short. Callers treat that as a
/// normal wake-up and carry on with their next attempt.
pub async fn backoff_sleep(delay: Duration, shutdown: Option<&mut watch::Receiver<bool>>) -> bool {
    match shutdown {
        Some(rx) if *rx.borrow() => true,
        Some(rx) => {
            select! {
                _ = tokio::time::sleep(delay) => false,
                _ = rx.changed() => {
                    debug!("Backoff sleep interrupted");
                    true
                }
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            false
        }
    }
}

/// Retry loop over one fallible call, interrupted by the shutdown signal
pub struct RetryHandle<B: Backoff> {
    config: RetryConfig,
    backoff: B,
    attempts: u32,
}

impl<B: Backoff> RetryHandle<B> {
    pub fn new(config: RetryConfig, backoff: B) -> Self {
        Self {
            config,
            backoff,
            attempts: 0,
        }
    }

    /// Retries only the errors `should_retry` accepts; others fail at once
    pub async fn retry_if<F, Fut, T, E, P>(
        &mut self,
        mut operation: F,
        should_retry: P,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        loop {
            self.attempts += 1;
            trace!(attempt = self.attempts, "Executing operation");

            let result = select! {
                result = operation() => result,
                _ = shutdown.changed() => {
                    debug!(attempt = self.attempts, "Operation interrupted by shutdown signal");
                    return Err(RetryError::Interrupted);
                }
            };

            let error = match result {
                Ok(value) => {
                    trace!(attempts = self.attempts, "Operation succeeded");
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !should_retry(&error) {
                warn!(attempts = self.attempts, error = %error, "Operation failed with non-retryable error");
                return Err(RetryError::Permanent(error.to_string()));
            }

            if self.config.max_retries.is_some_and(|max| self.attempts > max) {
                warn!(attempts = self.attempts, error = %error, "Maximum retry attempts exceeded");
                return Err(RetryError::MaxRetriesExceeded(self.attempts, error.to_string()));
            }

            let delay = self.backoff.next_delay(self.attempts - 1);
            warn!(
                attempt = self.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Operation failed, retrying after delay"
            );

            select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    debug!("Retry backoff interrupted by shutdown signal");
                    return Err(RetryError::Interrupted);
                }
            }
        }
    }
}
