use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Maximum retries ({0}) exceeded: {1}")]
    MaxRetriesExceeded(u32, String),

    #[error("Operation failed permanently: {0}")]
    Permanent(String),

    #[error("Retry interrupted by shutdown signal")]
    Interrupted,
}
