//! Error types for listeners, publishers and the stream lifecycle

use crate::client::KinesisClientError;
use crate::validation::Violation;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;
use tokio::task::JoinError;

/// Worker-level error type
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Failed to list shards: {0}")]
    ListShardsFailed(String),

    #[error("Failed to get iterator: {0}")]
    GetIteratorFailed(String),

    #[error("Iterator expired for shard {0}")]
    IteratorExpired(String),

    #[error("Failed to get records: {0}")]
    GetRecordsFailed(String),

    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("Shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for worker operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Errors raised while making sure a stream exists and is active
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream {stream} never became active within {timeout:?}")]
    ActivationTimeout { stream: String, timeout: Duration },

    #[error("Stream {0} does not exist")]
    NotFound(String),

    #[error(transparent)]
    Client(#[from] KinesisClientError),
}

impl StreamError {
    pub fn is_activation_timeout(&self) -> bool {
        matches!(self, StreamError::ActivationTimeout { .. })
    }
}

/// Failure of a single processing attempt for one record
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// The record bytes could not be turned into the handler's envelope
    #[error("Transformation failed: {0}")]
    Transformation(String),

    /// The handler itself returned an error
    #[error("Dispatch failed: {0}")]
    Dispatch(#[source] anyhow::Error),
}

impl ProcessingError {
    pub fn transformation(err: impl std::fmt::Display) -> Self {
        ProcessingError::Transformation(err.to_string())
    }

    pub fn dispatch(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::Dispatch(err.into())
    }

    pub fn is_transformation(&self) -> bool {
        matches!(self, ProcessingError::Transformation(_))
    }
}

/// Outcome of a failed checkpoint attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("Checkpoint throttled: {0}")]
    Throttled(String),

    #[error("Checkpoint store unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Worker is shutting down")]
    Shutdown,

    #[error("Invalid checkpoint state: {0}")]
    InvalidState(String),
}

impl CheckpointError {
    /// Throttling and unavailable stores are worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CheckpointError::Throttled(_) | CheckpointError::DependencyUnavailable(_)
        )
    }
}

/// Errors raised by the outbound gateway
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Records failed validation: {}", format_violations(.0))]
    Validation(Vec<Violation>),

    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Client(#[from] KinesisClientError),
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<CheckpointError> for ProcessorError {
    fn from(err: CheckpointError) -> Self {
        ProcessorError::CheckpointError(err.to_string())
    }
}

impl From<KinesisClientError> for ProcessorError {
    fn from(err: KinesisClientError) -> Self {
        match err {
            KinesisClientError::ExpiredIterator => ProcessorError::IteratorExpired(String::new()),
            other => ProcessorError::GetRecordsFailed(other.to_string()),
        }
    }
}

impl From<AcquireError> for ProcessorError {
    fn from(err: AcquireError) -> Self {
        ProcessorError::Other(err.into())
    }
}

impl From<JoinError> for ProcessorError {
    fn from(err: JoinError) -> Self {
        ProcessorError::Other(err.into())
    }
}
