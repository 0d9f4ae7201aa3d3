//! Record processing engine
//!
//! One [`KinesisRecordProcessor`] runs per leased shard. For every delivered
//! batch it:
//!
//! - Deserializes each record into the handler's envelope
//! - Dispatches it with a per-record retry budget
//! - Checkpoints the batch with its own retry budget and error classification
//!
//! Record failures and checkpoint failures never leave this module; they are
//! logged and reported as monitoring events.

use crate::dispatch::Dispatcher;
use crate::error::{CheckpointError, ProcessingError};
use crate::handler::{EnvelopeValidator, RecordHandler};
use crate::monitoring::{send_event, ProcessingEvent};
use crate::record::envelope_from_record;
use crate::retry::backoff_sleep;
use crate::validation::Violation;
use async_trait::async_trait;
use aws_sdk_kinesis::types::Record;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Persists progress for the shard a processor is bound to
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn checkpoint(&self) -> Result<(), CheckpointError>;
}

#[derive(Debug, Clone)]
pub struct InitializationInput {
    pub shard_id: String,
}

pub struct ProcessRecordsInput {
    pub records: Vec<Record>,
    pub checkpointer: Arc<dyn Checkpointer>,
}

/// Why a processor is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The shard is exhausted and its children take over
    Terminate,
    /// The lease was lost to another worker
    Zombie,
    /// The application asked the worker to stop
    Requested,
}

pub struct ShutdownInput {
    pub reason: ShutdownReason,
    pub checkpointer: Arc<dyn Checkpointer>,
}

/// Lifecycle callbacks the worker drives for one shard
///
/// Each call must not return before the batch or signal is fully handled.
#[async_trait]
pub trait RecordProcessor: Send {
    async fn initialize(&mut self, input: InitializationInput);

    async fn process_records(&mut self, input: ProcessRecordsInput);

    async fn shutdown(&mut self, input: ShutdownInput);
}

/// When a batch is checkpointed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// After every fully attempted batch, skipped records included
    #[default]
    Always,
    /// Only when every record in the batch was handled successfully
    OnlyOnSuccess,
}

#[derive(Debug, Clone)]
pub struct RecordProcessorConfig {
    /// Retries after the first dispatch attempt of a record
    pub max_retries: u32,
    pub backoff: Duration,
    /// Retries after the first checkpoint attempt
    pub checkpoint_max_retries: u32,
    pub checkpoint_backoff: Duration,
    pub checkpoint_policy: CheckpointPolicy,
}

impl Default for RecordProcessorConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::from_secs(1),
            checkpoint_max_retries: 0,
            checkpoint_backoff: Duration::from_secs(1),
            checkpoint_policy: CheckpointPolicy::Always,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Handled,
    Rejected,
    Skipped,
}

enum Attempt {
    Dispatched,
    Rejected(Vec<Violation>),
}

/// Engine binding a typed handler to one shard
pub struct KinesisRecordProcessor<H: RecordHandler> {
    stream_name: String,
    shard_id: Option<String>,
    dispatcher: Dispatcher<H>,
    validator: Option<EnvelopeValidator<H>>,
    config: RecordProcessorConfig,
    monitoring_tx: Option<mpsc::Sender<ProcessingEvent>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<H: RecordHandler> KinesisRecordProcessor<H> {
    pub fn new(
        stream_name: impl Into<String>,
        dispatcher: Dispatcher<H>,
        config: RecordProcessorConfig,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            shard_id: None,
            dispatcher,
            validator: None,
            config,
            monitoring_tx: None,
            shutdown: None,
        }
    }

    pub fn with_validator(mut self, validator: Option<EnvelopeValidator<H>>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_monitoring(mut self, monitoring_tx: Option<mpsc::Sender<ProcessingEvent>>) -> Self {
        self.monitoring_tx = monitoring_tx;
        self
    }

    /// Lets the shutdown signal cut retry sleeps short
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn shard_id(&self) -> &str {
        self.shard_id.as_deref().unwrap_or("uninitialized")
    }

    async fn send_monitoring_event(&self, event: ProcessingEvent) {
        send_event(self.monitoring_tx.as_ref(), event).await;
    }

    async fn attempt_record(&self, record: &Record) -> Result<Attempt, ProcessingError> {
        let envelope = envelope_from_record::<H::Data, H::Metadata>(record)?;

        if let Some(validator) = &self.validator {
            let violations = validator.validate(&envelope);
            if !violations.is_empty() {
                return Ok(Attempt::Rejected(violations));
            }
        }

        self.dispatcher.dispatch(envelope).await?;
        Ok(Attempt::Dispatched)
    }

    /// Runs up to `1 + max_retries` attempts for one record
    async fn process_record(&mut self, record: &Record) -> RecordOutcome {
        let sequence = record.sequence_number().to_string();
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let started = Instant::now();

            match self.attempt_record(record).await {
                Ok(Attempt::Dispatched) => {
                    debug!(
                        shard_id = %self.shard_id(),
                        sequence = %sequence,
                        attempt,
                        "Record handled"
                    );
                    self.send_monitoring_event(ProcessingEvent::record_attempt(
                        self.shard_id(),
                        sequence.as_str(),
                        true,
                        attempt,
                        started.elapsed(),
                        None,
                        false,
                    ))
                    .await;
                    return RecordOutcome::Handled;
                }
                Ok(Attempt::Rejected(violations)) => {
                    let violations: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
                    warn!(
                        shard_id = %self.shard_id(),
                        sequence = %sequence,
                        violations = ?violations,
                        "Record rejected by validator, skipping"
                    );
                    self.send_monitoring_event(ProcessingEvent::record_rejected(
                        self.shard_id(),
                        sequence.as_str(),
                        violations,
                    ))
                    .await;
                    return RecordOutcome::Rejected;
                }
                Err(e) => {
                    let is_final_attempt = attempt >= max_attempts;
                    self.send_monitoring_event(ProcessingEvent::record_attempt(
                        self.shard_id(),
                        sequence.as_str(),
                        false,
                        attempt,
                        started.elapsed(),
                        Some(e.to_string()),
                        is_final_attempt,
                    ))
                    .await;

                    if is_final_attempt {
                        error!(
                            shard_id = %self.shard_id(),
                            sequence = %sequence,
                            attempts = attempt,
                            transformation = e.is_transformation(),
                            error = %e,
                            "Record failed after max attempts, skipping"
                        );
                        self.send_monitoring_event(ProcessingEvent::record_skipped(
                            self.shard_id(),
                            sequence.as_str(),
                            attempt,
                            e.to_string(),
                        ))
                        .await;
                        return RecordOutcome::Skipped;
                    }

                    warn!(
                        shard_id = %self.shard_id(),
                        sequence = %sequence,
                        attempt,
                        error = %e,
                        "Record attempt failed, will retry"
                    );

                    if backoff_sleep(self.config.backoff, self.shutdown.as_mut()).await {
                        debug!(sequence = %sequence, "Retry backoff interrupted");
                    }
                }
            }
        }
    }

    /// Checkpoints with up to `1 + checkpoint_max_retries` attempts. Never fails the caller.
    async fn checkpoint(&mut self, checkpointer: &dyn Checkpointer) {
        let max_attempts = self.config.checkpoint_max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match checkpointer.checkpoint().await {
                Ok(()) => {
                    debug!(shard_id = %self.shard_id(), attempt, "Checkpoint stored");
                    self.send_monitoring_event(ProcessingEvent::checkpoint(
                        self.shard_id(),
                        true,
                        attempt,
                        None,
                    ))
                    .await;
                    return;
                }
                Err(CheckpointError::Shutdown) => {
                    info!(
                        shard_id = %self.shard_id(),
                        "Worker is shutting down, checkpoint abandoned"
                    );
                    Some(CheckpointError::Shutdown)
                }
                Err(e @ CheckpointError::InvalidState(_)) => {
                    error!(
                        shard_id = %self.shard_id(),
                        error = %e,
                        "Checkpoint store is in an invalid state, checkpoint abandoned"
                    );
                    Some(e)
                }
                Err(e) if attempt >= max_attempts => {
                    error!(
                        shard_id = %self.shard_id(),
                        attempts = attempt,
                        error = %e,
                        "Checkpoint failed after max attempts"
                    );
                    Some(e)
                }
                Err(e) => {
                    warn!(
                        shard_id = %self.shard_id(),
                        attempt,
                        error = %e,
                        "Transient checkpoint failure, will retry"
                    );
                    None
                }
            };

            if let Some(e) = error {
                self.send_monitoring_event(ProcessingEvent::checkpoint(
                    self.shard_id(),
                    false,
                    attempt,
                    Some(e.to_string()),
                ))
                .await;
                return;
            }

            if backoff_sleep(self.config.checkpoint_backoff, self.shutdown.as_mut()).await {
                debug!(shard_id = %self.shard_id(), "Checkpoint backoff interrupted");
            }
        }
    }
}

#[async_trait]
impl<H: RecordHandler> RecordProcessor for KinesisRecordProcessor<H> {
    async fn initialize(&mut self, input: InitializationInput) {
        info!(
            stream_name = %self.stream_name,
            shard_id = %input.shard_id,
            "Initializing record processor"
        );
        self.send_monitoring_event(ProcessingEvent::worker_initialized(
            input.shard_id.as_str(),
            self.stream_name.as_str(),
        ))
        .await;
        self.shard_id = Some(input.shard_id);
    }

    async fn process_records(&mut self, input: ProcessRecordsInput) {
        let batch_start = Instant::now();
        let mut successful = 0;
        let mut failed = 0;

        for record in &input.records {
            match self.process_record(record).await {
                RecordOutcome::Handled => successful += 1,
                RecordOutcome::Rejected | RecordOutcome::Skipped => failed += 1,
            }
        }

        debug!(
            shard_id = %self.shard_id(),
            successful,
            failed,
            "Batch attempted"
        );
        self.send_monitoring_event(ProcessingEvent::batch_complete(
            self.shard_id(),
            successful,
            failed,
            batch_start.elapsed(),
        ))
        .await;

        match self.config.checkpoint_policy {
            CheckpointPolicy::OnlyOnSuccess if failed > 0 => {
                warn!(
                    shard_id = %self.shard_id(),
                    failed,
                    "Batch had failed records, not checkpointing"
                );
            }
            _ => self.checkpoint(input.checkpointer.as_ref()).await,
        }
    }

    async fn shutdown(&mut self, input: ShutdownInput) {
        match input.reason {
            ShutdownReason::Terminate => {
                info!(
                    shard_id = %self.shard_id(),
                    "Shard ended, writing final checkpoint"
                );
                self.checkpoint(input.checkpointer.as_ref()).await;
            }
            reason => {
                info!(
                    shard_id = %self.shard_id(),
                    reason = ?reason,
                    "Shutting down without checkpoint"
                );
            }
        }
    }
}
