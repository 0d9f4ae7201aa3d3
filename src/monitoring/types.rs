use super::MetricsAggregator;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

/// Configuration for the monitoring system
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Whether monitoring is enabled
    pub enabled: bool,
    /// Size of the monitoring channel buffer
    pub channel_size: usize,
    /// How often to emit aggregated metrics
    pub metrics_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_size: 1000,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

impl MonitoringConfig {
    /// Event channel plus its aggregator, or `None` when monitoring is disabled
    pub fn start(&self) -> Option<(mpsc::Sender<ProcessingEvent>, MetricsAggregator)> {
        if !self.enabled {
            return None;
        }
        let (tx, rx) = mpsc::channel(self.channel_size);
        Some((tx, MetricsAggregator::new(self.metrics_interval, rx)))
    }
}

/// Represents a monitoring event from the worker or a record processor
#[derive(Debug, Clone)]
pub struct ProcessingEvent {
    /// When the event occurred
    pub timestamp: SystemTime,
    /// ID of the shard this event relates to
    pub shard_id: String,
    /// The type of event and its details
    pub event_type: ProcessingEventType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingEventType {
    /// A record processor was bound to a shard
    WorkerInitialized { stream_name: String },
    RecordAttempt {
        sequence_number: String,
        success: bool,
        attempt_number: u32,
        duration: Duration,
        error: Option<String>,
        is_final_attempt: bool,
    },
    /// Every attempt failed and the record was dropped
    RecordSkipped {
        sequence_number: String,
        attempts: u32,
        error: String,
    },
    /// The validator flagged the envelope, the handler never saw it
    RecordRejected {
        sequence_number: String,
        violations: Vec<String>,
    },
    BatchComplete {
        successful_count: usize,
        failed_count: usize,
        duration: Duration,
    },
    Checkpoint {
        success: bool,
        attempts: u32,
        error: Option<String>,
    },
    ShardEvent {
        event_type: ShardEventType,
        details: Option<String>,
    },
}

/// Types of shard-level events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardEventType {
    Started,
    /// Shard end reached, final checkpoint written
    Completed,
    Error,
    /// Stopped by the shutdown signal
    Interrupted,
}

impl ProcessingEvent {
    fn new(shard_id: impl Into<String>, event_type: ProcessingEventType) -> Self {
        Self {
            timestamp: SystemTime::now(),
            shard_id: shard_id.into(),
            event_type,
        }
    }

    pub fn worker_initialized(shard_id: impl Into<String>, stream_name: impl Into<String>) -> Self {
        Self::new(
            shard_id,
            ProcessingEventType::WorkerInitialized {
                stream_name: stream_name.into(),
            },
        )
    }

    pub fn record_attempt(
        shard_id: impl Into<String>,
        sequence_number: impl Into<String>,
        success: bool,
        attempt_number: u32,
        duration: Duration,
        error: Option<String>,
        is_final_attempt: bool,
    ) -> Self {
        Self::new(
            shard_id,
            ProcessingEventType::RecordAttempt {
                sequence_number: sequence_number.into(),
                success,
                attempt_number,
                duration,
                error,
                is_final_attempt,
            },
        )
    }

    pub fn record_skipped(
        shard_id: impl Into<String>,
        sequence_number: impl Into<String>,
        attempts: u32,
        error: impl Into<String>,
    ) -> Self {
        Self::new(
            shard_id,
            ProcessingEventType::RecordSkipped {
                sequence_number: sequence_number.into(),
                attempts,
                error: error.into(),
            },
        )
    }

    pub fn record_rejected(
        shard_id: impl Into<String>,
        sequence_number: impl Into<String>,
        violations: Vec<String>,
    ) -> Self {
        Self::new(
            shard_id,
            ProcessingEventType::RecordRejected {
                sequence_number: sequence_number.into(),
                violations,
            },
        )
    }

    pub fn batch_complete(
        shard_id: impl Into<String>,
        successful_count: usize,
        failed_count: usize,
        duration: Duration,
    ) -> Self {
        Self::new(
            shard_id,
            ProcessingEventType::BatchComplete {
                successful_count,
                failed_count,
                duration,
            },
        )
    }

    pub fn checkpoint(
        shard_id: impl Into<String>,
        success: bool,
        attempts: u32,
        error: Option<String>,
    ) -> Self {
        Self::new(
            shard_id,
            ProcessingEventType::Checkpoint {
                success,
                attempts,
                error,
            },
        )
    }

    pub fn shard_event(
        shard_id: impl Into<String>,
        event_type: ShardEventType,
        details: Option<String>,
    ) -> Self {
        Self::new(
            shard_id,
            ProcessingEventType::ShardEvent {
                event_type,
                details,
            },
        )
    }
}
