use super::types::{ProcessingEvent, ProcessingEventType, ShardEventType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

/// Holds aggregated metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    pub records_processed: u64,
    pub records_skipped: u64,
    pub records_rejected: u64,
    pub retry_attempts: u64,
    pub processing_time: Duration,
    pub max_processing_time: Duration,

    pub checkpoints_succeeded: u64,
    pub checkpoints_failed: u64,

    pub batches: u64,
    pub shard_errors: u64,

    pub window_start: Instant,
    pub last_updated: Instant,
}

impl Default for ShardMetrics {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            records_processed: 0,
            records_skipped: 0,
            records_rejected: 0,
            retry_attempts: 0,
            processing_time: Duration::default(),
            max_processing_time: Duration::default(),
            checkpoints_succeeded: 0,
            checkpoints_failed: 0,
            batches: 0,
            shard_errors: 0,
            window_start: now,
            last_updated: now,
        }
    }
}

impl ShardMetrics {
    pub fn avg_processing_time(&self) -> Duration {
        let attempted = self.records_processed + self.records_skipped;
        if attempted == 0 {
            Duration::default()
        } else {
            self.processing_time.div_f64(attempted as f64)
        }
    }
}

/// Folds monitoring events into per-shard counters and logs them every window
pub struct MetricsAggregator {
    metrics: Arc<RwLock<HashMap<String, ShardMetrics>>>,
    window_duration: Duration,
    monitoring_rx: mpsc::Receiver<ProcessingEvent>,
}

impl MetricsAggregator {
    pub fn new(window_duration: Duration, monitoring_rx: mpsc::Receiver<ProcessingEvent>) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
            window_duration,
            monitoring_rx,
        }
    }

    /// Shared view of the counters, usable after `run` takes ownership
    pub fn metrics_handle(&self) -> Arc<RwLock<HashMap<String, ShardMetrics>>> {
        self.metrics.clone()
    }

    /// Consumes events until every sender is dropped, then logs a final window
    pub async fn run(mut self) {
        let mut interval = interval(self.window_duration);

        loop {
            tokio::select! {
                event = self.monitoring_rx.recv() => match event {
                    Some(event) => self.process_event(event).await,
                    None => {
                        debug!("Monitoring channel closed");
                        self.emit_metrics().await;
                        return;
                    }
                },
                _ = interval.tick() => {
                    self.emit_metrics().await;
                }
            }
        }
    }

    pub async fn process_event(&self, event: ProcessingEvent) {
        let mut metrics = self.metrics.write().await;
        let shard_metrics = metrics.entry(event.shard_id.clone()).or_default();

        match event.event_type {
            ProcessingEventType::WorkerInitialized { stream_name } => {
                debug!(shard_id = %event.shard_id, stream_name = %stream_name, "Worker initialized");
            }
            ProcessingEventType::RecordAttempt {
                success,
                attempt_number,
                duration,
                ..
            } => {
                if success {
                    shard_metrics.records_processed += 1;
                }
                if attempt_number > 1 {
                    shard_metrics.retry_attempts += 1;
                }
                shard_metrics.processing_time += duration;
                if duration > shard_metrics.max_processing_time {
                    shard_metrics.max_processing_time = duration;
                }
            }
            ProcessingEventType::RecordSkipped {
                sequence_number,
                attempts,
                error,
            } => {
                shard_metrics.records_skipped += 1;
                trace!(
                    shard_id = %event.shard_id,
                    sequence = %sequence_number,
                    attempts,
                    error = %error,
                    "Record skipped"
                );
            }
            ProcessingEventType::RecordRejected { sequence_number, .. } => {
                shard_metrics.records_rejected += 1;
                trace!(shard_id = %event.shard_id, sequence = %sequence_number, "Record rejected");
            }
            ProcessingEventType::BatchComplete {
                successful_count,
                failed_count,
                duration,
            } => {
                shard_metrics.batches += 1;
                trace!(
                    shard_id = %event.shard_id,
                    successful = successful_count,
                    failed = failed_count,
                    duration_ms = ?duration.as_millis(),
                    "Batch processing completed"
                );
            }
            ProcessingEventType::Checkpoint { success, .. } => {
                if success {
                    shard_metrics.checkpoints_succeeded += 1;
                } else {
                    shard_metrics.checkpoints_failed += 1;
                }
            }
            ProcessingEventType::ShardEvent { event_type, details } => match event_type {
                ShardEventType::Started => {
                    debug!(shard_id = %event.shard_id, "Shard processing started");
                }
                ShardEventType::Completed => {
                    debug!(shard_id = %event.shard_id, "Shard processing completed");
                }
                ShardEventType::Error => {
                    shard_metrics.shard_errors += 1;
                    warn!(shard_id = %event.shard_id, details = ?details, "Shard processing error");
                }
                ShardEventType::Interrupted => {
                    debug!(shard_id = %event.shard_id, details = ?details, "Shard processing interrupted");
                }
            },
        }

        shard_metrics.last_updated = Instant::now();
    }

    async fn emit_metrics(&self) {
        let mut metrics = self.metrics.write().await;

        for (shard_id, metrics) in metrics.iter() {
            if metrics.last_updated.elapsed() > self.window_duration * 2 {
                continue;
            }

            info!(
                shard_id = %shard_id,
                records_processed = metrics.records_processed,
                records_skipped = metrics.records_skipped,
                records_rejected = metrics.records_rejected,
                retry_attempts = metrics.retry_attempts,
                avg_processing_time_ms = %metrics.avg_processing_time().as_millis(),
                max_processing_time_ms = %metrics.max_processing_time.as_millis(),
                checkpoints_succeeded = metrics.checkpoints_succeeded,
                checkpoints_failed = metrics.checkpoints_failed,
                batches = metrics.batches,
                "Metrics for window"
            );

            if metrics.records_skipped > 0 {
                warn!(
                    shard_id = %shard_id,
                    skipped = metrics.records_skipped,
                    "Records dropped after exhausting retries"
                );
            }

            if metrics.checkpoints_failed > 0 {
                warn!(
                    shard_id = %shard_id,
                    failures = metrics.checkpoints_failed,
                    "Checkpoint failures detected"
                );
            }
        }

        let window = self.window_duration * 2;
        metrics.retain(|_, m| m.last_updated.elapsed() <= window);
    }

    pub async fn get_metrics(&self) -> HashMap<String, ShardMetrics> {
        self.metrics.read().await.clone()
    }

    pub async fn get_shard_metrics(&self, shard_id: &str) -> Option<ShardMetrics> {
        self.metrics.read().await.get(shard_id).cloned()
    }
}
