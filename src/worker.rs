//! Shard consumption runtime
//!
//! The [`Worker`] owns one task per shard of a stream and drives a
//! [`RecordProcessor`] through its lifecycle:
//!
//! - `initialize` once the stored checkpoint has been read
//! - `process_records` for every non-empty batch
//! - `shutdown(Terminate)` at shard end, `shutdown(Requested)` on the shutdown signal
//!
//! Child shards are picked up once their parents have ended. Leases are not
//! balanced between processes; a single worker consumes every shard.

use crate::client::{KinesisClientError, KinesisClientTrait};
use crate::config::KinesisSettings;
use crate::error::{CheckpointError, ProcessorError, Result};
use crate::monitoring::{send_event, ProcessingEvent, ShardEventType};
use crate::processor::{
    Checkpointer, InitializationInput, ProcessRecordsInput, RecordProcessor, ShutdownInput,
    ShutdownReason,
};
use crate::retry::{backoff_sleep, Backoff, RetryConfig, RetryError};
use crate::store::CheckpointStore;
use async_trait::async_trait;
use aws_sdk_kinesis::types::{Record, Shard, ShardIteratorType};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Checkpoint value marking a shard as fully consumed
pub const SHARD_END: &str = "SHARD_END";

/// Where a shard without a stored checkpoint starts
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitialPosition {
    /// Oldest record still retained
    TrimHorizon,
    /// Only records written after the worker starts
    #[default]
    Latest,
    AtTimestamp(DateTime<Utc>),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub stream_name: String,
    /// Maximum records per GetRecords call
    pub batch_size: i32,
    /// Pause between two GetRecords calls on the same shard
    pub idle_time_between_reads: Duration,
    pub max_concurrent_shards: Option<u32>,
    pub initial_position: InitialPosition,
    /// Retry policy for Kinesis calls made by the worker itself
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            batch_size: 100,
            idle_time_between_reads: Duration::from_secs(1),
            max_concurrent_shards: None,
            initial_position: InitialPosition::Latest,
            retry: RetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_settings(settings: &KinesisSettings, stream_name: &str) -> Self {
        Self {
            stream_name: stream_name.to_string(),
            batch_size: settings.batch_size,
            idle_time_between_reads: settings.idle_time_between_reads(),
            max_concurrent_shards: settings.max_concurrent_shards,
            initial_position: settings.initial_position.clone(),
            retry: RetryConfig::default(),
        }
    }
}

/// Builds one record processor per shard
pub trait RecordProcessorFactory: Send + Sync + 'static {
    type Processor: RecordProcessor + 'static;

    fn create_processor(&self) -> Self::Processor;
}

impl<F, P> RecordProcessorFactory for F
where
    F: Fn() -> P + Send + Sync + 'static,
    P: RecordProcessor + 'static,
{
    type Processor = P;

    fn create_processor(&self) -> P {
        self()
    }
}

/// Checkpoint handle backed by a [`CheckpointStore`]
///
/// Writes whatever position the worker last handed it: the final sequence
/// number of the batch being processed, or [`SHARD_END`].
pub struct StoreCheckpointer<S: CheckpointStore> {
    store: Arc<S>,
    shard_id: String,
    position: Mutex<Option<String>>,
    shutdown: watch::Receiver<bool>,
}

impl<S: CheckpointStore> StoreCheckpointer<S> {
    pub fn new(store: Arc<S>, shard_id: impl Into<String>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            store,
            shard_id: shard_id.into(),
            position: Mutex::new(None),
            shutdown,
        }
    }

    pub fn set_position(&self, position: impl Into<String>) {
        *self.position.lock() = Some(position.into());
    }

    pub fn position(&self) -> Option<String> {
        self.position.lock().clone()
    }
}

fn into_checkpoint_error(err: anyhow::Error) -> CheckpointError {
    match err.downcast_ref::<CheckpointError>() {
        Some(classified) => classified.clone(),
        None => CheckpointError::DependencyUnavailable(err.to_string()),
    }
}

#[async_trait]
impl<S: CheckpointStore + 'static> Checkpointer for StoreCheckpointer<S> {
    async fn checkpoint(&self) -> std::result::Result<(), CheckpointError> {
        if *self.shutdown.borrow() {
            return Err(CheckpointError::Shutdown);
        }

        let Some(position) = self.position() else {
            trace!(shard_id = %self.shard_id, "Nothing to checkpoint yet");
            return Ok(());
        };

        self.store
            .save_checkpoint(&self.shard_id, &position)
            .await
            .map_err(into_checkpoint_error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardExit {
    Ended,
    Interrupted,
}

/// Shards that may start now: never started, and every listed parent has ended
///
/// A parent that failed or was interrupted is not ended, so its children wait
/// for a later run that finishes it.
fn ready_shards(shards: &[Shard], started: &HashSet<String>, ended: &HashSet<String>) -> Vec<String> {
    let listed: HashSet<&str> = shards.iter().map(|s| s.shard_id()).collect();

    shards
        .iter()
        .filter(|s| !started.contains(s.shard_id()))
        .filter(|s| {
            [s.parent_shard_id(), s.adjacent_parent_shard_id()]
                .into_iter()
                .flatten()
                .all(|parent| !listed.contains(parent) || ended.contains(parent))
        })
        .map(|s| s.shard_id().to_string())
        .collect()
}

struct ShardContext<C, S, F> {
    config: WorkerConfig,
    client: Arc<C>,
    store: Arc<S>,
    factory: Arc<F>,
    monitoring_tx: Option<mpsc::Sender<ProcessingEvent>>,
}

impl<C, S, F> ShardContext<C, S, F>
where
    C: KinesisClientTrait + 'static,
    S: CheckpointStore + 'static,
    F: RecordProcessorFactory,
{
    async fn send_monitoring_event(&self, event: ProcessingEvent) {
        send_event(self.monitoring_tx.as_ref(), event).await;
    }

    async fn list_shards(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Vec<Shard>> {
        let mut retry = self.config.retry.handle();
        retry
            .retry_if(
                || self.client.list_shards(&self.config.stream_name),
                |e: &KinesisClientError| e.is_retryable(),
                shutdown,
            )
            .await
            .map_err(|e| match e {
                RetryError::Interrupted => ProcessorError::Shutdown,
                other => ProcessorError::ListShardsFailed(other.to_string()),
            })
    }

    async fn get_iterator(
        &self,
        shard_id: &str,
        after_sequence: Option<&str>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<String> {
        let (iterator_type, timestamp) = match after_sequence {
            Some(_) => (ShardIteratorType::AfterSequenceNumber, None),
            None => match &self.config.initial_position {
                InitialPosition::TrimHorizon => (ShardIteratorType::TrimHorizon, None),
                InitialPosition::Latest => (ShardIteratorType::Latest, None),
                InitialPosition::AtTimestamp(ts) => (ShardIteratorType::AtTimestamp, Some(*ts)),
            },
        };

        debug!(
            shard_id = %shard_id,
            iterator_type = ?iterator_type,
            after_sequence = ?after_sequence,
            "Requesting shard iterator"
        );

        let mut retry = self.config.retry.handle();
        retry
            .retry_if(
                || {
                    self.client.get_shard_iterator(
                        &self.config.stream_name,
                        shard_id,
                        iterator_type.clone(),
                        after_sequence,
                        timestamp.as_ref(),
                    )
                },
                |e: &KinesisClientError| e.is_retryable(),
                shutdown,
            )
            .await
            .map_err(|e| match e {
                RetryError::Interrupted => ProcessorError::Shutdown,
                other => ProcessorError::GetIteratorFailed(other.to_string()),
            })
    }

    /// GetRecords with throttling retried. Expired iterators are returned to the caller.
    async fn get_records(
        &self,
        shard_id: &str,
        iterator: &str,
    ) -> std::result::Result<(Vec<Record>, Option<String>), KinesisClientError> {
        let backoff = self.config.retry.exponential_backoff();
        let mut attempt: u32 = 0;

        loop {
            match self.client.get_records(iterator, self.config.batch_size).await {
                Err(e)
                    if e.is_retryable()
                        && self.config.retry.max_retries.map_or(true, |max| attempt < max) =>
                {
                    let delay = backoff.next_delay(attempt);
                    attempt += 1;
                    warn!(
                        shard_id = %shard_id,
                        attempt,
                        delay_ms = ?delay.as_millis(),
                        error = %e,
                        "GetRecords failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn stop(
        &self,
        processor: &mut F::Processor,
        checkpointer: Arc<StoreCheckpointer<S>>,
        shard_id: &str,
        reason: ShutdownReason,
    ) {
        processor
            .shutdown(ShutdownInput {
                reason,
                checkpointer,
            })
            .await;

        let (event_type, details) = match reason {
            ShutdownReason::Terminate => (ShardEventType::Completed, None),
            ShutdownReason::Requested => (ShardEventType::Interrupted, Some("Shutdown requested".to_string())),
            ShutdownReason::Zombie => (ShardEventType::Error, Some("Shard abandoned".to_string())),
        };
        self.send_monitoring_event(ProcessingEvent::shard_event(shard_id, event_type, details))
            .await;
    }

    async fn process_shard(
        &self,
        shard_id: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ShardExit> {
        info!(shard_id = %shard_id, "Starting shard processing");
        self.send_monitoring_event(ProcessingEvent::shard_event(shard_id, ShardEventType::Started, None))
            .await;

        if *shutdown.borrow() {
            return Ok(ShardExit::Interrupted);
        }

        let checkpoint = self
            .store
            .get_checkpoint(shard_id)
            .await
            .map_err(|e| ProcessorError::CheckpointError(e.to_string()))?;

        if checkpoint.as_deref() == Some(SHARD_END) {
            info!(shard_id = %shard_id, "Shard already fully consumed");
            self.send_monitoring_event(ProcessingEvent::shard_event(
                shard_id,
                ShardEventType::Completed,
                Some("Already at shard end".to_string()),
            ))
            .await;
            return Ok(ShardExit::Ended);
        }

        let mut processor = self.factory.create_processor();
        processor
            .initialize(InitializationInput {
                shard_id: shard_id.to_string(),
            })
            .await;

        let checkpointer = Arc::new(StoreCheckpointer::new(
            self.store.clone(),
            shard_id,
            shutdown.clone(),
        ));
        let mut position = checkpoint;

        let mut iterator = match self.get_iterator(shard_id, position.as_deref(), &mut shutdown).await {
            Ok(iterator) => iterator,
            Err(ProcessorError::Shutdown) => {
                self.stop(&mut processor, checkpointer, shard_id, ShutdownReason::Requested)
                    .await;
                return Ok(ShardExit::Interrupted);
            }
            Err(e) => {
                error!(shard_id = %shard_id, error = %e, "Failed to get initial iterator");
                self.stop(&mut processor, checkpointer, shard_id, ShutdownReason::Zombie)
                    .await;
                return Err(e);
            }
        };

        loop {
            if *shutdown.borrow() {
                info!(shard_id = %shard_id, "Shutdown received in shard loop");
                self.stop(&mut processor, checkpointer, shard_id, ShutdownReason::Requested)
                    .await;
                return Ok(ShardExit::Interrupted);
            }

            let fetched = tokio::select! {
                fetched = self.get_records(shard_id, &iterator) => fetched,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!(shard_id = %shard_id, "Shutdown sender dropped");
                        self.stop(&mut processor, checkpointer, shard_id, ShutdownReason::Requested)
                            .await;
                        return Ok(ShardExit::Interrupted);
                    }
                    continue;
                }
            };

            let (records, next_iterator) = match fetched {
                Ok(batch) => batch,
                Err(KinesisClientError::ExpiredIterator) => {
                    warn!(shard_id = %shard_id, position = ?position, "Iterator expired, re-acquiring");
                    iterator = match self.get_iterator(shard_id, position.as_deref(), &mut shutdown).await {
                        Ok(iterator) => iterator,
                        Err(ProcessorError::Shutdown) => continue,
                        Err(e) => {
                            self.stop(&mut processor, checkpointer, shard_id, ShutdownReason::Zombie)
                                .await;
                            return Err(e);
                        }
                    };
                    continue;
                }
                Err(e) => {
                    error!(shard_id = %shard_id, error = %e, "Failed to get records");
                    self.stop(&mut processor, checkpointer, shard_id, ShutdownReason::Zombie)
                        .await;
                    return Err(ProcessorError::GetRecordsFailed(e.to_string()));
                }
            };

            let last = records.last().map(|r| r.sequence_number().to_string());
            if let Some(last) = last {
                trace!(shard_id = %shard_id, count = records.len(), last = %last, "Delivering batch");
                checkpointer.set_position(last.as_str());
                processor
                    .process_records(ProcessRecordsInput {
                        records,
                        checkpointer: checkpointer.clone(),
                    })
                    .await;
                position = Some(last);
            }

            match next_iterator {
                Some(next) => iterator = next,
                None => {
                    info!(shard_id = %shard_id, "Reached shard end");
                    checkpointer.set_position(SHARD_END);
                    self.stop(&mut processor, checkpointer, shard_id, ShutdownReason::Terminate)
                        .await;
                    return Ok(ShardExit::Ended);
                }
            }

            if backoff_sleep(self.config.idle_time_between_reads, Some(&mut shutdown)).await {
                trace!(shard_id = %shard_id, "Idle wait interrupted");
            }
        }
    }
}

/// Consumes every shard of one stream until the shutdown signal
pub struct Worker<C, S, F> {
    config: WorkerConfig,
    client: Arc<C>,
    store: Arc<S>,
    factory: Arc<F>,
    monitoring_tx: Option<mpsc::Sender<ProcessingEvent>>,
}

impl<C, S, F> Worker<C, S, F>
where
    C: KinesisClientTrait + 'static,
    S: CheckpointStore + 'static,
    F: RecordProcessorFactory,
{
    pub fn new(config: WorkerConfig, client: Arc<C>, store: Arc<S>, factory: F) -> Self {
        Self {
            config,
            client,
            store,
            factory: Arc::new(factory),
            monitoring_tx: None,
        }
    }

    pub fn with_monitoring(mut self, monitoring_tx: Option<mpsc::Sender<ProcessingEvent>>) -> Self {
        self.monitoring_tx = monitoring_tx;
        self
    }

    fn spawn_ready(
        &self,
        ctx: &Arc<ShardContext<C, S, F>>,
        tasks: &mut JoinSet<(String, Result<ShardExit>)>,
        shards: &[Shard],
        started: &mut HashSet<String>,
        ended: &HashSet<String>,
        semaphore: &Option<Arc<Semaphore>>,
        shutdown: &watch::Receiver<bool>,
    ) {
        for shard_id in ready_shards(shards, started, ended) {
            debug!(shard_id = %shard_id, "Spawning shard task");
            started.insert(shard_id.clone());

            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let shard = async {
                    let _permit = match semaphore {
                        Some(sem) => Some(sem.acquire_owned().await?),
                        None => None,
                    };
                    ctx.process_shard(&shard_id, shutdown).await
                };
                let result = AssertUnwindSafe(shard).catch_unwind().await.unwrap_or_else(|_| {
                    Err(ProcessorError::Other(anyhow!("shard task panicked")))
                });
                (shard_id, result)
            });
        }
    }

    /// Runs until every shard has ended or the shutdown signal is set
    ///
    /// Returns the first shard failure, after all other shards have stopped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(stream_name = %self.config.stream_name, "Starting worker");

        let ctx = Arc::new(ShardContext {
            config: self.config.clone(),
            client: self.client.clone(),
            store: self.store.clone(),
            factory: self.factory.clone(),
            monitoring_tx: self.monitoring_tx.clone(),
        });

        let shards = match ctx.list_shards(&mut shutdown).await {
            Ok(shards) => shards,
            Err(ProcessorError::Shutdown) => return Ok(()),
            Err(e) => return Err(e),
        };
        if shards.is_empty() {
            warn!(stream_name = %self.config.stream_name, "Stream has no shards");
        }

        let semaphore = self
            .config
            .max_concurrent_shards
            .map(|limit| Arc::new(Semaphore::new(limit as usize)));

        let mut tasks = JoinSet::new();
        let mut started = HashSet::new();
        let mut ended = HashSet::new();
        let mut first_error: Option<ProcessorError> = None;

        self.spawn_ready(&ctx, &mut tasks, &shards, &mut started, &ended, &semaphore, &shutdown);

        while let Some(joined) = tasks.join_next().await {
            let (shard_id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Shard task aborted");
                    first_error.get_or_insert(e.into());
                    continue;
                }
            };
            if matches!(result, Ok(ShardExit::Ended)) {
                ended.insert(shard_id.clone());
            }
            let stopping = *shutdown.borrow();

            match result {
                Ok(ShardExit::Ended) if !stopping => {
                    match ctx.list_shards(&mut shutdown).await {
                        Ok(shards) => self.spawn_ready(
                            &ctx,
                            &mut tasks,
                            &shards,
                            &mut started,
                            &ended,
                            &semaphore,
                            &shutdown,
                        ),
                        Err(e) => {
                            warn!(error = %e, "Failed to refresh shards after shard end");
                        }
                    }
                }
                Ok(_) | Err(ProcessorError::Shutdown) => {}
                Err(e) => {
                    error!(shard_id = %shard_id, error = %e, "Shard processing failed");
                    ctx.send_monitoring_event(ProcessingEvent::shard_event(
                        shard_id.as_str(),
                        ShardEventType::Error,
                        Some(e.to_string()),
                    ))
                    .await;
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(stream_name = %self.config.stream_name, "Worker stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::processor::{KinesisRecordProcessor, RecordProcessorConfig};
    use crate::test::mocks::{MockCheckpointStore, MockKinesisClient, RecordingHandler};
    use crate::test::{init_logging, TestUtils};
    use pretty_assertions::assert_eq;

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            stream_name: "foo-event-stream".to_string(),
            idle_time_between_reads: Duration::from_millis(1),
            initial_position: InitialPosition::TrimHorizon,
            retry: RetryConfig {
                max_retries: Some(2),
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                jitter_factor: 0.0,
            },
            ..Default::default()
        }
    }

    fn factory(
        handler: &Arc<RecordingHandler>,
    ) -> impl Fn() -> KinesisRecordProcessor<RecordingHandler> + Send + Sync + 'static {
        let handler = handler.clone();
        move || {
            KinesisRecordProcessor::new(
                "foo-event-stream",
                Dispatcher::Inline(handler.clone()),
                RecordProcessorConfig::default(),
            )
        }
    }

    #[test]
    fn test_children_wait_for_parents() {
        let shards = vec![
            TestUtils::create_test_shard("parent"),
            TestUtils::create_child_shard("child", "parent"),
            TestUtils::create_child_shard("orphan", "expired-parent"),
        ];
        let mut started = HashSet::new();
        let mut ended = HashSet::new();

        assert_eq!(ready_shards(&shards, &started, &ended), vec!["parent", "orphan"]);

        started.insert("parent".to_string());
        started.insert("orphan".to_string());
        assert!(ready_shards(&shards, &started, &ended).is_empty());

        ended.insert("parent".to_string());
        assert_eq!(ready_shards(&shards, &started, &ended), vec!["child"]);
    }

    #[test]
    fn test_stopped_parent_blocks_children() {
        let shards = vec![
            TestUtils::create_test_shard("parent"),
            TestUtils::create_child_shard("child", "parent"),
        ];
        let started: HashSet<String> = ["parent".to_string()].into();

        // parent stopped without reaching its end: neither it nor its child restarts
        assert!(ready_shards(&shards, &started, &HashSet::new()).is_empty());
    }

    #[tokio::test]
    async fn test_consumes_shard_to_end() -> anyhow::Result<()> {
        init_logging();
        let client = Arc::new(MockKinesisClient::new());
        let store = Arc::new(MockCheckpointStore::new());
        let handler = Arc::new(RecordingHandler::new("foo-event-stream"));

        client.mock_list_shards(Ok(vec![TestUtils::create_test_shard("shard-1")])).await;
        client
            .mock_get_records(Ok((
                vec![
                    TestUtils::create_event_record("1", "a", "test"),
                    TestUtils::create_event_record("2", "b", "test"),
                ],
                Some("next".to_string()),
            )))
            .await;
        client.mock_get_records(Ok((vec![], None))).await;

        let worker = Worker::new(test_config(), client.clone(), store.clone(), factory(&handler));
        let (_tx, rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(5), worker.run(rx)).await??;

        assert_eq!(handler.call_count(), 2);
        assert_eq!(store.saved_checkpoints().await, vec![
            ("shard-1".to_string(), "2".to_string()),
            ("shard-1".to_string(), SHARD_END.to_string()),
        ]);
        let requests = client.iterator_requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1, ShardIteratorType::TrimHorizon);
        Ok(())
    }

    #[tokio::test]
    async fn test_resumes_after_stored_checkpoint() -> anyhow::Result<()> {
        let client = Arc::new(MockKinesisClient::new());
        let store = Arc::new(MockCheckpointStore::new());
        store.save_checkpoint("shard-1", "41").await?;
        let handler = Arc::new(RecordingHandler::new("foo-event-stream"));

        client.mock_list_shards(Ok(vec![TestUtils::create_test_shard("shard-1")])).await;

        let worker = Worker::new(test_config(), client.clone(), store.clone(), factory(&handler));
        let (_tx, rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(5), worker.run(rx)).await??;

        let requests = client.iterator_requests().await;
        assert_eq!(
            requests,
            vec![(
                "shard-1".to_string(),
                ShardIteratorType::AfterSequenceNumber,
                Some("41".to_string())
            )]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_skips_shard_already_at_end() -> anyhow::Result<()> {
        let client = Arc::new(MockKinesisClient::new());
        let store = Arc::new(MockCheckpointStore::new());
        store.save_checkpoint("shard-1", SHARD_END).await?;
        let handler = Arc::new(RecordingHandler::new("foo-event-stream"));

        client.mock_list_shards(Ok(vec![TestUtils::create_test_shard("shard-1")])).await;

        let worker = Worker::new(test_config(), client.clone(), store.clone(), factory(&handler));
        let (_tx, rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(5), worker.run(rx)).await??;

        assert!(client.iterator_requests().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_stops_without_shard_end() -> anyhow::Result<()> {
        let client = Arc::new(MockKinesisClient::new().with_endless_shards());
        let store = Arc::new(MockCheckpointStore::new());
        let handler = Arc::new(RecordingHandler::new("foo-event-stream"));

        client.mock_list_shards(Ok(vec![TestUtils::create_test_shard("shard-1")])).await;
        client
            .mock_get_records(Ok((
                vec![TestUtils::create_event_record("1", "a", "test")],
                Some("next".to_string()),
            )))
            .await;

        let worker = Worker::new(test_config(), client.clone(), store.clone(), factory(&handler));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true)?;
        tokio::time::timeout(Duration::from_secs(5), handle).await???;

        assert_eq!(handler.call_count(), 1);
        assert_eq!(store.saved_checkpoints().await, vec![("shard-1".to_string(), "1".to_string())]);
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_iterator_is_reacquired() -> anyhow::Result<()> {
        let client = Arc::new(MockKinesisClient::new());
        let store = Arc::new(MockCheckpointStore::new());
        let handler = Arc::new(RecordingHandler::new("foo-event-stream"));

        client.mock_list_shards(Ok(vec![TestUtils::create_test_shard("shard-1")])).await;
        client
            .mock_get_records(Ok((
                vec![TestUtils::create_event_record("7", "a", "test")],
                Some("next".to_string()),
            )))
            .await;
        client.mock_get_records(Err(KinesisClientError::ExpiredIterator)).await;
        client.mock_get_records(Ok((vec![], None))).await;

        let worker = Worker::new(test_config(), client.clone(), store.clone(), factory(&handler));
        let (_tx, rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(5), worker.run(rx)).await??;

        let requests = client.iterator_requests().await;
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1],
            (
                "shard-1".to_string(),
                ShardIteratorType::AfterSequenceNumber,
                Some("7".to_string())
            )
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_throttled_get_records_is_retried() -> anyhow::Result<()> {
        let client = Arc::new(MockKinesisClient::new());
        let store = Arc::new(MockCheckpointStore::new());
        let handler = Arc::new(RecordingHandler::new("foo-event-stream"));

        client.mock_list_shards(Ok(vec![TestUtils::create_test_shard("shard-1")])).await;
        client.mock_get_records(Err(KinesisClientError::ThroughputExceeded)).await;
        client
            .mock_get_records(Ok((vec![TestUtils::create_event_record("1", "a", "test")], None)))
            .await;

        let worker = Worker::new(test_config(), client.clone(), store.clone(), factory(&handler));
        let (_tx, rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(5), worker.run(rx)).await??;

        assert_eq!(handler.call_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_records_failure_is_reported() -> anyhow::Result<()> {
        let client = Arc::new(MockKinesisClient::new());
        let store = Arc::new(MockCheckpointStore::new());
        let handler = Arc::new(RecordingHandler::new("foo-event-stream"));

        client.mock_list_shards(Ok(vec![TestUtils::create_test_shard("shard-1")])).await;
        client.mock_get_records(Err(KinesisClientError::AccessDenied)).await;

        let worker = Worker::new(test_config(), client.clone(), store.clone(), factory(&handler));
        let (_tx, rx) = watch::channel(false);
        let result = tokio::time::timeout(Duration::from_secs(5), worker.run(rx)).await?;

        assert!(matches!(result, Err(ProcessorError::GetRecordsFailed(_))));
        assert!(store.saved_checkpoints().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_child_shard_starts_after_parent_ends() -> anyhow::Result<()> {
        let client = Arc::new(MockKinesisClient::new());
        let store = Arc::new(MockCheckpointStore::new());
        let handler = Arc::new(RecordingHandler::new("foo-event-stream"));

        let shards = vec![
            TestUtils::create_test_shard("parent"),
            TestUtils::create_child_shard("child", "parent"),
        ];
        client.mock_list_shards(Ok(shards.clone())).await;
        client.mock_list_shards(Ok(shards)).await;

        let worker = Worker::new(test_config(), client.clone(), store.clone(), factory(&handler));
        let (_tx, rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(5), worker.run(rx)).await??;

        let order: Vec<String> = client
            .iterator_requests()
            .await
            .into_iter()
            .map(|(shard_id, _, _)| shard_id)
            .collect();
        assert_eq!(order, vec!["parent", "child"]);

        let saved = store.saved_checkpoints().await;
        assert!(saved.contains(&("parent".to_string(), SHARD_END.to_string())));
        assert!(saved.contains(&("child".to_string(), SHARD_END.to_string())));
        Ok(())
    }

    #[tokio::test]
    async fn test_unreadable_checkpoint_fails_the_shard() -> anyhow::Result<()> {
        let client = Arc::new(MockKinesisClient::new());
        let store = Arc::new(MockCheckpointStore::new());
        store.mock_get_checkpoint(Err(anyhow::anyhow!("table is gone"))).await;
        let handler = Arc::new(RecordingHandler::new("foo-event-stream"));

        client.mock_list_shards(Ok(vec![TestUtils::create_test_shard("shard-1")])).await;
        client
            .mock_get_records(Ok((vec![TestUtils::create_event_record("1", "a", "test")], None)))
            .await;

        let worker = Worker::new(test_config(), client.clone(), store.clone(), factory(&handler));
        let (_tx, rx) = watch::channel(false);
        let result = tokio::time::timeout(Duration::from_secs(5), worker.run(rx)).await?;

        assert!(matches!(result, Err(ProcessorError::CheckpointError(_))));
        assert_eq!(handler.call_count(), 0);
        assert!(client.iterator_requests().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_parent_never_hands_over_to_child() -> anyhow::Result<()> {
        let client = Arc::new(MockKinesisClient::new());
        client.deny_reads("parent");
        let store = Arc::new(MockCheckpointStore::new());
        let handler = Arc::new(RecordingHandler::new("foo-event-stream"));

        let shards = vec![
            TestUtils::create_test_shard("parent"),
            TestUtils::create_child_shard("child", "parent"),
            TestUtils::create_test_shard("other"),
        ];
        for _ in 0..3 {
            client.mock_list_shards(Ok(shards.clone())).await;
        }

        let config = WorkerConfig {
            max_concurrent_shards: Some(1),
            ..test_config()
        };
        let worker = Worker::new(config, client.clone(), store.clone(), factory(&handler));
        let (_tx, rx) = watch::channel(false);
        let result = tokio::time::timeout(Duration::from_secs(5), worker.run(rx)).await?;

        assert!(matches!(result, Err(ProcessorError::GetRecordsFailed(_))));
        let mut order: Vec<String> = client
            .iterator_requests()
            .await
            .into_iter()
            .map(|(shard_id, _, _)| shard_id)
            .collect();
        order.sort();
        assert_eq!(order, vec!["other", "parent"]);
        assert_eq!(
            store.saved_checkpoints().await,
            vec![("other".to_string(), SHARD_END.to_string())]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_checkpointer_classifies_store_errors() -> anyhow::Result<()> {
        let store = Arc::new(MockCheckpointStore::new());
        let (tx, rx) = watch::channel(false);
        let checkpointer = StoreCheckpointer::new(store.clone(), "shard-1", rx);

        // nothing delivered yet
        checkpointer.checkpoint().await?;
        assert!(store.saved_checkpoints().await.is_empty());

        checkpointer.set_position("5");
        store
            .mock_save_checkpoint(Err(anyhow::Error::new(CheckpointError::Throttled("busy".into()))))
            .await;
        store.mock_save_checkpoint(Err(anyhow::anyhow!("socket closed"))).await;

        assert_eq!(
            checkpointer.checkpoint().await,
            Err(CheckpointError::Throttled("busy".into()))
        );
        assert!(matches!(
            checkpointer.checkpoint().await,
            Err(CheckpointError::DependencyUnavailable(_))
        ));
        checkpointer.checkpoint().await?;
        assert_eq!(store.saved_checkpoints().await, vec![("shard-1".to_string(), "5".to_string())]);

        tx.send(true)?;
        assert_eq!(checkpointer.checkpoint().await, Err(CheckpointError::Shutdown));
        Ok(())
    }

    #[test]
    fn test_initial_position_from_json() -> anyhow::Result<()> {
        let position: InitialPosition = serde_json::from_str(r#""TRIM_HORIZON""#)?;
        assert_eq!(position, InitialPosition::TrimHorizon);

        let position: InitialPosition =
            serde_json::from_str(r#"{"AT_TIMESTAMP":"2024-01-01T00:00:00Z"}"#)?;
        assert!(matches!(position, InitialPosition::AtTimestamp(_)));
        Ok(())
    }
}
