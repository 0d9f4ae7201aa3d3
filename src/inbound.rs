//! Runs a registered listener against its stream

use crate::client::KinesisClientTrait;
use crate::dispatch::{DispatchPool, Dispatcher};
use crate::error::Result;
use crate::handler::{Listener, RecordHandler};
use crate::monitoring::ProcessingEvent;
use crate::processor::{KinesisRecordProcessor, RecordProcessorConfig};
use crate::store::CheckpointStore;
use crate::stream::StreamInitializer;
use crate::worker::{Worker, WorkerConfig};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

type StoreProvider<S> = Box<dyn Fn(&str) -> Arc<S> + Send + Sync>;

/// Consumes streams on behalf of listeners
///
/// Each call to [`listen`](Self::listen) makes sure the stream exists, then
/// runs a [`Worker`] whose record processors dispatch to the listener's
/// handler until the shutdown signal is set.
pub struct KinesisInboundGateway<C: KinesisClientTrait, S: CheckpointStore> {
    gate: Arc<StreamInitializer<C>>,
    store_for: StoreProvider<S>,
    processor_config: RecordProcessorConfig,
    worker_config: WorkerConfig,
    monitoring_tx: Option<mpsc::Sender<ProcessingEvent>>,
}

impl<C, S> KinesisInboundGateway<C, S>
where
    C: KinesisClientTrait + 'static,
    S: CheckpointStore + 'static,
{
    /// `store_for` returns the checkpoint store for a stream name
    pub fn new(
        gate: Arc<StreamInitializer<C>>,
        store_for: impl Fn(&str) -> Arc<S> + Send + Sync + 'static,
        processor_config: RecordProcessorConfig,
        worker_config: WorkerConfig,
    ) -> Self {
        Self {
            gate,
            store_for: Box::new(store_for),
            processor_config,
            worker_config,
            monitoring_tx: None,
        }
    }

    pub fn with_monitoring(mut self, monitoring_tx: Option<mpsc::Sender<ProcessingEvent>>) -> Self {
        self.monitoring_tx = monitoring_tx;
        self
    }

    pub fn gate(&self) -> &Arc<StreamInitializer<C>> {
        &self.gate
    }

    /// Consumes the listener's stream until shutdown or until every shard has ended
    pub async fn listen<H: RecordHandler>(
        &self,
        listener: Listener<H>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let stream_name = listener.stream_name().to_string();
        self.gate.create_stream_if_missing(&stream_name).await?;

        let dispatcher = match listener.dispatch_pool_size {
            Some(size) => {
                debug!(stream_name = %stream_name, size, "Starting dedicated dispatch pool");
                Dispatcher::Pooled(Arc::new(DispatchPool::new(listener.handler.clone(), size)))
            }
            None => Dispatcher::Inline(listener.handler.clone()),
        };

        let factory = {
            let stream_name = stream_name.clone();
            let dispatcher = dispatcher.clone();
            let validator = listener.validator.clone();
            let config = self.processor_config.clone();
            let monitoring_tx = self.monitoring_tx.clone();
            let shutdown = shutdown.clone();
            move || {
                KinesisRecordProcessor::new(stream_name.as_str(), dispatcher.clone(), config.clone())
                    .with_validator(validator.clone())
                    .with_monitoring(monitoring_tx.clone())
                    .with_shutdown(shutdown.clone())
            }
        };

        let worker_config = WorkerConfig {
            stream_name: stream_name.clone(),
            ..self.worker_config.clone()
        };
        let worker = Worker::new(
            worker_config,
            self.gate.client().clone(),
            (self.store_for)(&stream_name),
            factory,
        )
        .with_monitoring(self.monitoring_tx.clone());

        info!(stream_name = %stream_name, "Listening on stream");
        let result = worker.run(shutdown).await;

        if let Dispatcher::Pooled(pool) = &dispatcher {
            pool.shutdown().await;
        }
        info!(stream_name = %stream_name, "Stopped listening on stream");
        result
    }
}

#[cfg(feature = "dynamodb-store")]
impl<C> KinesisInboundGateway<C, crate::store::DynamoDbCheckpointStore>
where
    C: KinesisClientTrait + 'static,
{
    /// Gateway checkpointing to the DynamoDB table named in the settings
    pub fn from_settings(
        gate: Arc<StreamInitializer<C>>,
        dynamodb: aws_sdk_dynamodb::Client,
        settings: &crate::config::KinesisSettings,
    ) -> Self {
        let table = settings.dynamodb.checkpoint_table.clone();
        let consumer_group = settings.consumer_group.clone();
        let store_for = move |stream_name: &str| {
            Arc::new(crate::store::DynamoDbCheckpointStore::for_stream(
                dynamodb.clone(),
                table.as_str(),
                &consumer_group,
                stream_name,
            ))
        };

        Self::new(
            gate,
            store_for,
            settings.record_processor_config(),
            WorkerConfig::from_settings(settings, ""),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::KinesisClientError;
    use crate::error::{ProcessorError, StreamError};
    use crate::record::Envelope;
    use crate::retry::RetryConfig;
    use crate::store::InMemoryCheckpointStore;
    use crate::test::mocks::{MockKinesisClient, RecordingHandler};
    use crate::test::{init_logging, EventMetadata, FooCreatedEvent, TestUtils};
    use crate::validation::Violation;
    use crate::worker::{InitialPosition, SHARD_END};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn gateway(
        client: &Arc<MockKinesisClient>,
        store: &InMemoryCheckpointStore,
    ) -> KinesisInboundGateway<MockKinesisClient, InMemoryCheckpointStore> {
        let gate = Arc::new(
            StreamInitializer::new(client.clone(), Duration::from_millis(200))
                .with_poll_interval(Duration::from_millis(5)),
        );
        let store = store.clone();
        KinesisInboundGateway::new(
            gate,
            move |_| Arc::new(store.clone()),
            RecordProcessorConfig {
                max_retries: 2,
                backoff: Duration::from_millis(1),
                checkpoint_backoff: Duration::from_millis(1),
                ..Default::default()
            },
            WorkerConfig {
                idle_time_between_reads: Duration::from_millis(1),
                initial_position: InitialPosition::TrimHorizon,
                retry: RetryConfig {
                    initial_backoff: Duration::from_millis(1),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_listen_creates_stream_and_dispatches() -> anyhow::Result<()> {
        init_logging();
        let client = Arc::new(MockKinesisClient::new());
        let store = InMemoryCheckpointStore::new();
        let handler = RecordingHandler::new("foo-event-stream");

        client
            .mock_list_shards(Ok(vec![TestUtils::create_test_shard("shardId-000000000000")]))
            .await;
        client
            .mock_get_records(Ok((
                vec![TestUtils::create_event_record("1", "any-field", "test")],
                None,
            )))
            .await;

        let gateway = gateway(&client, &store);
        let listener = Listener::new(handler);
        let handler = listener.handler().clone();
        let (_tx, rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(5), gateway.listen(listener, rx)).await??;

        assert_eq!(client.created_streams(), vec![("foo-event-stream".to_string(), 1)]);
        assert_eq!(
            handler.calls(),
            vec![(
                FooCreatedEvent { foo: "any-field".to_string() },
                EventMetadata { sender: "test".to_string() },
            )]
        );
        assert_eq!(
            store.snapshot().await.get("shardId-000000000000").map(String::as_str),
            Some(SHARD_END)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_listen_with_pool_and_validator() -> anyhow::Result<()> {
        let client = Arc::new(MockKinesisClient::new());
        let store = InMemoryCheckpointStore::new();

        client
            .mock_list_shards(Ok(vec![TestUtils::create_test_shard("shardId-000000000000")]))
            .await;
        client
            .mock_get_records(Ok((
                vec![
                    TestUtils::create_event_record("1", "", "test"),
                    TestUtils::create_event_record("2", "kept", "test"),
                ],
                None,
            )))
            .await;

        let listener = Listener::new(RecordingHandler::new("foo-event-stream"))
            .with_dispatch_pool(2)
            .with_validator(|envelope: &Envelope<FooCreatedEvent, EventMetadata>| {
                if envelope.data.foo.is_empty() {
                    vec![Violation::new("data.foo", "must not be empty")]
                } else {
                    vec![]
                }
            });
        let handler = listener.handler().clone();

        let (_tx, rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(5), gateway(&client, &store).listen(listener, rx))
            .await??;

        let handled: Vec<String> = handler.calls().into_iter().map(|(data, _)| data.foo).collect();
        assert_eq!(handled, vec!["kept"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_listen_fails_when_stream_cannot_be_created() -> anyhow::Result<()> {
        let client = Arc::new(MockKinesisClient::new());
        client.fail_create(KinesisClientError::LimitExceeded("too many streams".into()));
        let store = InMemoryCheckpointStore::new();

        let (_tx, rx) = watch::channel(false);
        let result = gateway(&client, &store)
            .listen(Listener::new(RecordingHandler::new("foo-event-stream")), rx)
            .await;

        assert!(matches!(
            result,
            Err(ProcessorError::Stream(StreamError::Client(KinesisClientError::LimitExceeded(_))))
        ));
        assert!(client.iterator_requests().await.is_empty());
        Ok(())
    }
}
