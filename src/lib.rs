//! Kinesis Events - typed event listeners and publishers on AWS Kinesis
//!
//! Handlers declare the payload and metadata types they expect. Records are
//! consumed per shard with at-least-once delivery: each record gets a bounded
//! number of attempts, and progress is checkpointed after every batch with its
//! own retry policy.
//!
//! ```rust,no_run
//! use kinesis_events::{handler, KinesisInboundGateway, KinesisSettings, Listener, StreamInitializer};
//! use serde::Deserialize;
//! use std::sync::Arc;
//!
//! #[derive(Deserialize)]
//! struct FooCreatedEvent {
//!     foo: String,
//! }
//!
//! #[derive(Deserialize)]
//! struct EventMetadata {
//!     sender: String,
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let settings = KinesisSettings::from_json(r#"{"region": "eu-central-1", "consumer_group": "my-service"}"#)?;
//! let gate = Arc::new(StreamInitializer::from_settings(
//!     Arc::new(settings.kinesis_client().await),
//!     &settings,
//! ));
//! let gateway = KinesisInboundGateway::from_settings(gate, settings.dynamodb_client().await, &settings);
//!
//! let listener = Listener::new(handler(
//!     "foo-event-stream",
//!     |data: FooCreatedEvent, metadata: EventMetadata| async move {
//!         println!("{} created {}", metadata.sender, data.foo);
//!         Ok::<_, anyhow::Error>(())
//!     },
//! ));
//!
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! gateway.listen(listener, shutdown_rx).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod inbound;
pub mod monitoring;
pub mod outbound;
pub mod processor;
pub mod record;
pub mod retry;
pub mod store;
pub mod stream;
pub mod validation;
pub mod worker;

// Make test utilities available to downstream crates
#[cfg(any(test, feature = "test-utils"))]
pub mod test;

pub use client::{KinesisClientError, KinesisClientTrait};
pub use config::KinesisSettings;
pub use error::{CheckpointError, ProcessingError, ProcessorError, PublishError, Result, StreamError};
pub use handler::{handler, Listener, RecordHandler};
pub use inbound::KinesisInboundGateway;
pub use outbound::KinesisOutboundGateway;
pub use record::Envelope;
pub use stream::StreamInitializer;
pub use validation::{Validator, Violation};

pub use crate::processor::{CheckpointPolicy, KinesisRecordProcessor, RecordProcessor};
pub use crate::store::{CheckpointStore, InMemoryCheckpointStore};
pub use crate::worker::{InitialPosition, Worker, WorkerConfig};

#[cfg(feature = "dynamodb-store")]
pub use crate::store::DynamoDbCheckpointStore;
