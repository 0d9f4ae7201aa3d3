use crate::error::CheckpointError;
use crate::store::CheckpointStore;
use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    types::AttributeValue,
    Client as DynamoClient,
};
use tracing::{debug, instrument, trace};

const KEY_ATTRIBUTE: &str = "shard_id";
const CHECKPOINT_ATTRIBUTE: &str = "sequence_number";

/// Checkpoints in a DynamoDB table keyed by `{consumer_group}:{stream}:{shard}`
///
/// The table needs a string partition key named `shard_id`.
#[derive(Debug, Clone)]
pub struct DynamoDbCheckpointStore {
    client: DynamoClient,
    table_name: String,
    key_prefix: String,
}

impl DynamoDbCheckpointStore {
    pub fn builder() -> DynamoDbCheckpointStoreBuilder {
        DynamoDbCheckpointStoreBuilder::default()
    }

    /// Store scoped to one consumer group reading one stream
    pub fn for_stream(
        client: DynamoClient,
        table_name: impl Into<String>,
        consumer_group: &str,
        stream_name: &str,
    ) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            key_prefix: key_prefix(consumer_group, stream_name),
        }
    }

    fn prefixed_key(&self, shard_id: &str) -> String {
        format!("{}{}", self.key_prefix, shard_id)
    }
}

fn key_prefix(consumer_group: &str, stream_name: &str) -> String {
    format!("{}:{}:", consumer_group, stream_name)
}

/// Maps a DynamoDB error code onto the checkpoint error classes
fn classify_code(code: Option<&str>, message: String) -> CheckpointError {
    match code {
        Some("ProvisionedThroughputExceededException")
        | Some("ThrottlingException")
        | Some("RequestLimitExceeded") => CheckpointError::Throttled(message),
        Some("ResourceNotFoundException") => CheckpointError::InvalidState(message),
        _ => CheckpointError::DependencyUnavailable(message),
    }
}

fn classify<E, R>(err: SdkError<E, R>) -> anyhow::Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    anyhow::Error::new(classify_code(err.code(), message))
}

#[async_trait]
impl CheckpointStore for DynamoDbCheckpointStore {
    #[instrument(skip(self), fields(table = %self.table_name, prefix = %self.key_prefix))]
    async fn get_checkpoint(&self, shard_id: &str) -> anyhow::Result<Option<String>> {
        let key = self.prefixed_key(shard_id);
        trace!(key = %key, "Getting checkpoint from DynamoDB");

        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(KEY_ATTRIBUTE, AttributeValue::S(key.clone()))
            .consistent_read(true)
            .send()
            .await
            .map_err(classify)?;

        let checkpoint = response
            .item
            .and_then(|item| item.get(CHECKPOINT_ATTRIBUTE).cloned())
            .and_then(|attr| attr.as_s().ok().map(|s| s.to_string()));

        debug!(key = %key, checkpoint = ?checkpoint, "Retrieved checkpoint from DynamoDB");
        Ok(checkpoint)
    }

    #[instrument(skip(self), fields(table = %self.table_name, prefix = %self.key_prefix))]
    async fn save_checkpoint(&self, shard_id: &str, sequence_number: &str) -> anyhow::Result<()> {
        let key = self.prefixed_key(shard_id);

        self.client
            .put_item()
            .table_name(&self.table_name)
            .item(KEY_ATTRIBUTE, AttributeValue::S(key.clone()))
            .item(CHECKPOINT_ATTRIBUTE, AttributeValue::S(sequence_number.to_string()))
            .send()
            .await
            .map_err(classify)?;

        debug!(key = %key, sequence_number = %sequence_number, "Saved checkpoint to DynamoDB");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DynamoDbCheckpointStoreBuilder {
    client: Option<DynamoClient>,
    table_name: Option<String>,
    key_prefix: Option<String>,
}

impl DynamoDbCheckpointStoreBuilder {
    pub fn with_client(mut self, client: DynamoClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn with_consumer(mut self, consumer_group: &str, stream_name: &str) -> Self {
        self.key_prefix = Some(key_prefix(consumer_group, stream_name));
        self
    }

    pub fn build(self) -> anyhow::Result<DynamoDbCheckpointStore> {
        Ok(DynamoDbCheckpointStore {
            client: self
                .client
                .ok_or_else(|| anyhow::anyhow!("DynamoDB client is required"))?,
            table_name: self
                .table_name
                .ok_or_else(|| anyhow::anyhow!("Table name is required"))?,
            key_prefix: self.key_prefix.unwrap_or_default(),
        })
    }
}
