//! Flat settings object read once at startup

use crate::error::ProcessorError;
use crate::processor::{CheckpointPolicy, RecordProcessorConfig};
use crate::worker::InitialPosition;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Region name that switches clients to static local credentials
pub const LOCAL_REGION: &str = "local";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KinesisSettings {
    /// AWS region, e.g. `eu-central-1`, or `local` for a local Kinesis emulator
    pub region: String,
    /// Overrides `https://kinesis.{region}.amazonaws.com`
    pub kinesis_url: Option<String>,
    pub dynamodb: DynamoDbSettings,
    /// Name shared by all processes consuming the same streams together
    pub consumer_group: String,
    pub retry: RetrySettings,
    pub initial_position: InitialPosition,
    pub checkpoint_policy: CheckpointPolicy,
    pub create_streams: bool,
    pub creation_timeout_in_millis: u64,
    pub shard_count: i32,
    pub batch_size: i32,
    pub idle_time_between_reads_in_millis: u64,
    pub max_concurrent_shards: Option<u32>,
    pub consumer: Vec<StreamSettings>,
    pub producer: Vec<StreamSettings>,
}

impl Default for KinesisSettings {
    fn default() -> Self {
        Self {
            region: String::new(),
            kinesis_url: None,
            dynamodb: DynamoDbSettings::default(),
            consumer_group: String::new(),
            retry: RetrySettings::default(),
            initial_position: InitialPosition::Latest,
            checkpoint_policy: CheckpointPolicy::Always,
            create_streams: false,
            creation_timeout_in_millis: 30_000,
            shard_count: 1,
            batch_size: 100,
            idle_time_between_reads_in_millis: 1_000,
            max_concurrent_shards: None,
            consumer: Vec::new(),
            producer: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt, for both records and checkpoints
    pub max_retries: u32,
    pub backoff_time_in_millis: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_time_in_millis: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DynamoDbSettings {
    /// Overrides `https://dynamodb.{region}.amazonaws.com`
    pub url: Option<String>,
    pub checkpoint_table: String,
}

impl Default for DynamoDbSettings {
    fn default() -> Self {
        Self {
            url: None,
            checkpoint_table: "kinesis-checkpoints".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamSettings {
    pub stream_name: String,
    /// Shard count used when the stream has to be created
    pub shard_count: Option<i32>,
}

impl KinesisSettings {
    pub fn from_json(json: &str) -> Result<Self, ProcessorError> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| ProcessorError::ConfigError(format!("Invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ProcessorError> {
        if self.region.trim().is_empty() {
            return Err(ProcessorError::ConfigError("region must be set".to_string()));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(ProcessorError::ConfigError(
                "consumer_group must be set".to_string(),
            ));
        }
        if self.shard_count < 1 {
            return Err(ProcessorError::ConfigError(
                "shard_count must be at least 1".to_string(),
            ));
        }
        if let Some(stream) = self
            .consumer
            .iter()
            .chain(&self.producer)
            .find(|stream| stream.shard_count.is_some_and(|count| count < 1))
        {
            return Err(ProcessorError::ConfigError(format!(
                "shard_count for {} must be at least 1",
                stream.stream_name
            )));
        }
        if !(1..=10_000).contains(&self.batch_size) {
            return Err(ProcessorError::ConfigError(
                "batch_size must be between 1 and 10000".to_string(),
            ));
        }
        Ok(())
    }

    pub fn kinesis_url(&self) -> String {
        self.kinesis_url
            .clone()
            .unwrap_or_else(|| format!("https://kinesis.{}.amazonaws.com", self.region))
    }

    pub fn dynamodb_url(&self) -> String {
        self.dynamodb
            .url
            .clone()
            .unwrap_or_else(|| format!("https://dynamodb.{}.amazonaws.com", self.region))
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.retry.backoff_time_in_millis)
    }

    pub fn creation_timeout(&self) -> Duration {
        Duration::from_millis(self.creation_timeout_in_millis)
    }

    pub fn idle_time_between_reads(&self) -> Duration {
        Duration::from_millis(self.idle_time_between_reads_in_millis)
    }

    pub fn is_local(&self) -> bool {
        self.region == LOCAL_REGION
    }

    pub fn consumer_settings_or_default(&self, stream_name: &str) -> StreamSettings {
        Self::settings_or_default(&self.consumer, stream_name)
    }

    pub fn producer_settings_or_default(&self, stream_name: &str) -> StreamSettings {
        Self::settings_or_default(&self.producer, stream_name)
    }

    fn settings_or_default(streams: &[StreamSettings], stream_name: &str) -> StreamSettings {
        streams
            .iter()
            .find(|s| s.stream_name == stream_name)
            .cloned()
            .unwrap_or_else(|| StreamSettings {
                stream_name: stream_name.to_string(),
                shard_count: None,
            })
    }

    /// Shard count for a stream that has to be created
    pub fn shard_count_for(&self, stream_name: &str) -> i32 {
        self.consumer
            .iter()
            .chain(self.producer.iter())
            .find(|s| s.stream_name == stream_name)
            .and_then(|s| s.shard_count)
            .unwrap_or(self.shard_count)
    }

    /// Retry and checkpoint settings for one record processor
    pub fn record_processor_config(&self) -> RecordProcessorConfig {
        RecordProcessorConfig {
            max_retries: self.retry.max_retries,
            backoff: self.backoff(),
            checkpoint_max_retries: self.retry.max_retries,
            checkpoint_backoff: self.backoff(),
            checkpoint_policy: self.checkpoint_policy,
        }
    }

    async fn sdk_config(&self) -> aws_config::SdkConfig {
        let loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()));

        let loader = if self.is_local() {
            loader.credentials_provider(Credentials::new(
                "no-key",
                "no-passwd",
                None,
                None,
                "kinesis-local",
            ))
        } else {
            loader
        };

        loader.load().await
    }

    pub async fn kinesis_client(&self) -> aws_sdk_kinesis::Client {
        let sdk_config = self.sdk_config().await;
        let url = self.kinesis_url();
        debug!(url = %url, region = %self.region, "Creating Kinesis client");

        let config = aws_sdk_kinesis::config::Builder::from(&sdk_config)
            .endpoint_url(url)
            .build();
        aws_sdk_kinesis::Client::from_conf(config)
    }

    pub async fn dynamodb_client(&self) -> aws_sdk_dynamodb::Client {
        let sdk_config = self.sdk_config().await;
        let url = self.dynamodb_url();
        debug!(url = %url, region = %self.region, "Creating DynamoDB client");

        let config = aws_sdk_dynamodb::config::Builder::from(&sdk_config)
            .endpoint_url(url)
            .build();
        aws_sdk_dynamodb::Client::from_conf(config)
    }
}
