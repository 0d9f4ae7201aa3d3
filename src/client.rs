use async_trait::async_trait;
use aws_sdk_kinesis::{
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::Blob,
    types::{PutRecordsRequestEntry, Record, Shard, ShardIteratorType, StreamStatus as AwsStreamStatus},
    Client,
};
use aws_smithy_types_convert::date_time::DateTimeExt;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, trace};

/// Classified failures of the Kinesis API
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KinesisClientError {
    #[error("Iterator expired")]
    ExpiredIterator,

    #[error("Provisioned throughput exceeded")]
    ThroughputExceeded,

    #[error("Access denied")]
    AccessDenied,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Resource in use: {0}")]
    ResourceInUse(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("KMS error: {0}")]
    KmsError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("{0}")]
    Other(String),
}

impl KinesisClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KinesisClientError::ResourceNotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, KinesisClientError::ResourceInUse(_))
    }

    /// Errors that go away on their own if the caller backs off
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KinesisClientError::ThroughputExceeded
                | KinesisClientError::LimitExceeded(_)
                | KinesisClientError::Timeout(_)
                | KinesisClientError::ConnectionError(_)
        )
    }
}

/// Lifecycle state of a stream as reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Creating,
    Active,
    Updating,
    Deleting,
    Unknown,
}

impl StreamStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, StreamStatus::Active)
    }
}

impl From<&AwsStreamStatus> for StreamStatus {
    fn from(status: &AwsStreamStatus) -> Self {
        match status {
            AwsStreamStatus::Active => StreamStatus::Active,
            AwsStreamStatus::Creating => StreamStatus::Creating,
            AwsStreamStatus::Updating => StreamStatus::Updating,
            AwsStreamStatus::Deleting => StreamStatus::Deleting,
            _ => StreamStatus::Unknown,
        }
    }
}

/// One record of a multi-record publish call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecordsEntry {
    pub data: Bytes,
    pub partition_key: String,
}

/// Per-record result of a multi-record publish call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutRecordResult {
    pub sequence_number: Option<String>,
    pub shard_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl PutRecordResult {
    pub fn is_failure(&self) -> bool {
        self.error_code.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutRecordsOutcome {
    pub failed_record_count: u32,
    pub records: Vec<PutRecordResult>,
}

#[async_trait]
pub trait KinesisClientTrait: Send + Sync {
    async fn describe_stream(&self, stream_name: &str) -> Result<StreamStatus, KinesisClientError>;

    async fn create_stream(
        &self,
        stream_name: &str,
        shard_count: i32,
    ) -> Result<(), KinesisClientError>;

    async fn put_records(
        &self,
        stream_name: &str,
        entries: Vec<PutRecordsEntry>,
    ) -> Result<PutRecordsOutcome, KinesisClientError>;

    async fn list_shards(&self, stream_name: &str) -> Result<Vec<Shard>, KinesisClientError>;

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
        timestamp: Option<&DateTime<Utc>>,
    ) -> Result<String, KinesisClientError>;

    async fn get_records(
        &self,
        iterator: &str,
        limit: i32,
    ) -> Result<(Vec<Record>, Option<String>), KinesisClientError>;
}

/// Maps SDK failures onto [`KinesisClientError`] using the service error code
fn classify<E, R>(err: SdkError<E, R>) -> KinesisClientError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) => {
            return KinesisClientError::Timeout(DisplayErrorContext(&err).to_string())
        }
        SdkError::DispatchFailure(_) => {
            return KinesisClientError::ConnectionError(DisplayErrorContext(&err).to_string())
        }
        _ => {}
    }

    let message = err.message().unwrap_or_default().to_string();
    match err.code() {
        Some("ResourceNotFoundException") => KinesisClientError::ResourceNotFound(message),
        Some("ResourceInUseException") => KinesisClientError::ResourceInUse(message),
        Some("ProvisionedThroughputExceededException") => KinesisClientError::ThroughputExceeded,
        Some("LimitExceededException") => KinesisClientError::LimitExceeded(message),
        Some("ExpiredIteratorException") => KinesisClientError::ExpiredIterator,
        Some("AccessDeniedException") => KinesisClientError::AccessDenied,
        Some("InvalidArgumentException") => KinesisClientError::InvalidArgument(message),
        Some(code) if code.starts_with("KMS") => KinesisClientError::KmsError(message),
        _ => KinesisClientError::Other(DisplayErrorContext(&err).to_string()),
    }
}

#[async_trait]
impl KinesisClientTrait for Client {
    async fn describe_stream(&self, stream_name: &str) -> Result<StreamStatus, KinesisClientError> {
        let response = self
            .describe_stream()
            .stream_name(stream_name)
            .send()
            .await
            .map_err(classify)?;

        let description = response.stream_description.ok_or_else(|| {
            KinesisClientError::Other(format!("No description returned for {}", stream_name))
        })?;

        let status = StreamStatus::from(description.stream_status());
        trace!(stream = %stream_name, status = ?status, "Described stream");
        Ok(status)
    }

    async fn create_stream(
        &self,
        stream_name: &str,
        shard_count: i32,
    ) -> Result<(), KinesisClientError> {
        self.create_stream()
            .stream_name(stream_name)
            .shard_count(shard_count)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn put_records(
        &self,
        stream_name: &str,
        entries: Vec<PutRecordsEntry>,
    ) -> Result<PutRecordsOutcome, KinesisClientError> {
        let records = entries
            .into_iter()
            .map(|entry| {
                PutRecordsRequestEntry::builder()
                    .data(Blob::new(entry.data.to_vec()))
                    .partition_key(entry.partition_key)
                    .build()
                    .map_err(|e| KinesisClientError::InvalidArgument(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let response = self
            .put_records()
            .stream_name(stream_name)
            .set_records(Some(records))
            .send()
            .await
            .map_err(classify)?;

        let outcome = PutRecordsOutcome {
            failed_record_count: response.failed_record_count().unwrap_or_default().max(0) as u32,
            records: response
                .records()
                .iter()
                .map(|r| PutRecordResult {
                    sequence_number: r.sequence_number().map(String::from),
                    shard_id: r.shard_id().map(String::from),
                    error_code: r.error_code().map(String::from),
                    error_message: r.error_message().map(String::from),
                })
                .collect(),
        };

        debug!(
            stream = %stream_name,
            records = outcome.records.len(),
            failed = outcome.failed_record_count,
            "Put records"
        );
        Ok(outcome)
    }

    async fn list_shards(&self, stream_name: &str) -> Result<Vec<Shard>, KinesisClientError> {
        let mut shards = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            // Kinesis rejects a stream name alongside a continuation token
            let request = match &next_token {
                Some(token) => self.list_shards().next_token(token),
                None => self.list_shards().stream_name(stream_name),
            };

            let response = request.send().await.map_err(classify)?;
            shards.extend(response.shards.unwrap_or_default());

            match response.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        Ok(shards)
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
        timestamp: Option<&DateTime<Utc>>,
    ) -> Result<String, KinesisClientError> {
        let mut req = self
            .get_shard_iterator()
            .stream_name(stream_name)
            .shard_id(shard_id)
            .shard_iterator_type(iterator_type);

        if let Some(seq) = sequence_number {
            req = req.starting_sequence_number(seq);
        }

        if let Some(ts) = timestamp {
            req = req.timestamp(aws_smithy_types::DateTime::from_chrono_utc(*ts));
        }

        let response = req.send().await.map_err(classify)?;
        response
            .shard_iterator
            .ok_or_else(|| KinesisClientError::Other(format!("No iterator returned for {}", shard_id)))
    }

    async fn get_records(
        &self,
        iterator: &str,
        limit: i32,
    ) -> Result<(Vec<Record>, Option<String>), KinesisClientError> {
        let response = self
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(classify)?;

        Ok((
            response.records().to_vec(),
            response.next_shard_iterator().map(String::from),
        ))
    }
}
