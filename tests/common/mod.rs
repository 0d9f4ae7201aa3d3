// tests/common/mod.rs
#![allow(dead_code)]

use async_trait::async_trait;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::{Record, Shard, ShardIteratorType};
use chrono::{DateTime, Utc};
use kinesis_events::client::{
    KinesisClientError, KinesisClientTrait, PutRecordResult, PutRecordsEntry, PutRecordsOutcome,
    StreamStatus,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Once;

pub const SHARD_ID: &str = "shardId-000000000000";

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kinesis_events=debug")),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FooCreatedEvent {
    pub foo: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub sender: String,
}

#[derive(Debug, Default)]
struct StreamState {
    shard_count: i32,
    records: Vec<(String, Vec<u8>)>,
    closed: bool,
}

/// Single-shard Kinesis kept in memory
///
/// Publishes append to the shard; iterators are `{stream}/{position}`.
/// A shard only ends once the stream has been closed and fully read.
#[derive(Debug, Default)]
pub struct InMemoryKinesis {
    streams: Mutex<HashMap<String, StreamState>>,
}

impl InMemoryKinesis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the shard closed so readers reach shard end
    pub fn close_stream(&self, stream_name: &str) {
        if let Some(stream) = self.streams.lock().get_mut(stream_name) {
            stream.closed = true;
        }
    }

    pub fn shard_count(&self, stream_name: &str) -> Option<i32> {
        self.streams.lock().get(stream_name).map(|s| s.shard_count)
    }

    pub fn record_count(&self, stream_name: &str) -> usize {
        self.streams
            .lock()
            .get(stream_name)
            .map_or(0, |s| s.records.len())
    }

    fn not_found(stream_name: &str) -> KinesisClientError {
        KinesisClientError::ResourceNotFound(format!("Stream {} not found", stream_name))
    }
}

fn parse_iterator(iterator: &str) -> Result<(&str, usize), KinesisClientError> {
    iterator
        .rsplit_once('/')
        .and_then(|(stream, position)| position.parse().ok().map(|p| (stream, p)))
        .ok_or_else(|| KinesisClientError::InvalidArgument(format!("bad iterator {}", iterator)))
}

#[async_trait]
impl KinesisClientTrait for InMemoryKinesis {
    async fn describe_stream(&self, stream_name: &str) -> Result<StreamStatus, KinesisClientError> {
        match self.streams.lock().get(stream_name) {
            Some(_) => Ok(StreamStatus::Active),
            None => Err(Self::not_found(stream_name)),
        }
    }

    async fn create_stream(&self, stream_name: &str, shard_count: i32) -> Result<(), KinesisClientError> {
        let mut streams = self.streams.lock();
        if streams.contains_key(stream_name) {
            return Err(KinesisClientError::ResourceInUse(stream_name.to_string()));
        }
        streams.insert(
            stream_name.to_string(),
            StreamState {
                shard_count,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn put_records(
        &self,
        stream_name: &str,
        entries: Vec<PutRecordsEntry>,
    ) -> Result<PutRecordsOutcome, KinesisClientError> {
        let mut streams = self.streams.lock();
        let stream = streams
            .get_mut(stream_name)
            .ok_or_else(|| Self::not_found(stream_name))?;

        let records = entries
            .into_iter()
            .map(|entry| {
                let sequence_number = format!("{:020}", stream.records.len() + 1);
                stream.records.push((entry.partition_key, entry.data.to_vec()));
                PutRecordResult {
                    sequence_number: Some(sequence_number),
                    shard_id: Some(SHARD_ID.to_string()),
                    ..Default::default()
                }
            })
            .collect();

        Ok(PutRecordsOutcome {
            failed_record_count: 0,
            records,
        })
    }

    async fn list_shards(&self, stream_name: &str) -> Result<Vec<Shard>, KinesisClientError> {
        if !self.streams.lock().contains_key(stream_name) {
            return Err(Self::not_found(stream_name));
        }
        Ok(vec![Shard::builder()
            .shard_id(SHARD_ID)
            .build()
            .map_err(|e| KinesisClientError::Other(e.to_string()))?])
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        _shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
        _timestamp: Option<&DateTime<Utc>>,
    ) -> Result<String, KinesisClientError> {
        let streams = self.streams.lock();
        let stream = streams
            .get(stream_name)
            .ok_or_else(|| Self::not_found(stream_name))?;

        let position = match iterator_type {
            ShardIteratorType::Latest => stream.records.len(),
            ShardIteratorType::AfterSequenceNumber => sequence_number
                .and_then(|seq| seq.parse::<usize>().ok())
                .ok_or_else(|| KinesisClientError::InvalidArgument("sequence number".into()))?,
            _ => 0,
        };
        Ok(format!("{}/{}", stream_name, position))
    }

    async fn get_records(
        &self,
        iterator: &str,
        limit: i32,
    ) -> Result<(Vec<Record>, Option<String>), KinesisClientError> {
        let (stream_name, position) = parse_iterator(iterator)?;
        let streams = self.streams.lock();
        let stream = streams
            .get(stream_name)
            .ok_or_else(|| Self::not_found(stream_name))?;

        let end = (position + limit.max(1) as usize).min(stream.records.len());
        let records = stream.records[position.min(end)..end]
            .iter()
            .enumerate()
            .map(|(offset, (partition_key, data))| {
                Record::builder()
                    .sequence_number(format!("{:020}", position + offset + 1))
                    .partition_key(partition_key.as_str())
                    .data(Blob::new(data.clone()))
                    .build()
                    .map_err(|e| KinesisClientError::Other(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let next = if stream.closed && end >= stream.records.len() {
            None
        } else {
            Some(format!("{}/{}", stream_name, end))
        };
        Ok((records, next))
    }
}
