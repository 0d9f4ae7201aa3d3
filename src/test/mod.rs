//! Test utilities and mock implementations for listeners and publishers


use aws_sdk_kinesis::types::{Record, Shard};
use serde::{Deserialize, Serialize};

/// Event payload used throughout the tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FooCreatedEvent {
    pub foo: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub sender: String,
}

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    /// Create a test record with given sequence number and raw data
    pub fn create_test_record(sequence_number: &str, data: &[u8]) -> Record {
        Record::builder()
            .sequence_number(sequence_number)
            .data(aws_smithy_types::Blob::new(data.to_vec()))
            .partition_key("test-partition-key")
            .build()
            .expect("Failed to build test record")
    }

    /// Record carrying a serialized `FooCreatedEvent` envelope
    pub fn create_event_record(sequence_number: &str, foo: &str, sender: &str) -> Record {
        let body = serde_json::json!({
            "data": { "foo": foo },
            "metadata": { "sender": sender },
        });
        Self::create_test_record(sequence_number, body.to_string().as_bytes())
    }

    /// Create a test shard with given ID
    pub fn create_test_shard(shard_id: &str) -> Shard {
        Shard::builder()
            .shard_id(shard_id)
            .build()
            .expect("Failed to build test shard")
    }

    /// Shard produced by splitting `parent_id`
    pub fn create_child_shard(shard_id: &str, parent_id: &str) -> Shard {
        Shard::builder()
            .shard_id(shard_id)
            .parent_shard_id(parent_id)
            .build()
            .expect("Failed to build test shard")
    }

    /// Create a vector of event records with sequence numbers 1..=count
    pub fn create_event_records(count: usize) -> Vec<Record> {
        (1..=count)
            .map(|i| Self::create_event_record(&i.to_string(), &format!("foo-{}", i), "test"))
            .collect()
    }
}

/// Installs a test subscriber once; honours `RUST_LOG`
#[cfg(test)]
pub fn init_logging() {
    use std::sync::Once;
    use tracing_subscriber::EnvFilter;

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("kinesis_events=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::envelope_from_record;

    #[test]
    fn test_create_test_record() {
        let record = TestUtils::create_test_record("seq-1", b"test-data");
        assert_eq!(record.sequence_number(), "seq-1");
        assert_eq!(record.data().as_ref(), b"test-data");
        assert_eq!(record.partition_key(), "test-partition-key");
    }

    #[test]
    fn test_event_records_decode() -> anyhow::Result<()> {
        let records = TestUtils::create_event_records(3);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].sequence_number(), "3");

        let envelope = envelope_from_record::<FooCreatedEvent, EventMetadata>(&records[0])?;
        assert_eq!(envelope.data.foo, "foo-1");
        assert_eq!(envelope.metadata.sender, "test");
        Ok(())
    }
}
