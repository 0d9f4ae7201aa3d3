//! Wire format shared by producers and consumers
//!
//! Every Kinesis record carries one JSON object with a `data` and a `metadata`
//! key. Older producers also wrote a `streamName` key; unknown keys are
//! ignored so those records still deserialize.

use crate::error::ProcessingError;
use aws_sdk_kinesis::types::Record;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A deserialized unit of work handed to a handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<D, M> {
    pub data: D,
    pub metadata: M,
}

impl<D, M> Envelope<D, M> {
    pub fn new(data: D, metadata: M) -> Self {
        Self { data, metadata }
    }

    pub fn into_parts(self) -> (D, M) {
        (self.data, self.metadata)
    }
}

/// Decodes the record payload as UTF-8 text
pub fn decode_record(record: &Record) -> Result<&str, ProcessingError> {
    std::str::from_utf8(record.data().as_ref()).map_err(|e| {
        ProcessingError::transformation(format!(
            "record {} is not valid UTF-8: {}",
            record.sequence_number(),
            e
        ))
    })
}

/// Parses record text into the envelope a handler expects
pub fn deserialize_envelope<D, M>(record_data: &str) -> Result<Envelope<D, M>, ProcessingError>
where
    D: DeserializeOwned,
    M: DeserializeOwned,
{
    serde_json::from_str(record_data).map_err(ProcessingError::transformation)
}

/// Decodes and parses a raw record in one step
pub fn envelope_from_record<D, M>(record: &Record) -> Result<Envelope<D, M>, ProcessingError>
where
    D: DeserializeOwned,
    M: DeserializeOwned,
{
    deserialize_envelope(decode_record(record)?)
}

pub fn serialize_envelope<D, M>(envelope: &Envelope<D, M>) -> Result<Vec<u8>, serde_json::Error>
where
    D: Serialize,
    M: Serialize,
{
    serde_json::to_vec(envelope)
}
