//! Publishing typed events

use crate::client::{KinesisClientTrait, PutRecordsEntry, PutRecordsOutcome};
use crate::error::PublishError;
use crate::record::{serialize_envelope, Envelope};
use crate::stream::StreamInitializer;
use crate::validation::{validate_all, Validator};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Turns envelopes into publish entries
pub struct RequestFactory;

impl RequestFactory {
    /// One entry per envelope, each with its own random partition key
    pub fn create_entries<D, M>(records: &[Envelope<D, M>]) -> Result<Vec<PutRecordsEntry>, serde_json::Error>
    where
        D: Serialize,
        M: Serialize,
    {
        records
            .iter()
            .map(|envelope| {
                Ok(PutRecordsEntry {
                    data: Bytes::from(serialize_envelope(envelope)?),
                    partition_key: Uuid::new_v4().to_string(),
                })
            })
            .collect()
    }
}

/// Sends envelopes to streams, creating them first when allowed
pub struct KinesisOutboundGateway<C: KinesisClientTrait> {
    gate: Arc<StreamInitializer<C>>,
}

impl<C: KinesisClientTrait> KinesisOutboundGateway<C> {
    pub fn new(gate: Arc<StreamInitializer<C>>) -> Self {
        Self { gate }
    }

    /// Publishes `records` in a single call
    ///
    /// Records the service rejects individually are reported in the returned
    /// outcome, not as an error.
    pub async fn send<D, M>(
        &self,
        stream_name: &str,
        records: &[Envelope<D, M>],
    ) -> Result<PutRecordsOutcome, PublishError>
    where
        D: Serialize,
        M: Serialize,
    {
        if records.is_empty() {
            trace!(stream_name = %stream_name, "Nothing to send");
            return Ok(PutRecordsOutcome::default());
        }

        let entries = RequestFactory::create_entries(records)?;

        self.gate
            .ensure_active(stream_name, self.gate.shard_count_for(stream_name))
            .await?;

        debug!(stream_name = %stream_name, count = entries.len(), "Sending records");
        let outcome = self.gate.client().put_records(stream_name, entries).await?;

        if outcome.failed_record_count > 0 {
            let first_error = outcome
                .records
                .iter()
                .find(|r| r.is_failure())
                .and_then(|r| r.error_code.clone());
            warn!(
                stream_name = %stream_name,
                failed = outcome.failed_record_count,
                total = records.len(),
                first_error = ?first_error,
                "Some records were rejected"
            );
        }

        Ok(outcome)
    }

    /// Like [`send`](Self::send), but rejects the whole batch if any record fails validation
    pub async fn send_validated<D, M>(
        &self,
        stream_name: &str,
        records: &[Envelope<D, M>],
        validator: &dyn Validator<Envelope<D, M>>,
    ) -> Result<PutRecordsOutcome, PublishError>
    where
        D: Serialize,
        M: Serialize,
    {
        let violations = validate_all(validator, records);
        if !violations.is_empty() {
            warn!(
                stream_name = %stream_name,
                violations = violations.len(),
                "Rejecting batch that failed validation"
            );
            return Err(PublishError::Validation(violations));
        }

        self.send(stream_name, records).await
    }
}
