//! Monitoring events emitted by the worker and record processors
//!
//! Events travel over an optional bounded channel. `MetricsAggregator` turns
//! them into per-shard counters that are logged once per window.

mod metrics;
mod types;

pub use metrics::{MetricsAggregator, ShardMetrics};
pub use types::{MonitoringConfig, ProcessingEvent, ProcessingEventType, ShardEventType};

use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Sends an event if monitoring is enabled. A closed channel is logged, never fatal.
pub(crate) async fn send_event(tx: Option<&mpsc::Sender<ProcessingEvent>>, event: ProcessingEvent) {
    if let Some(tx) = tx {
        if let Err(e) = tx.send(event).await {
            warn!(error = %e, "Failed to send monitoring event");
        } else {
            trace!("Sent monitoring event successfully");
        }
    }
}
