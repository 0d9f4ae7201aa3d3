//! Checkpoint storage for shard progress
//!
//! Stores return `anyhow::Error`. A store that knows how its failure should be
//! classified wraps a [`CheckpointError`](crate::error::CheckpointError) so
//! the checkpointer can recover it with `downcast_ref`.

use async_trait::async_trait;

#[cfg(feature = "dynamodb-store")]
pub mod dynamodb;
pub mod memory;

/// Trait for checkpoint storage implementations
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Retrieve the checkpoint for a given shard
    async fn get_checkpoint(&self, shard_id: &str) -> anyhow::Result<Option<String>>;

    /// Save a checkpoint for a given shard
    async fn save_checkpoint(&self, shard_id: &str, sequence_number: &str) -> anyhow::Result<()>;
}

#[cfg(feature = "dynamodb-store")]
pub use dynamodb::DynamoDbCheckpointStore;
pub use memory::InMemoryCheckpointStore;
