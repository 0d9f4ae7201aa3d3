//! Stream lifecycle gate
//!
//! Makes sure a stream exists and is active before anything reads from or
//! writes to it. One gate is shared by every listener and publisher in the
//! process; it remembers which streams it has already seen active and keeps
//! concurrent callers from creating the same stream twice.

use crate::client::KinesisClientTrait;
use crate::config::KinesisSettings;
use crate::error::StreamError;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct StreamInitializer<C: KinesisClientTrait> {
    client: Arc<C>,
    create_streams: bool,
    creation_timeout: Duration,
    poll_interval: Duration,
    default_shard_count: i32,
    shard_counts: HashMap<String, i32>,
    active_streams: RwLock<HashSet<String>>,
    creation_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<C: KinesisClientTrait> StreamInitializer<C> {
    /// Gate that creates missing streams with one shard
    pub fn new(client: Arc<C>, creation_timeout: Duration) -> Self {
        Self {
            client,
            create_streams: true,
            creation_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_shard_count: 1,
            shard_counts: HashMap::new(),
            active_streams: RwLock::new(HashSet::new()),
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(client: Arc<C>, settings: &KinesisSettings) -> Self {
        let shard_counts = settings
            .consumer
            .iter()
            .chain(settings.producer.iter())
            .filter_map(|s| s.shard_count.map(|count| (s.stream_name.clone(), count)))
            .collect();

        Self {
            create_streams: settings.create_streams,
            default_shard_count: settings.shard_count,
            shard_counts,
            ..Self::new(client, settings.creation_timeout())
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn is_known_active(&self, stream_name: &str) -> bool {
        self.active_streams.read().contains(stream_name)
    }

    fn mark_active(&self, stream_name: &str) {
        self.active_streams.write().insert(stream_name.to_string());
    }

    fn creation_lock(&self, stream_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.creation_locks
            .lock()
            .entry(stream_name.to_string())
            .or_default()
            .clone()
    }

    pub fn shard_count_for(&self, stream_name: &str) -> i32 {
        self.shard_counts
            .get(stream_name)
            .copied()
            .unwrap_or(self.default_shard_count)
    }

    /// Creates the stream when stream creation is enabled. Does nothing otherwise.
    pub async fn create_stream_if_missing(&self, stream_name: &str) -> Result<(), StreamError> {
        if !self.create_streams {
            trace!(stream_name = %stream_name, "Stream creation disabled, assuming stream exists");
            return Ok(());
        }
        self.ensure_active(stream_name, self.shard_count_for(stream_name))
            .await
    }

    /// Returns once the stream reports active, creating it if it does not exist
    ///
    /// With stream creation disabled a missing stream is [`StreamError::NotFound`].
    pub async fn ensure_active(&self, stream_name: &str, shard_count: i32) -> Result<(), StreamError> {
        if self.is_known_active(stream_name) {
            return Ok(());
        }

        match self.client.describe_stream(stream_name).await {
            Ok(status) if status.is_active() => {
                debug!(stream_name = %stream_name, "Stream is active");
                self.mark_active(stream_name);
                Ok(())
            }
            Ok(status) => {
                debug!(stream_name = %stream_name, status = ?status, "Stream not active yet");
                self.wait_for_active(stream_name).await
            }
            Err(e) if e.is_not_found() && !self.create_streams => {
                Err(StreamError::NotFound(stream_name.to_string()))
            }
            Err(e) if e.is_not_found() => self.create_and_wait(stream_name, shard_count).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn create_and_wait(&self, stream_name: &str, shard_count: i32) -> Result<(), StreamError> {
        let lock = self.creation_lock(stream_name);
        let _guard = lock.lock().await;

        if self.is_known_active(stream_name) {
            debug!(stream_name = %stream_name, "Stream became active while waiting for creation lock");
            return Ok(());
        }

        info!(stream_name = %stream_name, shard_count, "Creating stream");
        match self.client.create_stream(stream_name, shard_count).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                debug!(stream_name = %stream_name, "Stream already being created elsewhere");
            }
            Err(e) => {
                warn!(stream_name = %stream_name, error = %e, "Failed to create stream");
                return Err(e.into());
            }
        }

        self.wait_for_active(stream_name).await
    }

    async fn wait_for_active(&self, stream_name: &str) -> Result<(), StreamError> {
        let deadline = Instant::now() + self.creation_timeout;

        loop {
            match self.client.describe_stream(stream_name).await {
                Ok(status) if status.is_active() => {
                    info!(stream_name = %stream_name, "Stream is active");
                    self.mark_active(stream_name);
                    return Ok(());
                }
                Ok(status) => {
                    trace!(stream_name = %stream_name, status = ?status, "Waiting for stream");
                }
                Err(e) if e.is_not_found() => {
                    trace!(stream_name = %stream_name, "Stream not visible yet");
                }
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    stream_name = %stream_name,
                    timeout = ?self.creation_timeout,
                    "Stream did not become active in time"
                );
                return Err(StreamError::ActivationTimeout {
                    stream: stream_name.to_string(),
                    timeout: self.creation_timeout,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}
