//! Hands deserialized envelopes to a handler, either inline on the shard
//! task or on a shared pool of worker tasks.

use crate::error::ProcessingError;
use crate::handler::RecordHandler;
use crate::record::Envelope;
use anyhow::anyhow;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Runs the handler, turning a panic into an ordinary dispatch failure
async fn invoke<H: RecordHandler>(handler: &H, data: H::Data, metadata: H::Metadata) -> anyhow::Result<()> {
    match AssertUnwindSafe(handler.handle(data, metadata)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(panic_error(payload)),
    }
}

fn panic_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    warn!(panic = %message, "Handler panicked");
    anyhow!("handler panicked: {}", message)
}

struct Job<H: RecordHandler> {
    data: H::Data,
    metadata: H::Metadata,
    reply: oneshot::Sender<anyhow::Result<()>>,
}

/// Fixed set of tasks pulling jobs off one queue
///
/// The shard task waits for the job's result, so the pool bounds handler
/// concurrency across shards without changing per-shard ordering.
pub struct DispatchPool<H: RecordHandler> {
    sender: Mutex<Option<mpsc::Sender<Job<H>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: RecordHandler> DispatchPool<H> {
    /// Spawns `size` workers. Must be called from within a tokio runtime.
    pub fn new(handler: Arc<H>, size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<Job<H>>(size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..size)
            .map(|worker_id| {
                let rx = rx.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };
                        let result = invoke(handler.as_ref(), job.data, job.metadata).await;
                        if job.reply.send(result).is_err() {
                            trace!(worker_id, "Dispatch caller went away before the result");
                        }
                    }
                    trace!(worker_id, "Dispatch worker stopped");
                })
            })
            .collect();

        debug!(stream_name = %handler.stream_name(), size, "Started dispatch pool");

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    pub async fn dispatch(&self, data: H::Data, metadata: H::Metadata) -> Result<(), ProcessingError> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| ProcessingError::dispatch(anyhow!("dispatch pool is shut down")))?;

        let (reply, result) = oneshot::channel();
        sender
            .send(Job {
                data,
                metadata,
                reply,
            })
            .await
            .map_err(|_| ProcessingError::dispatch(anyhow!("dispatch pool is shut down")))?;

        match result.await {
            Ok(outcome) => outcome.map_err(ProcessingError::Dispatch),
            Err(_) => {
                warn!("Dispatch worker dropped a job without answering");
                Err(ProcessingError::dispatch(anyhow!("dispatch worker dropped the job")))
            }
        }
    }

    /// Stops accepting jobs and waits for queued ones to finish
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "Dispatch worker ended abnormally");
            }
        }
    }
}

/// How a record processor reaches its handler
pub enum Dispatcher<H: RecordHandler> {
    Inline(Arc<H>),
    Pooled(Arc<DispatchPool<H>>),
}

impl<H: RecordHandler> Clone for Dispatcher<H> {
    fn clone(&self) -> Self {
        match self {
            Dispatcher::Inline(handler) => Dispatcher::Inline(handler.clone()),
            Dispatcher::Pooled(pool) => Dispatcher::Pooled(pool.clone()),
        }
    }
}

impl<H: RecordHandler> Dispatcher<H> {
    pub async fn dispatch(&self, envelope: Envelope<H::Data, H::Metadata>) -> Result<(), ProcessingError> {
        let (data, metadata) = envelope.into_parts();
        match self {
            Dispatcher::Inline(handler) => invoke(handler.as_ref(), data, metadata)
                .await
                .map_err(ProcessingError::Dispatch),
            Dispatcher::Pooled(pool) => pool.dispatch(data, metadata).await,
        }
    }
}
