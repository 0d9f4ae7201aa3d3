//! Typed handler registration
//!
//! A handler states its payload and metadata types up front, so every record
//! routed to it is parsed straight into those types.

use crate::record::Envelope;
use crate::validation::Validator;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Application code that consumes events from one stream
///
/// # Examples
///
/// ```rust
/// use kinesis_events::RecordHandler;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct FooCreatedEvent {
///     foo: String,
/// }
///
/// #[derive(Deserialize)]
/// struct EventMetadata {
///     sender: String,
/// }
///
/// struct FooListener;
///
/// #[async_trait::async_trait]
/// impl RecordHandler for FooListener {
///     type Data = FooCreatedEvent;
///     type Metadata = EventMetadata;
///
///     fn stream_name(&self) -> &str {
///         "foo-event-stream"
///     }
///
///     async fn handle(&self, data: FooCreatedEvent, metadata: EventMetadata) -> anyhow::Result<()> {
///         println!("{} sent {}", metadata.sender, data.foo);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait RecordHandler: Send + Sync + 'static {
    type Data: DeserializeOwned + Send + 'static;
    type Metadata: DeserializeOwned + Send + 'static;

    /// Stream this handler listens on
    fn stream_name(&self) -> &str;

    /// Handle one event. An error counts as a failed attempt and is retried.
    async fn handle(&self, data: Self::Data, metadata: Self::Metadata) -> anyhow::Result<()>;
}

/// [`RecordHandler`] backed by a closure
pub struct FnRecordHandler<D, M, F> {
    stream_name: String,
    handler: F,
    _types: PhantomData<fn(D, M)>,
}

#[async_trait]
impl<D, M, F, Fut> RecordHandler for FnRecordHandler<D, M, F>
where
    D: DeserializeOwned + Send + 'static,
    M: DeserializeOwned + Send + 'static,
    F: Fn(D, M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    type Data = D;
    type Metadata = M;

    fn stream_name(&self) -> &str {
        &self.stream_name
    }

    async fn handle(&self, data: D, metadata: M) -> anyhow::Result<()> {
        (self.handler)(data, metadata).await
    }
}

/// Builds a handler for `stream_name` from a closure taking `(data, metadata)`
pub fn handler<D, M, F, Fut>(stream_name: impl Into<String>, handler: F) -> FnRecordHandler<D, M, F>
where
    F: Fn(D, M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnRecordHandler {
        stream_name: stream_name.into(),
        handler,
        _types: PhantomData,
    }
}

pub type EnvelopeValidator<H> =
    Arc<dyn Validator<Envelope<<H as RecordHandler>::Data, <H as RecordHandler>::Metadata>>>;

/// A handler plus the per-listener options the inbound gateway honours
pub struct Listener<H: RecordHandler> {
    pub(crate) handler: Arc<H>,
    pub(crate) validator: Option<EnvelopeValidator<H>>,
    pub(crate) dispatch_pool_size: Option<usize>,
}

impl<H: RecordHandler> Listener<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            validator: None,
            dispatch_pool_size: None,
        }
    }

    /// Skip envelopes the validator rejects instead of handing them to the handler
    pub fn with_validator(
        mut self,
        validator: impl Validator<Envelope<H::Data, H::Metadata>> + 'static,
    ) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Run the handler on its own pool of `size` tasks shared by all shards
    pub fn with_dispatch_pool(mut self, size: usize) -> Self {
        self.dispatch_pool_size = Some(size.max(1));
        self
    }

    pub fn stream_name(&self) -> &str {
        self.handler.stream_name()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }
}
