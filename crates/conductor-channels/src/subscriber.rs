use async_trait::async_trait;
use conductor_core::{ConductorResult, Envelope};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A bus consumer.
///
/// Delivery is at-least-once, so implementations must tolerate seeing the
/// same envelope more than once.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Stable identity; subscribing the same id twice to a channel is a no-op.
    fn id(&self) -> &str;

    async fn handle(&self, envelope: Envelope) -> ConductorResult<()>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = ConductorResult<()>> + Send>>;

/// Adapts an async closure into a [`Subscriber`].
pub struct FnSubscriber {
    id: String,
    handler: Box<dyn Fn(Envelope) -> HandlerFuture + Send + Sync>,
}

impl FnSubscriber {
    pub fn new<F, Fut>(id: impl Into<String>, handler: F) -> Arc<Self>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ConductorResult<()>> + Send + 'static,
    {
        Arc::new(Self {
            id: id.into(),
            handler: Box::new(move |envelope| Box::pin(handler(envelope))),
        })
    }
}

#[async_trait]
impl Subscriber for FnSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    async fn handle(&self, envelope: Envelope) -> ConductorResult<()> {
        (self.handler)(envelope).await
    }
}
