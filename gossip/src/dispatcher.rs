//! Delivery of received user payloads to the application.

use async_trait::async_trait;
use bytes::Bytes;

use crate::Identity;

/// A delegate abstracting our application from the gossip transport.
///
/// Invoked from the reactor task for every user payload received from a
/// peer; implementations should return quickly (hand the payload to a
/// channel or task) as the reactor cannot read further frames while a
/// dispatch call is outstanding.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Process `payload`, received from the peer identified by `sender`.
    async fn dispatch(&self, payload: Bytes, sender: Identity);
}

#[async_trait]
impl Dispatcher for tokio::sync::mpsc::Sender<Bytes> {
    async fn dispatch(&self, payload: Bytes, _sender: Identity) {
        if let Err(e) = self.send(payload).await {
            observability_deps::tracing::warn!(error=%e, "dispatcher channel closed");
        }
    }
}

/// A [`Dispatcher`] that drops all payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopDispatcher;

#[async_trait]
impl Dispatcher for NopDispatcher {
    async fn dispatch(&self, _payload: Bytes, _sender: Identity) {}
}
