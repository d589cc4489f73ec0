//! A handle to interact with a running gossip reactor.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use crate::{peers::Identity, MAX_USER_PAYLOAD_BYTES};

/// An error indicating a send was attempted with a payload that exceeds
/// [`MAX_USER_PAYLOAD_BYTES`].
#[derive(Debug, thiserror::Error)]
#[error("max allowed payload size exceeded")]
#[allow(missing_copy_implementations)]
pub struct PayloadSizeError {}

/// Requests sent to the [`Reactor`] actor task.
///
/// [`Reactor`]: crate::reactor::Reactor
#[derive(Debug)]
pub(crate) enum Request {
    /// Send the given payload to all known peers.
    Broadcast(Bytes),

    /// Send the given payload to one randomly selected peer.
    SendToRandom(Bytes),

    /// Get a snapshot of the peer identities.
    GetPeers(oneshot::Sender<Vec<Identity>>),
}

/// A handle to the gossip subsystem.
///
/// All resources used by the gossip system are released once this
/// [`GossipHandle`] is dropped. To share the handle, wrap it in an
/// [`Arc`](std::sync::Arc).
#[derive(Debug)]
pub struct GossipHandle {
    tx: mpsc::Sender<Request>,
    identity: Identity,
    epoch: watch::Receiver<u64>,
}

impl GossipHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<Request>,
        identity: Identity,
        epoch: watch::Receiver<u64>,
    ) -> Self {
        Self {
            tx,
            identity,
            epoch,
        }
    }

    /// Return the randomly generated identity of this gossip instance.
    pub fn identity(&self) -> Identity {
        self.identity.clone()
    }

    /// Broadcast `payload` to all known peers, best effort.
    pub async fn broadcast<T>(&self, payload: T) -> Result<(), PayloadSizeError>
    where
        T: Into<Bytes> + Send,
    {
        let payload = payload.into();
        if payload.len() > MAX_USER_PAYLOAD_BYTES {
            return Err(PayloadSizeError {});
        }

        self.tx
            .send(Request::Broadcast(payload))
            .await
            .expect("reactor runs while a handle exists");
        Ok(())
    }

    /// Send `payload` to one randomly selected peer, best effort.
    ///
    /// This is the transmission primitive for anti-entropy state exchange:
    /// pushing the full local state to one random peer per round spreads
    /// repairs across the cluster without an all-to-all burst.
    pub async fn send_to_random<T>(&self, payload: T) -> Result<(), PayloadSizeError>
    where
        T: Into<Bytes> + Send,
    {
        let payload = payload.into();
        if payload.len() > MAX_USER_PAYLOAD_BYTES {
            return Err(PayloadSizeError {});
        }

        self.tx
            .send(Request::SendToRandom(payload))
            .await
            .expect("reactor runs while a handle exists");
        Ok(())
    }

    /// Retrieve a snapshot of the connected peer list.
    pub async fn get_peers(&self) -> Vec<Identity> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Request::GetPeers(tx))
            .await
            .expect("reactor runs while a handle exists");
        rx.await.expect("reactor always responds")
    }

    /// Observe the membership epoch: a counter incremented whenever a peer
    /// is added to, or removed from, the peer list.
    ///
    /// Consumers use this to trigger state reconciliation with new peers,
    /// and tests use it to await cluster convergence.
    pub fn membership_epoch(&self) -> watch::Receiver<u64> {
        self.epoch.clone()
    }
}
