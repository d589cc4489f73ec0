//! The set of currently-known peers and their health bookkeeping.

use std::{collections::HashMap, net::SocketAddr};

use bytes::Bytes;
use observability_deps::tracing::{debug, info, warn};
use rand::seq::IteratorRandom;
use tokio::time::Instant;
use tokio::{net::UdpSocket, sync::watch};

use crate::{frame, MAX_PING_UNACKED};

/// The randomly generated, 128-bit identity of a gossip instance.
///
/// Identities are regenerated at process start: a restarted node rejoins the
/// cluster as a new peer.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Identity(Bytes);

/// The error returned when constructing an [`Identity`] from bytes of the
/// wrong length.
#[derive(Debug, thiserror::Error)]
#[error("invalid identity length")]
pub struct InvalidIdentity;

impl Identity {
    pub(crate) fn new() -> Self {
        Self(Bytes::copy_from_slice(uuid::Uuid::new_v4().as_bytes()))
    }

    pub(crate) fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl TryFrom<Bytes> for Identity {
    type Error = InvalidIdentity;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        if value.len() != 16 {
            return Err(InvalidIdentity);
        }
        Ok(Self(value))
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        uuid::Uuid::from_slice(&self.0)
            .expect("identity is always 16 bytes")
            .fmt(f)
    }
}

/// A peer this node has observed traffic from.
#[derive(Debug)]
pub(crate) struct Peer {
    identity: Identity,
    addr: SocketAddr,
    last_observed: Instant,
}

impl Peer {
    /// Record that a frame was received from this peer.
    pub(crate) fn mark_observed(&mut self) {
        self.last_observed = Instant::now();
    }

    pub(crate) async fn send(&self, buf: &[u8], socket: &UdpSocket) -> std::io::Result<usize> {
        let ret = socket.send_to(buf, self.addr).await;
        match &ret {
            Ok(n_bytes) => debug!(identity=%self.identity, n_bytes, peer_addr=%self.addr, "send frame"),
            Err(e) => warn!(identity=%self.identity, error=%e, peer_addr=%self.addr, "frame send error"),
        }
        ret
    }
}

impl From<&Peer> for frame::Peer {
    fn from(p: &Peer) -> Self {
        Self {
            identity: p.identity.as_bytes().clone(),
            address: p.addr.to_string(),
        }
    }
}

/// The set of known, believed-healthy peers.
///
/// Every addition or removal increments the membership epoch observed by the
/// layer above - a changed epoch is its signal to reconcile state with the
/// (new) peers.
#[derive(Debug)]
pub(crate) struct PeerList {
    peers: HashMap<Identity, Peer>,
    epoch: watch::Sender<u64>,
}

impl PeerList {
    pub(crate) fn with_capacity(capacity: usize, epoch: watch::Sender<u64>) -> Self {
        Self {
            peers: HashMap::with_capacity(capacity),
            epoch,
        }
    }

    fn bump_epoch(&self) {
        self.epoch.send_modify(|e| *e += 1);
    }

    /// The identities of all known peers.
    pub(crate) fn peer_identities(&self) -> Vec<Identity> {
        self.peers.keys().cloned().collect()
    }

    pub(crate) fn peers(&self) -> impl Iterator<Item = &'_ Peer> {
        self.peers.values()
    }

    /// Returns true if `identity` is a known peer.
    pub(crate) fn contains(&self, identity: &Identity) -> bool {
        self.peers.contains_key(identity)
    }

    /// Find or insert the peer, updating its address if it changed.
    pub(crate) fn upsert(&mut self, identity: &Identity, addr: SocketAddr) -> &mut Peer {
        if !self.peers.contains_key(identity) {
            self.peers.insert(
                identity.clone(),
                Peer {
                    identity: identity.clone(),
                    addr,
                    last_observed: Instant::now(),
                },
            );
            info!(%identity, peer_addr=%addr, "discovered new peer");
            self.bump_epoch();
        }

        let peer = self
            .peers
            .get_mut(identity)
            .expect("peer was just inserted");
        if peer.addr != addr {
            info!(%identity, old_addr=%peer.addr, peer_addr=%addr, "peer address changed");
            peer.addr = addr;
        }
        peer
    }

    /// Send `buf` to every known peer.
    pub(crate) async fn broadcast(&self, buf: &[u8], socket: &UdpSocket) {
        for peer in self.peers.values() {
            let _ = peer.send(buf, socket).await;
        }
    }

    /// Send `buf` to one randomly selected peer, returning its identity, or
    /// `None` if no peers are known.
    pub(crate) async fn send_to_random(&self, buf: &[u8], socket: &UdpSocket) -> Option<Identity> {
        let peer = self.peers.values().choose(&mut rand::thread_rng())?;
        let _ = peer.send(buf, socket).await;
        Some(peer.identity.clone())
    }

    /// Remove peers not observed within [`MAX_PING_UNACKED`], and send a
    /// PING to everyone remaining.
    pub(crate) async fn ping_gc(&mut self, ping_frame: &[u8], socket: &UdpSocket) {
        let dead = self
            .peers
            .values()
            .filter(|p| p.last_observed.elapsed() > MAX_PING_UNACKED)
            .map(|p| p.identity.clone())
            .collect::<Vec<_>>();

        for identity in dead {
            let peer = self.peers.remove(&identity).expect("dead peer is known");
            info!(%identity, peer_addr=%peer.addr, "removed unreachable peer");
            self.bump_epoch();
        }

        for peer in self.peers.values() {
            let _ = peer.send(ping_frame, socket).await;
        }
    }
}
