//! Wire format of gossip frames.
//!
//! Defined as prost-derived types rather than a compiled `.proto` so the
//! build has no system protoc dependency; the field tags below are the wire
//! contract.

use bytes::Bytes;

/// A single UDP datagram exchanged between peers.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct Frame {
    /// The sender's 128-bit random identity.
    #[prost(bytes = "bytes", tag = "1")]
    pub(crate) identity: Bytes,

    /// One or more messages batched into this frame.
    #[prost(message, repeated, tag = "2")]
    pub(crate) messages: Vec<FrameMessage>,
}

/// A single message within a [`Frame`].
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct FrameMessage {
    #[prost(oneof = "Payload", tags = "1, 2, 3")]
    pub(crate) payload: Option<Payload>,
}

/// The possible contents of a [`FrameMessage`].
#[derive(Clone, PartialEq, prost::Oneof)]
pub(crate) enum Payload {
    /// A liveness probe / announcement, answered with a [`Pong`].
    #[prost(message, tag = "1")]
    Ping(Ping),

    /// A probe response carrying the responder's peer list.
    #[prost(message, tag = "2")]
    Pong(Pong),

    /// An opaque application payload.
    #[prost(bytes = "bytes", tag = "3")]
    UserData(Bytes),
}

/// Probe request.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub(crate) struct Ping {}

/// Probe response, doubling as the peer-exchange mechanism.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct Pong {
    /// Every peer known to the sender.
    #[prost(message, repeated, tag = "1")]
    pub(crate) peers: Vec<Peer>,
}

/// A single entry of a peer exchange.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct Peer {
    #[prost(bytes = "bytes", tag = "1")]
    pub(crate) identity: Bytes,

    /// The peer's socket address in `ip:port` form.
    #[prost(string, tag = "2")]
    pub(crate) address: String,
}
