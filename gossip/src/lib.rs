//! A simple gossip primitive for disseminating ring state between the
//! processes of a cluster.
//!
//! # Transport
//!
//! Peers exchange unicast UDP frames. Delivery is *best effort* - a dropped
//! frame is repaired by the periodic anti-entropy sync the layer above this
//! one runs, so no acknowledgement or retransmission machinery exists here.
//!
//! Frames larger than a single unfragmented datagram are handed to the OS
//! anyway and rely on IP fragmentation; prefer payloads well under
//! [`MAX_USER_PAYLOAD_BYTES`] where possible.
//!
//! # Peer discovery
//!
//! Each process generates a random [`Identity`] at startup and announces
//! itself by pinging the configured seed addresses. A PING is answered with a
//! PONG carrying the responder's peer list, and newly learned peers are
//! solicited in turn - so knowledge of the cluster spreads from any single
//! live seed (peer exchange).
//!
//! Peers that stop responding are removed after [`MAX_PING_UNACKED`] without
//! traffic, and every addition or removal bumps a membership epoch that is
//! observable through [`GossipHandle::membership_epoch`].
//!
//! # Security
//!
//! Frames are neither authenticated nor encrypted; this transport expects to
//! run on a network closed to untrusted traffic.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    clippy::todo,
    clippy::dbg_macro
)]

mod builder;
mod dispatcher;
mod frame;
mod handle;
mod peers;
mod reactor;
pub(crate) mod seed;

use std::time::Duration;

pub use builder::*;
pub use dispatcher::*;
pub use handle::*;
pub use peers::{Identity, InvalidIdentity};

/// The maximum duration of time allotted to performing a DNS resolution
/// against a seed/peer address.
pub(crate) const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// The interval between PING frames sent to all configured seed addresses.
///
/// Seeds are pinged continuously (not just at startup) so that a node that
/// lost every live peer rejoins the cluster once a seed comes back.
pub(crate) const SEED_PING_INTERVAL: Duration = Duration::from_secs(15);

/// The interval between health-check PINGs to all known peers.
pub(crate) const PEER_PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long a peer may go without being observed before it is removed from
/// the peer list.
pub(crate) const MAX_PING_UNACKED: Duration = Duration::from_secs(90);

/// The maximum serialised frame size, bounded by the maximum UDP payload
/// over IPv4.
pub(crate) const MAX_FRAME_BYTES: usize = 65_507;

/// The worst-case frame overhead wrapping a user payload (frame header,
/// identity, message framing and length prefixes).
pub(crate) const USER_PAYLOAD_OVERHEAD: usize = 32;

/// The maximum allowed byte size of user payloads.
pub const MAX_USER_PAYLOAD_BYTES: usize = MAX_FRAME_BYTES - USER_PAYLOAD_OVERHEAD;
