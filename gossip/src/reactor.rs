//! The gossip actor: a single task owning the socket and peer list.

use std::{net::SocketAddr, sync::Arc};

use bytes::BytesMut;
use observability_deps::tracing::{debug, error, info, warn};
use prost::Message;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch},
    time,
};

use crate::{
    frame::{self, Frame, FrameMessage, Payload},
    handle::Request,
    peers::{Identity, PeerList},
    seed::{seed_ping_task, Seed},
    Dispatcher, MAX_FRAME_BYTES, PEER_PING_INTERVAL,
};

#[derive(Debug)]
enum Error {
    NoPayload {
        peer: Identity,
        addr: SocketAddr,
    },

    Deserialise {
        addr: SocketAddr,
        source: prost::DecodeError,
    },

    Identity {
        addr: SocketAddr,
    },

    Io(std::io::Error),

    MaxSize(usize),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Aborts the contained task when dropped.
#[derive(Debug)]
pub(crate) struct AbortOnDrop(pub(crate) tokio::task::JoinHandle<()>);
impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort()
    }
}

/// An event loop actor for gossip frame processing.
///
/// This task drives peer discovery, maintains the set of known peers and
/// exchanges gossip frames with them. Users interact with it through a
/// [`GossipHandle`].
///
/// [`GossipHandle`]: crate::GossipHandle
#[derive(Debug)]
pub(crate) struct Reactor<T> {
    dispatch: T,

    /// The random identity of this gossip instance.
    identity: Identity,

    /// A cached wire frame, cleared and refilled to serialise each outgoing
    /// message, and a cached pre-serialised PING frame (PINGs never change).
    cached_frame: Frame,
    cached_ping_frame: Arc<[u8]>,

    /// A re-used buffer for serialising outgoing messages into.
    serialisation_buf: Vec<u8>,

    /// The immutable list of seed addresses provided by the user,
    /// periodically pinged by a dedicated task (so DNS resolution never
    /// blocks this loop).
    seed_list: Arc<[Seed]>,
    _seed_ping_task: AbortOnDrop,

    /// The set of active peers this node has communicated with and believes
    /// to be recently healthy.
    peer_list: PeerList,

    /// The UDP socket used for communication with peers.
    socket: Arc<UdpSocket>,
}

impl<T> Reactor<T>
where
    T: Dispatcher,
{
    pub(crate) fn new(
        seed_addrs: Vec<String>,
        socket: UdpSocket,
        dispatch: T,
        epoch: watch::Sender<u64>,
    ) -> Self {
        let identity = Identity::new();

        let seed_list: Arc<[Seed]> = seed_addrs.into_iter().map(Seed::new).collect();
        let socket = Arc::new(socket);
        let mut serialisation_buf = Vec::with_capacity(1024);

        // Pre-populate the frame header with this node's identity.
        let mut cached_frame = Frame {
            identity: identity.as_bytes().clone(),
            messages: Vec::with_capacity(1),
        };

        // A PING frame is static over the lifetime of a reactor, so it can
        // be serialised once and reused.
        let cached_ping_frame: Arc<[u8]> = {
            populate_frame(
                &mut cached_frame,
                vec![new_payload(Payload::Ping(frame::Ping {}))],
                &mut serialisation_buf,
            )
            .expect("ping frame is tiny");
            Arc::from(serialisation_buf.clone())
        };

        // Announce this node to all seeds, and keep announcing so the
        // cluster re-forms after a partition or seed restart.
        let seed_task = AbortOnDrop(tokio::spawn(seed_ping_task(
            Arc::clone(&seed_list),
            Arc::clone(&socket),
            Arc::clone(&cached_ping_frame),
        )));

        Self {
            dispatch,
            identity,
            cached_frame,
            cached_ping_frame,
            serialisation_buf,
            peer_list: PeerList::with_capacity(seed_list.len(), epoch),
            seed_list,
            _seed_ping_task: seed_task,
            socket,
        }
    }

    /// Execute the reactor event loop, handling requests from the
    /// [`GossipHandle`] over `rx`.
    ///
    /// [`GossipHandle`]: crate::GossipHandle
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        info!(
            identity = %self.identity,
            seed_list = ?self.seed_list,
            "gossip reactor started",
        );

        let mut gc_interval = time::interval(PEER_PING_INTERVAL);
        gc_interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.read() => {
                    match msg {
                        Ok(()) => {},
                        Err(Error::NoPayload { peer, addr }) => {
                            warn!(%peer, %addr, "message contains no payload");
                        }
                        Err(Error::Deserialise { addr, source }) => {
                            warn!(error=%source, %addr, "error deserialising frame");
                        }
                        Err(Error::Identity { addr }) => {
                            warn!(%addr, "invalid identity value in frame");
                        }
                        Err(Error::Io(error)) => {
                            error!(%error, "i/o error");
                        }
                        Err(Error::MaxSize(_)) => {
                            // Logged at source.
                        }
                    }
                }
                op = rx.recv() => {
                    match op {
                        None => {
                            info!("stopping gossip reactor");
                            return;
                        }
                        Some(Request::Broadcast(payload)) => {
                            if populate_frame(
                                &mut self.cached_frame,
                                vec![new_payload(Payload::UserData(payload))],
                                &mut self.serialisation_buf
                            ).is_err() {
                                continue;
                            }

                            self.peer_list
                                .broadcast(&self.serialisation_buf, &self.socket)
                                .await;
                        }
                        Some(Request::SendToRandom(payload)) => {
                            if populate_frame(
                                &mut self.cached_frame,
                                vec![new_payload(Payload::UserData(payload))],
                                &mut self.serialisation_buf
                            ).is_err() {
                                continue;
                            }

                            self.peer_list
                                .send_to_random(&self.serialisation_buf, &self.socket)
                                .await;
                        }
                        Some(Request::GetPeers(tx)) => {
                            let _ = tx.send(self.peer_list.peer_identities());
                        },
                    }
                }
                _ = gc_interval.tick() => {
                    debug!("peer ping & gc sweep");
                    self.peer_list
                        .ping_gc(&self.cached_ping_frame, &self.socket)
                        .await;
                }
            };
        }
    }

    /// Read a single gossip frame from the socket, process its messages, and
    /// send any responses due.
    async fn read(&mut self) -> Result<(), Error> {
        let (frame, peer_addr) = read_frame(&self.socket).await?;

        let identity =
            Identity::try_from(frame.identity).map_err(|_| Error::Identity { addr: peer_addr })?;

        // Don't process messages from this node.
        //
        // It's expected that all N servers of a cluster share one seed list
        // including themselves; by dropping self-addressed frames, this
        // node's own pings go unanswered and it never appears in its own
        // peer list.
        if identity == self.identity {
            debug!(%identity, %peer_addr, "dropping frame from self");
            return Ok(());
        }

        let mut out_messages = Vec::new();
        for msg in frame.messages {
            let payload = msg.payload.ok_or_else(|| Error::NoPayload {
                peer: identity.clone(),
                addr: peer_addr,
            })?;

            let response = match payload {
                Payload::Ping(_) => Some(Payload::Pong(frame::Pong {
                    peers: self.peer_list.peers().map(frame::Peer::from).collect(),
                })),
                Payload::Pong(pex) => {
                    debug!(%identity, %peer_addr, pex_nodes=pex.peers.len(), "pong");
                    self.handle_pex(pex).await;
                    None
                }
                Payload::UserData(data) => {
                    debug!(%identity, %peer_addr, n_bytes=data.len(), "dispatch payload");
                    self.dispatch.dispatch(data, identity.clone()).await;
                    None
                }
            };

            if let Some(payload) = response {
                out_messages.push(new_payload(payload));
            }
        }

        // Find or create the peer, and track it as observed-healthy.
        let peer = self.peer_list.upsert(&identity, peer_addr);
        peer.mark_observed();

        if out_messages.is_empty() {
            return Ok(());
        }

        populate_frame(
            &mut self.cached_frame,
            out_messages,
            &mut self.serialisation_buf,
        )?;

        peer.send(&self.serialisation_buf, &self.socket).await?;

        Ok(())
    }

    /// The PONG response to a PING carries the set of peers known to the
    /// sender - this is the peer-exchange mechanism.
    ///
    /// Each previously unknown peer is sent a PING without being added to
    /// the local peer list; only peers that answer (proving liveness and
    /// reachability) are admitted, via the normal [`Reactor::read`] path.
    async fn handle_pex(&mut self, pex: frame::Pong) {
        for p in pex.peers {
            let pex_identity = match Identity::try_from(p.identity) {
                Ok(v) if v == self.identity => continue,
                Ok(v) if self.peer_list.contains(&v) => continue,
                Ok(v) => v,
                Err(e) => {
                    warn!(error=%e, "received invalid identity via peer exchange");
                    continue;
                }
            };

            let pex_addr: SocketAddr = match p.address.parse() {
                Ok(v) => v,
                Err(e) => {
                    warn!(%pex_identity, error=%e, "received invalid peer address via peer exchange");
                    continue;
                }
            };

            match self.socket.send_to(&self.cached_ping_frame, pex_addr).await {
                Ok(_) => debug!(%pex_identity, %pex_addr, "pinging peer learned via exchange"),
                Err(e) => warn!(error=%e, %pex_addr, "ping failed"),
            }
        }
    }

    /// Return the randomised identity assigned to this instance.
    pub(crate) fn identity(&self) -> &Identity {
        &self.identity
    }
}

/// Wait for a UDP datagram to arrive, and decode it into a gossip [`Frame`].
async fn read_frame(socket: &UdpSocket) -> Result<(Frame, SocketAddr), Error> {
    // Pre-allocate a buffer large enough to hold the maximum frame size.
    //
    // Reading from a UDP socket silently truncates if the buffer cannot hold
    // the full packet payload.
    let mut buf = BytesMut::with_capacity(MAX_FRAME_BYTES);

    let (n_bytes, addr) = socket
        .recv_buf_from(&mut buf)
        .await
        // recvfrom() errors, or failure converting the kernel-provided
        // address - neither should ever happen.
        .expect("invalid recvfrom");

    match Frame::decode(buf.freeze()) {
        Ok(frame) => {
            debug!(%addr, n_bytes, "read frame");
            Ok((frame, addr))
        }
        Err(e) => Err(Error::Deserialise { addr, source: e }),
    }
}

/// Given a pre-allocated `frame`, clear and populate it with the provided
/// set of messages, serialising it to `buf`.
fn populate_frame(
    frame: &mut Frame,
    messages: Vec<FrameMessage>,
    buf: &mut Vec<u8>,
) -> Result<(), Error> {
    frame.messages = messages;

    // All messages must fit the receiver's read buffer to be decodable.
    if frame.encoded_len() > MAX_FRAME_BYTES {
        error!(
            n_bytes = frame.encoded_len(),
            n_max = MAX_FRAME_BYTES,
            "attempted to send frame larger than maximum"
        );
        return Err(Error::MaxSize(frame.encoded_len()));
    }

    buf.clear();
    frame.encode(buf).expect("buffer should grow");

    Ok(())
}

/// Instantiate a new [`FrameMessage`] from the given [`Payload`].
fn new_payload(p: Payload) -> FrameMessage {
    FrameMessage { payload: Some(p) }
}
