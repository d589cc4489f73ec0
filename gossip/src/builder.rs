//! Configuration and startup of a gossip instance.

use tokio::{
    net::{ToSocketAddrs, UdpSocket},
    sync::{mpsc, watch},
};

use crate::{handle::GossipHandle, reactor::Reactor, Dispatcher};

/// Capacity of the handle -> reactor request channel.
const REQUEST_BUFFER: usize = 1000;

/// Assembles a gossip instance: the seed addresses it announces itself to,
/// and the [`Dispatcher`] that receives application payloads from peers.
///
/// Seed addresses may be DNS names; each one is re-resolved on every
/// announcement round, so a seed that moves or comes up late is still
/// found.
#[derive(Debug)]
pub struct Builder<T> {
    seeds: Vec<String>,
    dispatcher: T,
}

impl<T> Builder<T>
where
    T: Dispatcher + 'static,
{
    /// Describe a gossip instance announcing itself to `seeds` and handing
    /// received payloads to `dispatcher`.
    pub fn new(seeds: Vec<String>, dispatcher: T) -> Self {
        Self { seeds, dispatcher }
    }

    /// Launch the instance, gossiping over `socket`.
    ///
    /// All communication between the returned [`GossipHandle`] and the
    /// reactor task goes over an internal request channel; the membership
    /// epoch travels back out through a watch channel fed by the reactor's
    /// peer list. Dropping the handle stops the reactor.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime - the reactor and the
    /// seed announcement loop are spawned onto it.
    #[must_use = "gossip reactor stops when handle drops"]
    pub fn build(self, socket: UdpSocket) -> GossipHandle {
        let (epoch_tx, epoch_rx) = watch::channel(0);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER);

        let reactor = Reactor::new(self.seeds, socket, self.dispatcher, epoch_tx);
        let handle = GossipHandle::new(request_tx, reactor.identity().clone(), epoch_rx);

        tokio::spawn(reactor.run(request_rx));

        handle
    }

    /// As [`Builder::build`], binding a fresh socket on `bind_addr` first.
    pub async fn bind<A>(self, bind_addr: A) -> Result<GossipHandle, std::io::Error>
    where
        A: ToSocketAddrs + Send,
    {
        Ok(self.build(UdpSocket::bind(bind_addr).await?))
    }
}
