//! Periodic announcement PINGs to the configured seed addresses.

use std::{net::SocketAddr, sync::Arc};

use observability_deps::tracing::{debug, warn};
use tokio::{
    net::{self, UdpSocket},
    time::{timeout, MissedTickBehavior},
};

use crate::{RESOLVE_TIMEOUT, SEED_PING_INTERVAL};

/// A user-provided seed peer address.
///
/// The raw (usually DNS) address is retained rather than the resolved
/// [`SocketAddr`] so an unreachable seed is re-resolved on every attempt and
/// follows any IP change.
#[derive(Debug)]
pub(crate) struct Seed(String);

impl Seed {
    pub(crate) fn new(addr: String) -> Self {
        Self(addr)
    }

    /// Resolve this seed address, returning `None` if resolution does not
    /// produce an address within [`RESOLVE_TIMEOUT`].
    pub(crate) async fn resolve(&self) -> Option<SocketAddr> {
        match timeout(RESOLVE_TIMEOUT, resolve(&self.0)).await {
            Ok(v) => v,
            Err(_) => {
                warn!(addr = %self.0, "timeout resolving seed address");
                None
            }
        }
    }
}

/// Resolve `addr`, returning the first IP address, if any.
async fn resolve(addr: &str) -> Option<SocketAddr> {
    match net::lookup_host(addr).await.map(|mut v| v.next()) {
        Ok(Some(v)) => {
            debug!(%addr, peer=%v, "resolved seed address");
            Some(v)
        }
        Ok(None) => {
            warn!(%addr, "seed address resolved to no IPs");
            None
        }
        Err(e) => {
            warn!(%addr, error=%e, "failed to resolve seed address");
            None
        }
    }
}

/// Send `ping_frame` to every seed, forever, at [`SEED_PING_INTERVAL`].
///
/// Runs as its own task so that slow DNS resolution never blocks the reactor
/// loop.
pub(super) async fn seed_ping_task(
    seeds: Arc<[Seed]>,
    socket: Arc<UdpSocket>,
    ping_frame: Arc<[u8]>,
) {
    let mut interval = tokio::time::interval(SEED_PING_INTERVAL);

    // Do not burst PING frames to catch up a stalled timer.
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        for seed in seeds.iter() {
            if let Some(addr) = seed.resolve().await {
                match socket.send_to(&ping_frame, addr).await {
                    Ok(n_bytes) => debug!(n_bytes, %addr, "seed ping"),
                    Err(e) => warn!(error=%e, %addr, "seed ping failed"),
                }
            }
        }

        debug!("seed ping sweep complete");
    }
}
