//! An embedded, gossip-backed implementation of the replicated KV store,
//! usable in place of an external coordinator.
//!
//! Each process holds a full local replica of the store. Updates spread
//! three ways, all funnelling into the same CRDT merge:
//!
//! * **Local CAS.** [`kv::Client::cas`] applies the transform to the local
//!   replica, merges the result back in (turning entries the transform
//!   removed into tombstones), and broadcasts the merge *delta* to all
//!   known peers.
//! * **Delta propagation.** A received payload is merged into the local
//!   replica, and only the delta that actually changed local state is
//!   re-broadcast - an update that changed nothing is dropped, which is
//!   what stops gossip echoing forever.
//! * **Anti-entropy.** Every `pullpush_interval` the full local state is
//!   pushed to one random peer, repairing whatever UDP lost; a membership
//!   change (peer joined or removed) triggers an immediate full-state
//!   broadcast so joiners converge quickly.
//!
//! Values must implement [`kv::Mergeable`]; correctness of the whole scheme
//! rests on that merge being commutative, associative and idempotent.
//!
//! Tombstones are retained for `tombstone_retention` - comfortably longer
//! than a few pull-push rounds - then purged, bounding the state carried
//! for departed members.

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

mod store;
mod wire;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use clock::{SystemProvider, TimeProvider};
use gossip::GossipHandle;
use kv::{CasFn, Client, Codec, Mergeable, PrefixWatchFn, WatchFn};
use observability_deps::tracing::{debug, info, warn};
use prost::Message;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use store::Store;

/// Gossip KV configuration.
#[derive(Debug, Clone)]
pub struct MemberlistConfig {
    /// The `ip:port` the gossip UDP socket binds to.
    pub bind_addr: String,

    /// Seed peer addresses to announce to at startup (and periodically
    /// thereafter).
    pub join: Vec<String>,

    /// The interval between full-state pushes to one random peer.
    pub pullpush_interval: Duration,

    /// How long LEFT tombstones are retained before being purged. Must
    /// comfortably exceed `pullpush_interval` times the expected number of
    /// propagation rounds, or removed members can resurrect.
    pub tombstone_retention: Duration,
}

impl Default for MemberlistConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7946".to_string(),
            join: vec![],
            pullpush_interval: Duration::from_secs(30),
            tombstone_retention: Duration::from_secs(300),
        }
    }
}

/// Errors starting the gossip KV.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The gossip socket could not be bound.
    #[error("failed to bind gossip socket: {0}")]
    Bind(#[from] std::io::Error),
}

/// Capacity of the transport -> worker payload channel.
const PAYLOAD_BUFFER: usize = 1024;

/// A gossip-replicated KV store for values of the codec `C`.
///
/// Implements [`kv::Client`], so ring clients and lifecyclers plug into it
/// exactly as they do an external coordinator. All replication is
/// best-effort and eventually consistent; [`kv::Client::cas`] never loses a
/// race (concurrent updates merge instead of conflicting).
pub struct MemberlistKv<C>
where
    C: Codec,
{
    codec: Arc<C>,
    store: Arc<Store<C::Value>>,
    gossip: Arc<GossipHandle>,
    shutdown: CancellationToken,
}

impl<C> std::fmt::Debug for MemberlistKv<C>
where
    C: Codec,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberlistKv")
            .field("gossip", &self.gossip)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

impl<C> MemberlistKv<C>
where
    C: Codec,
    C::Value: Mergeable,
{
    /// Bind the gossip socket at `config.bind_addr` and start the
    /// replication worker.
    ///
    /// The subsystem stops when the returned handle is dropped.
    pub async fn start(config: MemberlistConfig, codec: C) -> Result<Arc<Self>, Error> {
        let socket = tokio::net::UdpSocket::bind(config.bind_addr.as_str()).await?;
        Self::start_with_socket(config, codec, socket)
    }

    /// As [`MemberlistKv::start`], gossiping over the pre-bound `socket`.
    pub fn start_with_socket(
        config: MemberlistConfig,
        codec: C,
        socket: tokio::net::UdpSocket,
    ) -> Result<Arc<Self>, Error> {
        let bind_addr = socket.local_addr()?;
        let (tx, rx) = mpsc::channel(PAYLOAD_BUFFER);

        let gossip = Arc::new(gossip::Builder::new(config.join.clone(), tx).build(socket));

        info!(
            identity = %gossip.identity(),
            %bind_addr,
            seeds = config.join.len(),
            "gossip kv started"
        );

        let this = Arc::new(Self {
            codec: Arc::new(codec),
            store: Arc::new(Store::default()),
            gossip,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_worker(
            config,
            Arc::clone(&this.codec),
            Arc::clone(&this.store),
            Arc::clone(&this.gossip),
            this.shutdown.clone(),
            rx,
        ));

        Ok(this)
    }

    /// The underlying gossip transport handle: peer list and membership
    /// epoch, used by operators and convergence tests.
    pub fn gossip(&self) -> &GossipHandle {
        &self.gossip
    }

    /// Encode `delta` for `key` and broadcast it to all peers.
    async fn broadcast_delta(&self, key: &str, delta: &C::Value) -> Result<(), kv::Error> {
        let payload = encode_pairs(
            &*self.codec,
            vec![(key.to_string(), delta.clone())],
        )
        .map_err(|source| kv::Error::Encode {
            key: key.to_string(),
            source,
        })?;

        if let Err(e) = self.gossip.broadcast(payload).await {
            // Best effort: anti-entropy repairs anything a lost or
            // oversized broadcast misses.
            warn!(key, error=%e, "failed to broadcast kv delta");
        }
        Ok(())
    }
}

impl<C> Drop for MemberlistKv<C>
where
    C: Codec,
{
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl<C> Client<C::Value> for MemberlistKv<C>
where
    C: Codec,
    C::Value: Mergeable,
{
    async fn get(&self, key: &str) -> Result<Option<C::Value>, kv::Error> {
        Ok(self.store.get(key))
    }

    async fn cas(&self, key: &str, f: CasFn<'_, C::Value>) -> Result<(), kv::Error> {
        // No swap race exists here: concurrent updates merge. One transform
        // invocation commits.
        let current = self.store.get(key);
        let new = match f(current)? {
            (Some(new), _retry) => new,
            (None, _) => return Ok(()),
        };

        if let Some(delta) = self.store.commit_local(key, new) {
            self.broadcast_delta(key, &delta).await?;
        }
        Ok(())
    }

    async fn watch_key(&self, key: &str, shutdown: CancellationToken, cb: WatchFn<'_, C::Value>) {
        let mut rx = self.store.subscribe();

        if let Some(value) = self.store.get(key) {
            if !cb(value) {
                return;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = rx.recv() => {
                    match changed {
                        Ok(changed) if changed == key => {}
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return,
                    }

                    if let Some(value) = self.store.get(key) {
                        if !cb(value) {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        shutdown: CancellationToken,
        cb: PrefixWatchFn<'_, C::Value>,
    ) {
        let mut rx = self.store.subscribe();

        for (key, value) in self
            .store
            .full_state()
            .into_iter()
            .filter(|(k, _)| k.starts_with(prefix))
        {
            if !cb(&key, value) {
                return;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = rx.recv() => {
                    let key = match changed {
                        Ok(key) if key.starts_with(prefix) => key,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    };

                    if let Some(value) = self.store.get(&key) {
                        if !cb(&key, value) {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Where a full-state sync is sent.
enum SyncTarget {
    /// One randomly selected peer (the periodic anti-entropy push).
    Random,
    /// Every known peer (after a membership change).
    All,
}

/// The replication worker: processes inbound payloads, runs the periodic
/// anti-entropy sync and tombstone purge, and reacts to membership changes.
async fn run_worker<C>(
    config: MemberlistConfig,
    codec: Arc<C>,
    store: Arc<Store<C::Value>>,
    gossip: Arc<GossipHandle>,
    shutdown: CancellationToken,
    mut rx: mpsc::Receiver<Bytes>,
) where
    C: Codec,
    C::Value: Mergeable,
{
    let mut sync_interval = tokio::time::interval(config.pullpush_interval);
    sync_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut epoch = gossip.membership_epoch();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            payload = rx.recv() => match payload {
                Some(payload) => handle_incoming(&*codec, &store, &gossip, payload).await,
                None => return,
            },
            _ = sync_interval.tick() => {
                let limit = SystemProvider::new().now() - config.tombstone_retention;
                store.purge_tombstones(limit);
                push_full_state(&*codec, &store, &gossip, SyncTarget::Random).await;
            }
            changed = epoch.changed() => match changed {
                Ok(()) => {
                    debug!("membership changed, pushing full state");
                    push_full_state(&*codec, &store, &gossip, SyncTarget::All).await;
                }
                Err(_) => return,
            }
        }
    }
}

/// Merge one received payload, re-broadcasting only the deltas that changed
/// local state.
async fn handle_incoming<C>(
    codec: &C,
    store: &Store<C::Value>,
    gossip: &GossipHandle,
    payload: Bytes,
) where
    C: Codec,
    C::Value: Mergeable,
{
    let payload = match wire::KvPayload::decode(payload) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error=%e, "malformed kv payload received");
            return;
        }
    };

    let mut changed = Vec::new();
    for pair in payload.pairs {
        if pair.codec != codec.codec_id() {
            warn!(key=%pair.key, codec=%pair.codec, "dropping pair with mismatched codec");
            continue;
        }

        let value = match codec.decode(&pair.payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(key=%pair.key, error=%e, "dropping undecodable pair");
                continue;
            }
        };

        if let Some(delta) = store.merge_remote(&pair.key, value) {
            changed.push((pair.key, delta));
        }
    }

    if changed.is_empty() {
        return;
    }

    match encode_pairs(codec, changed) {
        Ok(payload) => {
            if let Err(e) = gossip.broadcast(payload).await {
                warn!(error=%e, "failed to re-broadcast merged delta");
            }
        }
        Err(e) => warn!(error=%e, "failed to encode merged delta"),
    }
}

/// Push the entire local state to `target`.
async fn push_full_state<C>(
    codec: &C,
    store: &Store<C::Value>,
    gossip: &GossipHandle,
    target: SyncTarget,
) where
    C: Codec,
    C::Value: Mergeable,
{
    let state = store.full_state();
    if state.is_empty() {
        return;
    }

    let payload = match encode_pairs(codec, state) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error=%e, "failed to encode full state");
            return;
        }
    };

    let result = match target {
        SyncTarget::Random => gossip.send_to_random(payload).await,
        SyncTarget::All => gossip.broadcast(payload).await,
    };
    if let Err(e) = result {
        warn!(error=%e, "failed to push full state");
    }
}

/// Encode `pairs` into one gossip payload.
fn encode_pairs<C>(
    codec: &C,
    pairs: Vec<(String, C::Value)>,
) -> Result<Bytes, kv::CodecError>
where
    C: Codec,
{
    let pairs = pairs
        .into_iter()
        .map(|(key, value)| {
            Ok(wire::KvPair {
                key,
                codec: codec.codec_id().to_string(),
                payload: codec.encode(&value)?,
            })
        })
        .collect::<Result<Vec<_>, kv::CodecError>>()?;

    Ok(wire::KvPayload { pairs }.encode_to_vec().into())
}
