//! Consistent-hash ring membership and placement.
//!
//! This crate is the shared core of every service in the cluster: a ring of
//! instances, each owning a set of random 32-bit tokens, replicated through
//! a key-value store and queried on the hot path of every read and write.
//!
//! The pieces, leaves first:
//!
//! * [`Desc`] / [`InstanceDesc`] - the replicated descriptor: who is in the
//!   ring, their tokens, state and last heartbeat. CRDT-mergeable for the
//!   gossip-backed KV.
//! * [`generate_tokens`] - random token generation, disjoint from the
//!   tokens already placed.
//! * [`ReplicationStrategy`] - pure policy turning a candidate replica list
//!   into a quorum set.
//! * [`Lifecycler`] - the per-process state machine owning this instance's
//!   ring entry: registration, heartbeats, observe-period token conflict
//!   resolution, auto-forget of dead peers, graceful handoff and removal.
//! * [`Ring`] - the read side: watches the KV, maintains an immutable
//!   in-memory view and answers placement queries.
//! * [`do_batch`] - the quorum executor fanning a batch of keys out to
//!   their replicas and accounting per-key success/failure.

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

mod batch;
mod client;
mod desc;
mod lifecycler;
mod replication;
mod tokens;

pub use batch::{do_batch, BatchError};
pub use client::{ReplicaSet, Ring, RingConfig};
pub use desc::{Desc, InstanceDesc, InstanceState};
pub use lifecycler::{
    FlushTransferer, Lifecycler, LifecyclerConfig, NoopFlushTransferer, ReadyError, TransferError,
};
pub use replication::{
    DefaultReplicationStrategy, IgnoreUnhealthyInstancesReplicationStrategy, ReplicationError,
    ReplicationStrategy,
};
pub use tokens::{generate_tokens, load_tokens_file, save_tokens_file, TokensFileError};

/// The operation a ring lookup serves, determining which instance states are
/// eligible to be selected.
///
/// Writes go only to `ACTIVE` instances; reads additionally accept `LEAVING`
/// instances because they still hold data until their removal completes;
/// reporting-style lookups accept everything that is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// A data read.
    Read,
    /// A data write.
    Write,
    /// A metadata / introspection query.
    Reporting,
}

/// Errors returned by ring lookups and helpers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The ring holds no tokens (no instance ever registered, or the KV is
    /// not yet synced).
    #[error("empty ring")]
    EmptyRing,

    /// The replication strategy could not assemble a quorum.
    #[error(transparent)]
    Replication(#[from] ReplicationError),

    /// Too many instances failed their health check for a full-ring query.
    #[error("too many unhealthy instances in the ring")]
    TooManyUnhealthy,

    /// [`Ring::wait_instance_state`] timed out.
    #[error("timed out waiting for instance {id} to reach state {state:?}")]
    WaitTimeout {
        /// The instance waited for.
        id: String,
        /// The state waited for.
        state: InstanceState,
    },

    /// An underlying KV operation failed.
    #[error(transparent)]
    Kv(#[from] kv::Error),
}
