//! The replicated key-value abstraction backing ring membership.
//!
//! Every process participating in a ring shares one logical KV store holding
//! the serialised ring descriptor. This crate defines the small capability
//! set all backends provide ([`Client`]), the value (de)serialisation seam
//! ([`Codec`]), and the CRDT merge contract gossip-replicated values must
//! implement ([`Mergeable`]).
//!
//! Two backends live here:
//!
//! * [`mem::MemClient`] - a process-local store used by tests and
//!   single-node deployments.
//! * [`consul::ConsulClient`] - an external coordinator reached over HTTP,
//!   using Consul's check-and-set index for atomic swaps and blocking
//!   queries for watches.
//!
//! The third backend, an embedded gossip implementation, lives in the
//! `memberlist` crate and plugs into the same [`Client`] trait.

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

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub mod codec;
pub mod consul;
pub mod mem;

pub use codec::{Codec, CodecError, Mergeable, Proto};

/// The maximum number of compare-and-swap attempts before a [`Client::cas`]
/// call gives up and reports [`Error::CasExhausted`].
pub const MAX_CAS_RETRIES: usize = 10;

/// Errors returned by [`Client`] operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The swap lost the optimistic-concurrency race more than
    /// [`MAX_CAS_RETRIES`] times.
    #[error("failed to CAS key {key} within {attempts} attempts")]
    CasExhausted {
        /// Key being swapped.
        key: String,
        /// Number of attempts made.
        attempts: usize,
    },

    /// The CAS transform refused to produce a new value.
    #[error("CAS transform aborted: {source}")]
    Aborted {
        /// The transform's error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A stored value could not be decoded. This is fatal: it means the
    /// store holds bytes written by an incompatible codec.
    #[error("error decoding value for key {key}: {source}")]
    Decode {
        /// Key holding the malformed value.
        key: String,
        /// Decode failure.
        source: CodecError,
    },

    /// A value could not be encoded for storage.
    #[error("error encoding value for key {key}: {source}")]
    Encode {
        /// Key being written.
        key: String,
        /// Encode failure.
        source: CodecError,
    },

    /// The backend could not be reached. Retryable.
    #[error("KV transport error: {source}")]
    Transport {
        /// Underlying transport failure.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    /// Returns true if the operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::CasExhausted { .. })
    }
}

/// The transform applied by [`Client::cas`].
///
/// Invoked with the current value of the key (`None` when unset) and returns
/// the replacement value together with a retry flag:
///
/// * `Ok((Some(new), retry))` - attempt to commit `new`. If the commit loses
///   the optimistic-concurrency race the transform is re-invoked with the
///   fresh value when `retry` is true, otherwise the call fails.
/// * `Ok((None, _))` - no change required; the call succeeds immediately.
/// * `Err(e)` - abort the call with `e`.
///
/// The transform MUST be free of external side effects: it may be invoked
/// any number of times before one of its results commits.
pub type CasFn<'a, V> = &'a mut (dyn FnMut(Option<V>) -> Result<(Option<V>, bool), Error> + Send);

/// Callback invoked by [`Client::watch_key`] with each observed value.
/// Returning false stops the watch.
pub type WatchFn<'a, V> = &'a mut (dyn FnMut(V) -> bool + Send);

/// Callback invoked by [`Client::watch_prefix`] with each observed
/// key/value. Returning false stops the watch.
pub type PrefixWatchFn<'a, V> = &'a mut (dyn FnMut(&str, V) -> bool + Send);

/// The capability set shared by every KV backend.
///
/// `V` is the decoded value type; implementations pair the transport with a
/// [`Codec`] where a wire format is involved.
#[async_trait]
pub trait Client<V>: std::fmt::Debug + Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Fetch the latest committed value for `key`, or `None` if the key has
    /// never been written.
    async fn get(&self, key: &str) -> Result<Option<V>, Error>;

    /// Atomically update `key` by applying the pure transform `f` to the
    /// current value, retrying with backoff on swap races. See [`CasFn`] for
    /// the transform contract.
    async fn cas(&self, key: &str, f: CasFn<'_, V>) -> Result<(), Error>;

    /// Invoke `cb` with the current value of `key` (if any) and then with
    /// every subsequent committed update, until `cb` returns false or
    /// `shutdown` is cancelled.
    ///
    /// Watches are level- rather than edge-triggered: a slow callback may
    /// observe only the latest of several intervening updates.
    async fn watch_key(&self, key: &str, shutdown: CancellationToken, cb: WatchFn<'_, V>);

    /// As [`Client::watch_key`], for every key under `prefix`.
    async fn watch_prefix(
        &self,
        prefix: &str,
        shutdown: CancellationToken,
        cb: PrefixWatchFn<'_, V>,
    );
}
