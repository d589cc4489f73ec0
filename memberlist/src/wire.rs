//! Wire format of KV payloads carried inside gossip frames.
//!
//! One message shape serves both delta broadcasts and full-state syncs: a
//! set of key/value pairs, each tagged with the id of the codec that
//! produced the value bytes. Receivers merge whatever arrives; CRDT merge
//! semantics make a full state and a delta indistinguishable on the way in.

use bytes::Bytes;

/// A batch of replicated key/value pairs.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct KvPayload {
    #[prost(message, repeated, tag = "1")]
    pub(crate) pairs: Vec<KvPair>,
}

/// One replicated key/value pair.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct KvPair {
    /// The store key.
    #[prost(string, tag = "1")]
    pub(crate) key: String,

    /// Identifies the codec that produced `payload`. Receivers drop pairs
    /// whose codec does not match their own rather than mis-decode them.
    #[prost(string, tag = "2")]
    pub(crate) codec: String,

    /// The encoded value (a full value or a merge delta).
    #[prost(bytes = "bytes", tag = "3")]
    pub(crate) payload: Bytes,
}
