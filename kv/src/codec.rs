//! Value (de)serialisation and the gossip merge contract.

use std::marker::PhantomData;

use bytes::Bytes;
use clock::Time;

/// Errors produced when translating values to/from their wire form.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The buffer does not contain a valid encoding of the value type.
    #[error("decode: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The value could not be encoded.
    #[error("encode: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Translates values of one concrete type to and from bytes.
///
/// The `codec_id` travels with gossiped payloads so a receiver can reject
/// bytes produced by an incompatible codec instead of mis-decoding them.
pub trait Codec: std::fmt::Debug + Send + Sync + 'static {
    /// The decoded value type.
    type Value: Clone + Send + Sync + 'static;

    /// A short stable identifier for this codec.
    fn codec_id(&self) -> &'static str;

    /// Encode `value` to bytes.
    fn encode(&self, value: &Self::Value) -> Result<Bytes, CodecError>;

    /// Decode a value from `buf`.
    fn decode(&self, buf: &[u8]) -> Result<Self::Value, CodecError>;
}

/// A [`Codec`] for any protobuf message type.
pub struct Proto<T> {
    id: &'static str,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for Proto<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proto").field("id", &self.id).finish()
    }
}

impl<T> Proto<T> {
    /// Construct a protobuf codec identified by `id`.
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            _phantom: PhantomData,
        }
    }
}

impl<T> Codec for Proto<T>
where
    T: prost::Message + Default + Clone + 'static,
{
    type Value = T;

    fn codec_id(&self) -> &'static str {
        self.id
    }

    fn encode(&self, value: &Self::Value) -> Result<Bytes, CodecError> {
        let mut buf = Vec::with_capacity(value.encoded_len());
        value.encode(&mut buf)?;
        Ok(buf.into())
    }

    fn decode(&self, buf: &[u8]) -> Result<Self::Value, CodecError> {
        Ok(T::decode(buf)?)
    }
}

/// The merge contract gossip-replicated values must satisfy.
///
/// `merge` MUST be commutative, associative and idempotent: any set of peers
/// applying any interleaving of the same updates converges on the same
/// value.
pub trait Mergeable: Clone + Send + Sync + 'static {
    /// Merge `incoming` into `self`, returning the sub-value that produced
    /// an observable change, or `None` if `incoming` carried nothing new.
    ///
    /// The returned delta is what gets re-broadcast: returning only the
    /// changed portion suppresses gossip echo of already-known state.
    ///
    /// When `local_cas` is true the merge commits a locally produced update:
    /// content present in `self` but absent from `incoming` was *removed* by
    /// the update and must be recorded as a tombstone (rather than treated
    /// as not-yet-known), so the removal propagates instead of being
    /// resurrected by the next merge.
    fn merge(&mut self, incoming: Self, local_cas: bool) -> Option<Self>;

    /// The content keys present in this value (for a ring descriptor, the
    /// instance ids).
    fn merge_content(&self) -> Vec<String>;

    /// Drop tombstones written before `limit`.
    fn remove_tombstones(&mut self, limit: Time);
}
