use std::any::Any;
use std::fmt::{Debug, Formatter};

use bytes::BytesMut;

/// A [MessageTypeId] identifies a registered application message type on the wire, for
///  deserialization and handler dispatch on the receiving side.
///
/// An id is technically a u64, but it is intended to be used as a sequence of up to eight
///  ASCII characters to give it a human-readable name, both for uniqueness and for debugging
///  at the wire level.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageTypeId(pub u64);

impl MessageTypeId {
    pub const fn new(value: &[u8; 8]) -> MessageTypeId {
        Self(u64::from_be_bytes(*value))
    }
}

impl Debug for MessageTypeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_be_bytes();
        let used = bytes.iter()
            .position(|&b| b == 0)
            .map(|len| &bytes[..len])
            .unwrap_or(&bytes);

        let string_repr = std::str::from_utf8(used).unwrap_or("???");

        write!(f, "0x{:016X}({:?})", self.0, string_repr)
    }
}

/// An application message as it travels through the socket: type-erased, with enough
///  structure for the dispatch tables to route it and for handlers to downcast it back to the
///  concrete registered type.
pub trait Message: Any + Debug + Send + Sync {
    fn message_type(&self) -> MessageTypeId;

    fn as_any(&self) -> &dyn Any;

    fn box_clone(&self) -> Box<dyn Message>;
}

/// The serialization registry. It knows every registered message type, can encode a message to
///  a byte stream and decode one back, and its encoding is self-describing: the type id is
///  part of the encoded form, so [MessageOracle::decode] needs no out-of-band type hint.
///
/// The registry is an external collaborator of the socket: applications bring their own
///  implementation (or a codec-generating facade over one), the socket only routes encoded
///  bytes and decoded values. The `version` parameter is the stream's serialization version,
///  letting a registry evolve its encoding while staying compatible with older peers.
pub trait MessageOracle: Send + Sync + 'static {
    /// Encode `msg` into `buf`. An implementation must either append the complete encoding or
    ///  return an error without any other observable effect - callers recover from a failed
    ///  encode by truncating `buf` back to the pre-call length and retrying later.
    fn encode(&self, version: u8, msg: &dyn Message, buf: &mut BytesMut) -> anyhow::Result<()>;

    /// Decode a single message, consuming exactly its encoded bytes from the front of `buf`.
    fn decode(&self, version: u8, buf: &mut &[u8]) -> anyhow::Result<Box<dyn Message>>;
}
