use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Sequence value terminating the item list of a stream frame.
pub const SEQ_END_OF_ITEMS: u16 = 0;

/// Sequence value terminating the item list *and* announcing that the sender is closing. It is
///  only ever written when the sender's complete pending queue fitted into the same frame, so
///  a receiver can treat it as a definitive end-of-stream marker.
pub const SEQ_CLOSE: u16 = 0xFFFF;

/// Ack value announcing that the sender has torn down its side of the stream. A receiver must
///  end its own side immediately when it sees this.
pub const ACK_STREAM_ENDED: u16 = 0xFFFF;

/// First byte of every datagram, deciding between connectionless dispatch and the reliable
///  stream machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameTag {
    General = 0,
    Stream = 1,
}

impl FrameTag {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8((*self).into());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameTag> {
        let raw = buf.try_get_u8()?;
        Ok(FrameTag::try_from(raw)?)
    }
}
