use std::any::Any;

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::oracle::{Message, MessageOracle, MessageTypeId};

pub const TEXT_MESSAGE_TYPE: MessageTypeId = MessageTypeId::new(b"TxtMsg\0\0");

/// A registered test message with a variable-length payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub text: String,
}

impl TextMessage {
    pub fn boxed(text: &str) -> Box<dyn Message> {
        Box::new(TextMessage { text: text.to_string() })
    }
}

impl Message for TextMessage {
    fn message_type(&self) -> MessageTypeId {
        TEXT_MESSAGE_TYPE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn box_clone(&self) -> Box<dyn Message> {
        Box::new(self.clone())
    }
}

pub const PING_MESSAGE_TYPE: MessageTypeId = MessageTypeId::new(b"Ping\0\0\0\0");

/// A registered test message with a fixed-length payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingMessage {
    pub counter: u32,
}

impl PingMessage {
    pub fn boxed(counter: u32) -> Box<dyn Message> {
        Box::new(PingMessage { counter })
    }
}

impl Message for PingMessage {
    fn message_type(&self) -> MessageTypeId {
        PING_MESSAGE_TYPE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn box_clone(&self) -> Box<dyn Message> {
        Box::new(*self)
    }
}

pub const BROKEN_MESSAGE_TYPE: MessageTypeId = MessageTypeId::new(b"Broken\0\0");

/// A message the [TestOracle] refuses to encode, for exercising mid-frame serialization
///  failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokenMessage;

impl Message for BrokenMessage {
    fn message_type(&self) -> MessageTypeId {
        BROKEN_MESSAGE_TYPE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn box_clone(&self) -> Box<dyn Message> {
        Box::new(*self)
    }
}

/// A fixed registry over the test message types: the type id as u64 BE, followed by the
///  type-specific payload.
pub struct TestOracle;

impl MessageOracle for TestOracle {
    fn encode(&self, _version: u8, msg: &dyn Message, buf: &mut BytesMut) -> anyhow::Result<()> {
        if msg.message_type() == BROKEN_MESSAGE_TYPE {
            return Err(anyhow!("refusing to encode {:?}", msg.message_type()));
        }

        buf.put_u64(msg.message_type().0);
        if let Some(text) = msg.as_any().downcast_ref::<TextMessage>() {
            put_string(buf, &text.text);
            Ok(())
        }
        else if let Some(ping) = msg.as_any().downcast_ref::<PingMessage>() {
            buf.put_u32(ping.counter);
            Ok(())
        }
        else {
            Err(anyhow!("message type {:?} is not registered", msg.message_type()))
        }
    }

    fn decode(&self, _version: u8, buf: &mut &[u8]) -> anyhow::Result<Box<dyn Message>> {
        let id = MessageTypeId(buf.try_get_u64()?);
        match id {
            TEXT_MESSAGE_TYPE => Ok(Box::new(TextMessage { text: try_get_string(buf)? })),
            PING_MESSAGE_TYPE => Ok(Box::new(PingMessage { counter: buf.try_get_u32()? })),
            _ => Err(anyhow!("unknown message type {:?}", id)),
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    let mut result = Vec::with_capacity(len);
    for _ in 0..len {
        result.push(buf.try_get_u8()?);
    }

    Ok(String::from_utf8(result)?)
}
