//! Methods of the basic class

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};
use crate::primitives::{ensure, get_short_str, put_short_str, FieldTable};

/// basic.qos
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qos {
    /// Prefetch window in octets; zero means no specific limit
    pub prefetch_size: u32,
    /// Prefetch window in messages; zero means no specific limit
    pub prefetch_count: u16,
    /// Apply to the whole connection rather than this channel
    pub global: bool,
}

impl Qos {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u32(self.prefetch_size);
        dst.put_u16(self.prefetch_count);
        dst.put_u8(self.global as u8);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 7)?;
        Ok(Self {
            prefetch_size: src.get_u32(),
            prefetch_count: src.get_u16(),
            global: src.get_u8() & 1 != 0,
        })
    }
}

/// basic.consume
#[derive(Debug, Clone, PartialEq)]
pub struct Consume {
    /// Queue to consume from
    pub queue: String,
    /// Consumer tag; empty asks the server to generate one
    pub consumer_tag: String,
    /// Do not deliver messages published on this connection
    pub no_local: bool,
    /// The server acknowledges on delivery; the client sends no acks
    pub no_ack: bool,
    /// Request exclusive consumer access
    pub exclusive: bool,
    /// Do not send consume-ok
    pub no_wait: bool,
    /// Extension arguments
    pub arguments: FieldTable,
}

impl Consume {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u16(0); // reserved
        put_short_str(dst, &self.queue)?;
        put_short_str(dst, &self.consumer_tag)?;
        let bits = self.no_local as u8
            | (self.no_ack as u8) << 1
            | (self.exclusive as u8) << 2
            | (self.no_wait as u8) << 3;
        dst.put_u8(bits);
        self.arguments.encode(dst)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        src.get_u16();
        let queue = get_short_str(src)?;
        let consumer_tag = get_short_str(src)?;
        ensure(src, 1)?;
        let bits = src.get_u8();
        Ok(Self {
            queue,
            consumer_tag,
            no_local: bits & 1 != 0,
            no_ack: bits & 2 != 0,
            exclusive: bits & 4 != 0,
            no_wait: bits & 8 != 0,
            arguments: FieldTable::decode(src)?,
        })
    }
}

/// basic.consume-ok
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOk {
    /// The consumer tag, server-generated when the consume sent an empty tag
    pub consumer_tag: String,
}

impl ConsumeOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        put_short_str(dst, &self.consumer_tag)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            consumer_tag: get_short_str(src)?,
        })
    }
}

/// basic.cancel
///
/// Also sent by RabbitMQ to the client when a consumer is cancelled
/// server-side, e.g. because its queue was deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct Cancel {
    /// Consumer tag to cancel
    pub consumer_tag: String,
    /// Do not send cancel-ok
    pub no_wait: bool,
}

impl Cancel {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        put_short_str(dst, &self.consumer_tag)?;
        dst.put_u8(self.no_wait as u8);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let consumer_tag = get_short_str(src)?;
        ensure(src, 1)?;
        Ok(Self {
            consumer_tag,
            no_wait: src.get_u8() & 1 != 0,
        })
    }
}

/// basic.cancel-ok
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOk {
    /// The cancelled consumer tag
    pub consumer_tag: String,
}

impl CancelOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        put_short_str(dst, &self.consumer_tag)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            consumer_tag: get_short_str(src)?,
        })
    }
}

/// basic.publish
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    /// Exchange to publish to; empty is the default exchange
    pub exchange: String,
    /// Routing key for the message
    pub routing_key: String,
    /// Return the message if it cannot be routed
    pub mandatory: bool,
    /// Return the message if it cannot be delivered immediately
    pub immediate: bool,
}

impl Publish {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u16(0); // reserved
        put_short_str(dst, &self.exchange)?;
        put_short_str(dst, &self.routing_key)?;
        dst.put_u8(self.mandatory as u8 | (self.immediate as u8) << 1);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        src.get_u16();
        let exchange = get_short_str(src)?;
        let routing_key = get_short_str(src)?;
        ensure(src, 1)?;
        let bits = src.get_u8();
        Ok(Self {
            exchange,
            routing_key,
            mandatory: bits & 1 != 0,
            immediate: bits & 2 != 0,
        })
    }
}

/// basic.return
#[derive(Debug, Clone, PartialEq)]
pub struct Return {
    /// Reply code explaining why the message came back
    pub reply_code: u16,
    /// Human-readable reply text
    pub reply_text: String,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
}

impl Return {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u16(self.reply_code);
        put_short_str(dst, &self.reply_text)?;
        put_short_str(dst, &self.exchange)?;
        put_short_str(dst, &self.routing_key)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        Ok(Self {
            reply_code: src.get_u16(),
            reply_text: get_short_str(src)?,
            exchange: get_short_str(src)?,
            routing_key: get_short_str(src)?,
        })
    }
}

/// basic.deliver
#[derive(Debug, Clone, PartialEq)]
pub struct Deliver {
    /// Tag of the consumer the message is for
    pub consumer_tag: String,
    /// Channel-scoped delivery tag for acknowledgement
    pub delivery_tag: u64,
    /// The message has been delivered before
    pub redelivered: bool,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
}

impl Deliver {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        put_short_str(dst, &self.consumer_tag)?;
        dst.put_u64(self.delivery_tag);
        dst.put_u8(self.redelivered as u8);
        put_short_str(dst, &self.exchange)?;
        put_short_str(dst, &self.routing_key)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let consumer_tag = get_short_str(src)?;
        ensure(src, 9)?;
        let delivery_tag = src.get_u64();
        let redelivered = src.get_u8() & 1 != 0;
        Ok(Self {
            consumer_tag,
            delivery_tag,
            redelivered,
            exchange: get_short_str(src)?,
            routing_key: get_short_str(src)?,
        })
    }
}

/// basic.ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Delivery tag being acknowledged
    pub delivery_tag: u64,
    /// Acknowledge all outstanding tags up to and including this one
    pub multiple: bool,
}

impl Ack {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u64(self.delivery_tag);
        dst.put_u8(self.multiple as u8);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 9)?;
        Ok(Self {
            delivery_tag: src.get_u64(),
            multiple: src.get_u8() & 1 != 0,
        })
    }
}

/// basic.reject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reject {
    /// Delivery tag being rejected
    pub delivery_tag: u64,
    /// Requeue rather than discard
    pub requeue: bool,
}

impl Reject {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u64(self.delivery_tag);
        dst.put_u8(self.requeue as u8);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 9)?;
        Ok(Self {
            delivery_tag: src.get_u64(),
            requeue: src.get_u8() & 1 != 0,
        })
    }
}

/// basic.nack (RabbitMQ extension)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nack {
    /// Delivery tag being negatively acknowledged
    pub delivery_tag: u64,
    /// Apply to all outstanding tags up to and including this one
    pub multiple: bool,
    /// Requeue rather than discard
    pub requeue: bool,
}

impl Nack {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u64(self.delivery_tag);
        dst.put_u8(self.multiple as u8 | (self.requeue as u8) << 1);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 9)?;
        let delivery_tag = src.get_u64();
        let bits = src.get_u8();
        Ok(Self {
            delivery_tag,
            multiple: bits & 1 != 0,
            requeue: bits & 2 != 0,
        })
    }
}
