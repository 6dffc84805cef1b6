//! Methods of the queue class

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};
use crate::primitives::{ensure, get_short_str, put_short_str, FieldTable};

/// queue.declare
#[derive(Debug, Clone, PartialEq)]
pub struct Declare {
    /// Queue name; empty asks the server to generate one
    pub queue: String,
    /// Check for existence without creating
    pub passive: bool,
    /// Survive broker restarts
    pub durable: bool,
    /// Only accessible to this connection, deleted with it
    pub exclusive: bool,
    /// Delete when the last consumer cancels
    pub auto_delete: bool,
    /// Do not send declare-ok
    pub no_wait: bool,
    /// Extension arguments
    pub arguments: FieldTable,
}

impl Declare {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u16(0); // reserved
        put_short_str(dst, &self.queue)?;
        let bits = self.passive as u8
            | (self.durable as u8) << 1
            | (self.exclusive as u8) << 2
            | (self.auto_delete as u8) << 3
            | (self.no_wait as u8) << 4;
        dst.put_u8(bits);
        self.arguments.encode(dst)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        src.get_u16();
        let queue = get_short_str(src)?;
        ensure(src, 1)?;
        let bits = src.get_u8();
        Ok(Self {
            queue,
            passive: bits & 1 != 0,
            durable: bits & 2 != 0,
            exclusive: bits & 4 != 0,
            auto_delete: bits & 8 != 0,
            no_wait: bits & 16 != 0,
            arguments: FieldTable::decode(src)?,
        })
    }
}

/// queue.declare-ok
#[derive(Debug, Clone, PartialEq)]
pub struct DeclareOk {
    /// The queue name, server-generated when the declare sent an empty name
    pub queue: String,
    /// Number of messages in the queue
    pub message_count: u32,
    /// Number of consumers on the queue
    pub consumer_count: u32,
}

impl DeclareOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        put_short_str(dst, &self.queue)?;
        dst.put_u32(self.message_count);
        dst.put_u32(self.consumer_count);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let queue = get_short_str(src)?;
        ensure(src, 8)?;
        Ok(Self {
            queue,
            message_count: src.get_u32(),
            consumer_count: src.get_u32(),
        })
    }
}

/// queue.bind
#[derive(Debug, Clone, PartialEq)]
pub struct Bind {
    /// Queue to bind
    pub queue: String,
    /// Source exchange
    pub exchange: String,
    /// Routing key for the binding
    pub routing_key: String,
    /// Do not send bind-ok
    pub no_wait: bool,
    /// Extension arguments
    pub arguments: FieldTable,
}

impl Bind {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u16(0); // reserved
        put_short_str(dst, &self.queue)?;
        put_short_str(dst, &self.exchange)?;
        put_short_str(dst, &self.routing_key)?;
        dst.put_u8(self.no_wait as u8);
        self.arguments.encode(dst)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        src.get_u16();
        let queue = get_short_str(src)?;
        let exchange = get_short_str(src)?;
        let routing_key = get_short_str(src)?;
        ensure(src, 1)?;
        let no_wait = src.get_u8() & 1 != 0;
        Ok(Self {
            queue,
            exchange,
            routing_key,
            no_wait,
            arguments: FieldTable::decode(src)?,
        })
    }
}

/// queue.unbind
///
/// Unlike every other queue method this one carries no `no_wait` bit.
#[derive(Debug, Clone, PartialEq)]
pub struct Unbind {
    /// Queue to unbind
    pub queue: String,
    /// Source exchange
    pub exchange: String,
    /// Routing key of the binding
    pub routing_key: String,
    /// Extension arguments
    pub arguments: FieldTable,
}

impl Unbind {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u16(0); // reserved
        put_short_str(dst, &self.queue)?;
        put_short_str(dst, &self.exchange)?;
        put_short_str(dst, &self.routing_key)?;
        self.arguments.encode(dst)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        src.get_u16();
        Ok(Self {
            queue: get_short_str(src)?,
            exchange: get_short_str(src)?,
            routing_key: get_short_str(src)?,
            arguments: FieldTable::decode(src)?,
        })
    }
}

/// queue.delete
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    /// Queue to delete
    pub queue: String,
    /// Only delete if no consumers
    pub if_unused: bool,
    /// Only delete if empty
    pub if_empty: bool,
    /// Do not send delete-ok
    pub no_wait: bool,
}

impl Delete {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u16(0); // reserved
        put_short_str(dst, &self.queue)?;
        let bits =
            self.if_unused as u8 | (self.if_empty as u8) << 1 | (self.no_wait as u8) << 2;
        dst.put_u8(bits);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        src.get_u16();
        let queue = get_short_str(src)?;
        ensure(src, 1)?;
        let bits = src.get_u8();
        Ok(Self {
            queue,
            if_unused: bits & 1 != 0,
            if_empty: bits & 2 != 0,
            no_wait: bits & 4 != 0,
        })
    }
}

/// queue.delete-ok
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOk {
    /// Number of messages deleted with the queue
    pub message_count: u32,
}

impl DeleteOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u32(self.message_count);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 4)?;
        Ok(Self {
            message_count: src.get_u32(),
        })
    }
}
