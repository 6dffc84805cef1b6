//! Methods of the exchange class

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};
use crate::primitives::{ensure, get_short_str, put_short_str, FieldTable};

/// exchange.declare
#[derive(Debug, Clone, PartialEq)]
pub struct Declare {
    /// Exchange name
    pub exchange: String,
    /// Exchange type, e.g. `direct`, `fanout`, `topic`
    pub kind: String,
    /// Check for existence without creating
    pub passive: bool,
    /// Survive broker restarts
    pub durable: bool,
    /// Delete when the last binding is removed
    pub auto_delete: bool,
    /// Not directly publishable by clients
    pub internal: bool,
    /// Do not send declare-ok
    pub no_wait: bool,
    /// Extension arguments
    pub arguments: FieldTable,
}

impl Declare {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u16(0); // reserved
        put_short_str(dst, &self.exchange)?;
        put_short_str(dst, &self.kind)?;
        let bits = self.passive as u8
            | (self.durable as u8) << 1
            | (self.auto_delete as u8) << 2
            | (self.internal as u8) << 3
            | (self.no_wait as u8) << 4;
        dst.put_u8(bits);
        self.arguments.encode(dst)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        src.get_u16();
        let exchange = get_short_str(src)?;
        let kind = get_short_str(src)?;
        ensure(src, 1)?;
        let bits = src.get_u8();
        Ok(Self {
            exchange,
            kind,
            passive: bits & 1 != 0,
            durable: bits & 2 != 0,
            auto_delete: bits & 4 != 0,
            internal: bits & 8 != 0,
            no_wait: bits & 16 != 0,
            arguments: FieldTable::decode(src)?,
        })
    }
}

/// exchange.delete
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    /// Exchange name
    pub exchange: String,
    /// Only delete if unused
    pub if_unused: bool,
    /// Do not send delete-ok
    pub no_wait: bool,
}

impl Delete {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u16(0); // reserved
        put_short_str(dst, &self.exchange)?;
        dst.put_u8(self.if_unused as u8 | (self.no_wait as u8) << 1);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        src.get_u16();
        let exchange = get_short_str(src)?;
        ensure(src, 1)?;
        let bits = src.get_u8();
        Ok(Self {
            exchange,
            if_unused: bits & 1 != 0,
            no_wait: bits & 2 != 0,
        })
    }
}

/// exchange.bind (RabbitMQ extension)
#[derive(Debug, Clone, PartialEq)]
pub struct Bind {
    /// Destination exchange
    pub destination: String,
    /// Source exchange
    pub source: String,
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
        put_short_str(dst, &self.destination)?;
        put_short_str(dst, &self.source)?;
        put_short_str(dst, &self.routing_key)?;
        dst.put_u8(self.no_wait as u8);
        self.arguments.encode(dst)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        src.get_u16();
        let destination = get_short_str(src)?;
        let source = get_short_str(src)?;
        let routing_key = get_short_str(src)?;
        ensure(src, 1)?;
        let no_wait = src.get_u8() & 1 != 0;
        Ok(Self {
            destination,
            source,
            routing_key,
            no_wait,
            arguments: FieldTable::decode(src)?,
        })
    }
}

/// exchange.unbind (RabbitMQ extension)
#[derive(Debug, Clone, PartialEq)]
pub struct Unbind {
    /// Destination exchange
    pub destination: String,
    /// Source exchange
    pub source: String,
    /// Routing key of the binding
    pub routing_key: String,
    /// Do not send unbind-ok
    pub no_wait: bool,
    /// Extension arguments
    pub arguments: FieldTable,
}

impl Unbind {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u16(0); // reserved
        put_short_str(dst, &self.destination)?;
        put_short_str(dst, &self.source)?;
        put_short_str(dst, &self.routing_key)?;
        dst.put_u8(self.no_wait as u8);
        self.arguments.encode(dst)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        src.get_u16();
        let destination = get_short_str(src)?;
        let source = get_short_str(src)?;
        let routing_key = get_short_str(src)?;
        ensure(src, 1)?;
        let no_wait = src.get_u8() & 1 != 0;
        Ok(Self {
            destination,
            source,
            routing_key,
            no_wait,
            arguments: FieldTable::decode(src)?,
        })
    }
}
