//! Methods of the connection class

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};
use crate::primitives::{ensure, get_long_str, get_short_str, put_long_str, put_short_str, FieldTable};

/// connection.start
#[derive(Debug, Clone, PartialEq)]
pub struct Start {
    /// Protocol major version the server speaks
    pub version_major: u8,
    /// Protocol minor version the server speaks
    pub version_minor: u8,
    /// Server properties reported at startup
    pub server_properties: FieldTable,
    /// Space-separated SASL mechanisms the server offers
    pub mechanisms: String,
    /// Space-separated message locales the server offers
    pub locales: String,
}

impl Start {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u8(self.version_major);
        dst.put_u8(self.version_minor);
        self.server_properties.encode(dst)?;
        put_long_str(dst, self.mechanisms.as_bytes());
        put_long_str(dst, self.locales.as_bytes());
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        Ok(Self {
            version_major: src.get_u8(),
            version_minor: src.get_u8(),
            server_properties: FieldTable::decode(src)?,
            mechanisms: String::from_utf8(get_long_str(src)?.to_vec())?,
            locales: String::from_utf8(get_long_str(src)?.to_vec())?,
        })
    }
}

/// connection.start-ok
#[derive(Debug, Clone, PartialEq)]
pub struct StartOk {
    /// Client properties, including the capability table and connection name
    pub client_properties: FieldTable,
    /// The selected SASL mechanism
    pub mechanism: String,
    /// The opaque initial SASL response
    pub response: Bytes,
    /// The selected message locale
    pub locale: String,
}

impl StartOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        self.client_properties.encode(dst)?;
        put_short_str(dst, &self.mechanism)?;
        put_long_str(dst, &self.response);
        put_short_str(dst, &self.locale)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            client_properties: FieldTable::decode(src)?,
            mechanism: get_short_str(src)?,
            response: get_long_str(src)?,
            locale: get_short_str(src)?,
        })
    }
}

/// connection.secure
#[derive(Debug, Clone, PartialEq)]
pub struct Secure {
    /// Server challenge data for the SASL mechanism
    pub challenge: Bytes,
}

impl Secure {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        put_long_str(dst, &self.challenge);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            challenge: get_long_str(src)?,
        })
    }
}

/// connection.secure-ok
#[derive(Debug, Clone, PartialEq)]
pub struct SecureOk {
    /// Client response to the challenge
    pub response: Bytes,
}

impl SecureOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        put_long_str(dst, &self.response);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            response: get_long_str(src)?,
        })
    }
}

/// connection.tune
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tune {
    /// Highest channel number the server proposes; zero means no limit
    pub channel_max: u16,
    /// Largest frame size the server proposes; zero means no limit
    pub frame_max: u32,
    /// Heartbeat delay in seconds the server proposes; zero disables
    pub heartbeat: u16,
}

impl Tune {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u16(self.channel_max);
        dst.put_u32(self.frame_max);
        dst.put_u16(self.heartbeat);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 8)?;
        Ok(Self {
            channel_max: src.get_u16(),
            frame_max: src.get_u32(),
            heartbeat: src.get_u16(),
        })
    }
}

/// connection.tune-ok
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuneOk {
    /// Negotiated channel max
    pub channel_max: u16,
    /// Negotiated frame max
    pub frame_max: u32,
    /// Negotiated heartbeat delay in seconds
    pub heartbeat: u16,
}

impl TuneOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u16(self.channel_max);
        dst.put_u32(self.frame_max);
        dst.put_u16(self.heartbeat);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 8)?;
        Ok(Self {
            channel_max: src.get_u16(),
            frame_max: src.get_u32(),
            heartbeat: src.get_u16(),
        })
    }
}

/// connection.open
#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    /// Virtual host to open
    pub virtual_host: String,
    /// Reserved capability string, empty on 0-9-1
    pub capabilities: String,
    /// Reserved insist bit carried over from 0-9
    pub insist: bool,
}

impl Open {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        put_short_str(dst, &self.virtual_host)?;
        put_short_str(dst, &self.capabilities)?;
        dst.put_u8(self.insist as u8);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let virtual_host = get_short_str(src)?;
        let capabilities = get_short_str(src)?;
        ensure(src, 1)?;
        Ok(Self {
            virtual_host,
            capabilities,
            insist: src.get_u8() & 1 != 0,
        })
    }
}

/// connection.open-ok
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenOk {
    /// Reserved known-hosts string, empty on 0-9-1
    pub known_hosts: String,
}

impl OpenOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        put_short_str(dst, &self.known_hosts)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            known_hosts: get_short_str(src)?,
        })
    }
}

/// connection.close
#[derive(Debug, Clone, PartialEq)]
pub struct Close {
    /// Reply code explaining the close
    pub reply_code: u16,
    /// Human-readable reply text
    pub reply_text: String,
    /// Class id of the method that caused the close, or zero
    pub class_id: u16,
    /// Method id of the method that caused the close, or zero
    pub method_id: u16,
}

impl Close {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u16(self.reply_code);
        put_short_str(dst, &self.reply_text)?;
        dst.put_u16(self.class_id);
        dst.put_u16(self.method_id);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        let reply_code = src.get_u16();
        let reply_text = get_short_str(src)?;
        ensure(src, 4)?;
        Ok(Self {
            reply_code,
            reply_text,
            class_id: src.get_u16(),
            method_id: src.get_u16(),
        })
    }
}

/// connection.blocked (RabbitMQ extension)
#[derive(Debug, Clone, PartialEq)]
pub struct Blocked {
    /// Why the broker stopped accepting publishes
    pub reason: String,
}

impl Blocked {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        put_short_str(dst, &self.reason)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            reason: get_short_str(src)?,
        })
    }
}
