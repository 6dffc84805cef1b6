//! Methods of the channel class

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};
use crate::primitives::{ensure, get_long_str, get_short_str, put_long_str, put_short_str};

/// channel.open
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Open {
    /// Reserved out-of-band string, empty on 0-9-1
    pub out_of_band: String,
}

impl Open {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        put_short_str(dst, &self.out_of_band)
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            out_of_band: get_short_str(src)?,
        })
    }
}

/// channel.open-ok
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenOk {
    /// Reserved channel-id string, empty on 0-9-1
    pub channel_id: Bytes,
}

impl OpenOk {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        put_long_str(dst, &self.channel_id);
        Ok(())
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: get_long_str(src)?,
        })
    }
}

/// channel.close
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
