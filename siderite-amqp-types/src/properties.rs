//! Content header and basic message properties

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::definitions::CLASS_BASIC;
use crate::error::{DecodeError, EncodeError};
use crate::primitives::{ensure, get_short_str, put_short_str, FieldTable};

const FLAG_CONTENT_TYPE: u16 = 1 << 15;
const FLAG_CONTENT_ENCODING: u16 = 1 << 14;
const FLAG_HEADERS: u16 = 1 << 13;
const FLAG_DELIVERY_MODE: u16 = 1 << 12;
const FLAG_PRIORITY: u16 = 1 << 11;
const FLAG_CORRELATION_ID: u16 = 1 << 10;
const FLAG_REPLY_TO: u16 = 1 << 9;
const FLAG_EXPIRATION: u16 = 1 << 8;
const FLAG_MESSAGE_ID: u16 = 1 << 7;
const FLAG_TIMESTAMP: u16 = 1 << 6;
const FLAG_KIND: u16 = 1 << 5;
const FLAG_USER_ID: u16 = 1 << 4;
const FLAG_APP_ID: u16 = 1 << 3;
const FLAG_CLUSTER_ID: u16 = 1 << 2;

/// Properties carried in a basic content header
///
/// Every field is optional; the property flag word records which are
/// present on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    /// MIME content type
    pub content_type: Option<String>,
    /// MIME content encoding
    pub content_encoding: Option<String>,
    /// Application headers
    pub headers: Option<FieldTable>,
    /// 1 for transient, 2 for persistent
    pub delivery_mode: Option<u8>,
    /// Message priority, 0 to 9
    pub priority: Option<u8>,
    /// Application correlation identifier
    pub correlation_id: Option<String>,
    /// Address to reply to
    pub reply_to: Option<String>,
    /// Message expiration
    pub expiration: Option<String>,
    /// Application message identifier
    pub message_id: Option<String>,
    /// Message timestamp
    pub timestamp: Option<u64>,
    /// Message type name
    pub kind: Option<String>,
    /// Creating user id
    pub user_id: Option<String>,
    /// Creating application id
    pub app_id: Option<String>,
    /// Reserved cluster id
    pub cluster_id: Option<String>,
}

impl BasicProperties {
    fn flags(&self) -> u16 {
        let mut flags = 0;
        if self.content_type.is_some() {
            flags |= FLAG_CONTENT_TYPE;
        }
        if self.content_encoding.is_some() {
            flags |= FLAG_CONTENT_ENCODING;
        }
        if self.headers.is_some() {
            flags |= FLAG_HEADERS;
        }
        if self.delivery_mode.is_some() {
            flags |= FLAG_DELIVERY_MODE;
        }
        if self.priority.is_some() {
            flags |= FLAG_PRIORITY;
        }
        if self.correlation_id.is_some() {
            flags |= FLAG_CORRELATION_ID;
        }
        if self.reply_to.is_some() {
            flags |= FLAG_REPLY_TO;
        }
        if self.expiration.is_some() {
            flags |= FLAG_EXPIRATION;
        }
        if self.message_id.is_some() {
            flags |= FLAG_MESSAGE_ID;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_TIMESTAMP;
        }
        if self.kind.is_some() {
            flags |= FLAG_KIND;
        }
        if self.user_id.is_some() {
            flags |= FLAG_USER_ID;
        }
        if self.app_id.is_some() {
            flags |= FLAG_APP_ID;
        }
        if self.cluster_id.is_some() {
            flags |= FLAG_CLUSTER_ID;
        }
        flags
    }

    /// Encode the flag word followed by the present properties
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u16(self.flags());
        if let Some(value) = &self.content_type {
            put_short_str(dst, value)?;
        }
        if let Some(value) = &self.content_encoding {
            put_short_str(dst, value)?;
        }
        if let Some(value) = &self.headers {
            value.encode(dst)?;
        }
        if let Some(value) = self.delivery_mode {
            dst.put_u8(value);
        }
        if let Some(value) = self.priority {
            dst.put_u8(value);
        }
        if let Some(value) = &self.correlation_id {
            put_short_str(dst, value)?;
        }
        if let Some(value) = &self.reply_to {
            put_short_str(dst, value)?;
        }
        if let Some(value) = &self.expiration {
            put_short_str(dst, value)?;
        }
        if let Some(value) = &self.message_id {
            put_short_str(dst, value)?;
        }
        if let Some(value) = self.timestamp {
            dst.put_u64(value);
        }
        if let Some(value) = &self.kind {
            put_short_str(dst, value)?;
        }
        if let Some(value) = &self.user_id {
            put_short_str(dst, value)?;
        }
        if let Some(value) = &self.app_id {
            put_short_str(dst, value)?;
        }
        if let Some(value) = &self.cluster_id {
            put_short_str(dst, value)?;
        }
        Ok(())
    }

    /// Decode the flag word followed by the present properties
    pub fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        let flags = src.get_u16();
        let mut properties = Self::default();
        if flags & FLAG_CONTENT_TYPE != 0 {
            properties.content_type = Some(get_short_str(src)?);
        }
        if flags & FLAG_CONTENT_ENCODING != 0 {
            properties.content_encoding = Some(get_short_str(src)?);
        }
        if flags & FLAG_HEADERS != 0 {
            properties.headers = Some(FieldTable::decode(src)?);
        }
        if flags & FLAG_DELIVERY_MODE != 0 {
            ensure(src, 1)?;
            properties.delivery_mode = Some(src.get_u8());
        }
        if flags & FLAG_PRIORITY != 0 {
            ensure(src, 1)?;
            properties.priority = Some(src.get_u8());
        }
        if flags & FLAG_CORRELATION_ID != 0 {
            properties.correlation_id = Some(get_short_str(src)?);
        }
        if flags & FLAG_REPLY_TO != 0 {
            properties.reply_to = Some(get_short_str(src)?);
        }
        if flags & FLAG_EXPIRATION != 0 {
            properties.expiration = Some(get_short_str(src)?);
        }
        if flags & FLAG_MESSAGE_ID != 0 {
            properties.message_id = Some(get_short_str(src)?);
        }
        if flags & FLAG_TIMESTAMP != 0 {
            ensure(src, 8)?;
            properties.timestamp = Some(src.get_u64());
        }
        if flags & FLAG_KIND != 0 {
            properties.kind = Some(get_short_str(src)?);
        }
        if flags & FLAG_USER_ID != 0 {
            properties.user_id = Some(get_short_str(src)?);
        }
        if flags & FLAG_APP_ID != 0 {
            properties.app_id = Some(get_short_str(src)?);
        }
        if flags & FLAG_CLUSTER_ID != 0 {
            properties.cluster_id = Some(get_short_str(src)?);
        }
        Ok(properties)
    }
}

/// Payload of a content header frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentHeader {
    /// Total size of the content body in octets
    pub body_size: u64,
    /// Message properties
    pub properties: BasicProperties,
}

impl ContentHeader {
    /// Encode the class id, weight, body size and properties
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u16(CLASS_BASIC);
        dst.put_u16(0); // weight, always zero
        dst.put_u64(self.body_size);
        self.properties.encode(dst)
    }

    /// Decode a content header payload
    pub fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 12)?;
        let class_id = src.get_u16();
        if class_id != CLASS_BASIC {
            return Err(DecodeError::UnexpectedContentClass(class_id));
        }
        src.get_u16(); // weight
        let body_size = src.get_u64();
        let properties = BasicProperties::decode(src)?;
        Ok(Self {
            body_size,
            properties,
        })
    }
}
