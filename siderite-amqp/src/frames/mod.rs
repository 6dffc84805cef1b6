//! AMQP 0-9-1 frame type and the corresponding encoder and decoder
//!
//! Wire layout of every frame:
//!
//! ```text
//! type:u8  channel:u16  payload_size:u32  payload  frame-end:u8 = 0xCE
//! ```
//!
//! Method, header and heartbeat payloads are decoded eagerly; body payloads
//! stay as raw bytes and are reassembled per channel by the session.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use siderite_amqp_types::definitions::{
    FRAME_BODY, FRAME_END, FRAME_HEADER, FRAME_HEARTBEAT, FRAME_METHOD,
};
use siderite_amqp_types::{ContentHeader, Method};
use tokio_util::codec::{Decoder, Encoder};

use crate::Payload;

mod error;
pub use error::Error;

const FRAME_HEADER_LEN: usize = 7;

/// A single AMQP frame
#[derive(Debug)]
pub struct Frame {
    /// The channel the frame belongs to; zero is the connection channel
    pub channel: u16,

    /// The frame payload
    pub payload: FramePayload,
}

/// Decoded payload of a frame
#[derive(Debug)]
pub enum FramePayload {
    /// A method frame
    Method(Method),

    /// A content header frame
    Header(ContentHeader),

    /// A fragment of a content body
    Body(Payload),

    /// A heartbeat; always on channel zero with an empty payload
    Heartbeat,
}

impl Frame {
    /// Creates a method frame
    pub fn method(channel: u16, method: Method) -> Self {
        Self {
            channel,
            payload: FramePayload::Method(method),
        }
    }

    /// Creates a content header frame
    pub fn header(channel: u16, header: ContentHeader) -> Self {
        Self {
            channel,
            payload: FramePayload::Header(header),
        }
    }

    /// Creates a content body frame
    pub fn body(channel: u16, body: Payload) -> Self {
        Self {
            channel,
            payload: FramePayload::Body(body),
        }
    }

    /// Creates a heartbeat frame
    pub fn heartbeat() -> Self {
        Self {
            channel: 0,
            payload: FramePayload::Heartbeat,
        }
    }
}

/// Encoder and decoder of AMQP frames
///
/// The negotiated frame-max bounds both directions: oversized inbound
/// frames are a framing error, outbound frames are asserted against it by
/// the session splitting content bodies.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Creates a codec bounded by the given frame-max
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Update the bound after tune negotiation
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (frame_type, payload) = match item.payload {
            FramePayload::Method(method) => {
                let mut buf = BytesMut::new();
                method.encode(&mut buf)?;
                (FRAME_METHOD, buf.freeze())
            }
            FramePayload::Header(header) => {
                let mut buf = BytesMut::new();
                header.encode(&mut buf)?;
                (FRAME_HEADER, buf.freeze())
            }
            FramePayload::Body(body) => (FRAME_BODY, body),
            FramePayload::Heartbeat => (FRAME_HEARTBEAT, Bytes::new()),
        };

        dst.put_u8(frame_type);
        dst.put_u16(item.channel);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        dst.put_u8(FRAME_END);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // A peer that rejects our protocol version answers with its own
        // 8-byte header instead of a frame.
        if src.len() >= 4 && src[..4] == *b"AMQP" {
            if src.len() < 8 {
                return Ok(None);
            }
            let header = src.split_to(8);
            return Err(Error::ProtocolHeader {
                major: header[5],
                minor: header[6],
                revision: header[7],
            });
        }

        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let frame_type = src[0];
        let channel = u16::from_be_bytes([src[1], src[2]]);
        let size = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;
        if size + FRAME_HEADER_LEN + 1 > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        if src.len() < FRAME_HEADER_LEN + size + 1 {
            src.reserve(FRAME_HEADER_LEN + size + 1 - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let mut payload = src.split_to(size).freeze();
        let frame_end = src.get_u8();
        if frame_end != FRAME_END {
            return Err(Error::BadFrameEnd(frame_end));
        }

        let payload = match frame_type {
            FRAME_METHOD => FramePayload::Method(Method::decode(&mut payload)?),
            FRAME_HEADER => FramePayload::Header(ContentHeader::decode(&mut payload)?),
            FRAME_BODY => FramePayload::Body(payload),
            FRAME_HEARTBEAT => FramePayload::Heartbeat,
            other => return Err(Error::UnknownFrameType(other)),
        };

        Ok(Some(Frame { channel, payload }))
    }
}

#[cfg(test)]
mod tests {
    use siderite_amqp_types::methods::connection;
    use siderite_amqp_types::primitives::FieldTable;

    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::new(4096)
    }

    #[test]
    fn heartbeat_frame_layout() {
        let mut buf = BytesMut::new();
        codec().encode(Frame::heartbeat(), &mut buf).unwrap();
        assert_eq!(&buf[..], &[8, 0, 0, 0, 0, 0, 0, 0xCE]);
    }

    #[test]
    fn method_frame_round_trip() {
        let close = Method::ConnectionClose(connection::Close {
            reply_code: 320,
            reply_text: "CONNECTION_FORCED".into(),
            class_id: 0,
            method_id: 0,
        });
        let mut buf = BytesMut::new();
        codec().encode(Frame::method(0, close), &mut buf).unwrap();

        let frame = codec().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.channel, 0);
        match frame.payload {
            FramePayload::Method(Method::ConnectionClose(close)) => {
                assert_eq!(close.reply_code, 320);
                assert_eq!(close.reply_text, "CONNECTION_FORCED");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let start = Method::ConnectionStart(connection::Start {
            version_major: 0,
            version_minor: 9,
            server_properties: FieldTable::new(),
            mechanisms: "PLAIN".into(),
            locales: "en_US".into(),
        });
        let mut buf = BytesMut::new();
        codec().encode(Frame::method(0, start), &mut buf).unwrap();

        let mut partial = BytesMut::from(&buf[..buf.len() - 3]);
        let mut codec = codec();
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&buf[buf.len() - 3..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn bad_frame_end_is_rejected() {
        let mut buf = BytesMut::new();
        codec().encode(Frame::heartbeat(), &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] = 0x00;
        assert!(matches!(
            codec().decode(&mut buf),
            Err(Error::BadFrameEnd(0x00))
        ));
    }

    #[test]
    fn server_protocol_header_reports_version() {
        let mut buf = BytesMut::from(&b"AMQP\x00\x00\x08\x00"[..]);
        match codec().decode(&mut buf) {
            Err(Error::ProtocolHeader {
                major,
                minor,
                revision,
            }) => assert_eq!((major, minor, revision), (0, 8, 0)),
            other => panic!("expected protocol header error, got {other:?}"),
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(3);
        buf.put_u16(1);
        buf.put_u32(8192);
        assert!(matches!(
            codec().decode(&mut buf),
            Err(Error::FrameTooLarge { size: 8192, .. })
        ));
    }
}
