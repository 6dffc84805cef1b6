//! Errors raised by the frame codec

use std::io;

use siderite_amqp_types::{DecodeError, EncodeError};

/// Framing error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error from the underlying stream
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The peer answered the protocol header with its own version
    #[error("Peer requires protocol version {major}.{minor}.{revision}")]
    ProtocolHeader {
        /// Major version the peer offered
        major: u8,
        /// Minor version the peer offered
        minor: u8,
        /// Revision the peer offered
        revision: u8,
    },

    /// Inbound frame exceeds the negotiated frame-max
    #[error("Frame of {size} bytes exceeds the negotiated maximum of {max}")]
    FrameTooLarge {
        /// Payload size announced by the frame header
        size: usize,
        /// Negotiated frame-max
        max: usize,
    },

    /// The frame-end octet was not 0xCE
    #[error("Bad frame-end octet {0:#x}")]
    BadFrameEnd(u8),

    /// An unknown frame type octet
    #[error("Unknown frame type {0}")]
    UnknownFrameType(u8),

    /// The payload could not be encoded
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The payload could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),
}
