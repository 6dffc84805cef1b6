//! Errors associated with opening a connection

use std::io;

use crate::transport;

/// Error opening a connection
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    /// IO error, including failure to reach any configured endpoint
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Error parsing a connection URI
    #[error(transparent)]
    UrlError(#[from] url::ParseError),

    /// The URI scheme is not `amqp`
    #[error(r#"Invalid scheme. Only "amqp" is supported."#)]
    InvalidScheme,

    /// The server speaks an incompatible protocol version
    #[error("Server requires protocol version {major}.{minor}")]
    ProtocolVersionMismatch {
        /// Major version offered by the server
        major: u8,
        /// Minor version offered by the server
        minor: u8,
    },

    /// The server refused the credentials during the SASL exchange
    #[error("Authentication failure: {reply_text}")]
    AuthenticationFailure {
        /// Reply text of the access-refused close
        reply_text: String,
    },

    /// The server closed the connection during the handshake
    #[error("Server closed the connection during handshake: {reply_code} {reply_text}")]
    ServerClosed {
        /// Reply code of the close
        reply_code: u16,
        /// Reply text of the close
        reply_text: String,
    },

    /// The handshake did not complete within the handshake timeout
    #[error("Handshake timed out")]
    Timeout,

    /// The server sent a frame that does not belong in the handshake
    #[error("Unexpected frame while waiting for {expecting}")]
    IllegalFrame {
        /// The handshake step that was in progress
        expecting: &'static str,
    },

    /// Transport failure during the handshake
    #[error(transparent)]
    Transport(transport::Error),
}

impl From<transport::Error> for OpenError {
    fn from(err: transport::Error) -> Self {
        match err {
            transport::Error::Io(err) => Self::Io(err),
            transport::Error::Framing(crate::frames::Error::ProtocolHeader {
                major, minor, ..
            }) => Self::ProtocolVersionMismatch { major, minor },
            other => Self::Transport(other),
        }
    }
}
