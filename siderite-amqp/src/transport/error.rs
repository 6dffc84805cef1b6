//! Transport errors

use std::io;

use crate::frames;

/// Error on the frame transport
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error on the socket
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The peer has been silent past the read timeout
    #[error("Read timeout elapsed without traffic from the peer")]
    IdleTimeoutElapsed,

    /// Framing error
    #[error(transparent)]
    Framing(frames::Error),
}

impl From<frames::Error> for Error {
    fn from(err: frames::Error) -> Self {
        match err {
            frames::Error::Io(err) => Self::Io(err),
            other => Self::Framing(other),
        }
    }
}
