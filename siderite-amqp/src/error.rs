//! User-facing errors for operations on connections and channels

use std::io;
use std::sync::Arc;

use crate::connection::ShutdownReason;

/// Error returned by operations on an open connection or channel
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection or channel has already been shut down
    ///
    /// Carries the shutdown reason, including the reply code of the close
    /// that ended it.
    #[error("Already closed: {0}")]
    AlreadyClosed(Arc<ShutdownReason>),

    /// An RPC or close did not complete within its timeout
    ///
    /// Never fatal to the connection by itself.
    #[error("Operation timed out")]
    Timeout,

    /// Every channel number up to the negotiated channel-max is in use
    #[error("All channel numbers are in use")]
    ChannelExhausted,

    /// Another synchronous method is already awaiting its reply on this
    /// channel
    #[error("Another RPC is already in flight on this channel")]
    RpcInFlight,

    /// The handle outlived the recovering connection that produced it
    #[error("Handle is no longer attached to a connection")]
    ObjectDisposed,

    /// IO error on the transport
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The AMQP reply code behind this error, when there is one
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            Error::AlreadyClosed(reason) => Some(reason.reply_code),
            _ => None,
        }
    }
}
