//! Control messages from user handles to the connection engine

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use siderite_amqp_types::methods::basic;
use siderite_amqp_types::{BasicProperties, Method};
use tokio::sync::oneshot;

use crate::connection::shutdown::ShutdownNotifier;
use crate::connection::ShutdownReason;
use crate::dispatch::DeliveryCallback;
use crate::error::Error;

/// What the engine hands back once a channel.open-ok arrived
pub(crate) struct OpenedChannel {
    pub number: u16,
    pub shutdown: Arc<ShutdownNotifier>,
}

pub(crate) enum ConnectionControl {
    /// Graceful close: quiesce, transmit connection.close, await close-ok
    Close {
        reason: ShutdownReason,
        responder: oneshot::Sender<Result<(), Error>>,
    },

    /// Stop the engine and drop the transport without a close handshake
    Abort,

    /// Allocate a session and perform channel.open
    OpenChannel {
        number: Option<u16>,
        responder: oneshot::Sender<Result<OpenedChannel, Error>>,
    },

    /// Quiesce a session and perform channel.close
    CloseChannel {
        number: u16,
        responder: oneshot::Sender<Result<(), Error>>,
    },

    /// A synchronous method awaiting its matching -ok
    Rpc {
        number: u16,
        method: Method,
        responder: oneshot::Sender<Result<Method, Error>>,
    },

    /// An asynchronous method; written and forgotten
    Send { number: u16, method: Method },

    /// basic.publish with its content header and body
    Publish {
        number: u16,
        method: basic::Publish,
        properties: BasicProperties,
        body: Bytes,
    },

    /// basic.consume carrying the delivery callback to register on -ok
    Consume {
        number: u16,
        method: basic::Consume,
        callback: DeliveryCallback,
        responder: oneshot::Sender<Result<String, Error>>,
    },
}

impl fmt::Debug for ConnectionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionControl::Close { reason, .. } => {
                f.debug_struct("Close").field("reason", reason).finish()
            }
            ConnectionControl::Abort => f.write_str("Abort"),
            ConnectionControl::OpenChannel { number, .. } => {
                f.debug_struct("OpenChannel").field("number", number).finish()
            }
            ConnectionControl::CloseChannel { number, .. } => {
                f.debug_struct("CloseChannel").field("number", number).finish()
            }
            ConnectionControl::Rpc { number, method, .. } => f
                .debug_struct("Rpc")
                .field("number", number)
                .field("method", &method.class_method())
                .finish(),
            ConnectionControl::Send { number, method } => f
                .debug_struct("Send")
                .field("number", number)
                .field("method", &method.class_method())
                .finish(),
            ConnectionControl::Publish { number, method, .. } => f
                .debug_struct("Publish")
                .field("number", number)
                .field("exchange", &method.exchange)
                .finish(),
            ConnectionControl::Consume { number, method, .. } => f
                .debug_struct("Consume")
                .field("number", number)
                .field("queue", &method.queue)
                .finish(),
        }
    }
}
