//! Implementation of the AMQP 0-9-1 connection
//!
//! [`Connection`] is a cheaply cloneable handle onto the engine task that
//! owns the socket. Opening performs the full handshake before the handle
//! is returned; afterwards every interaction is a control message to the
//! engine. The handle survives into the shutdown: once the close reason is
//! latched, every operation reports [`Error::AlreadyClosed`] with that
//! reason.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use siderite_amqp_types::definitions::REPLY_SUCCESS;
use siderite_amqp_types::primitives::FieldTable;
use tokio::sync::{mpsc, oneshot};

use crate::channel::Channel;
use crate::control::ConnectionControl;
use crate::dispatch::{CallbackExceptionSink, WorkService};
use crate::error::Error;
use crate::transport::Transport;

pub mod builder;
pub(crate) mod engine;
pub(crate) mod heartbeat;
pub(crate) mod shutdown;

mod error;

pub use builder::{Builder, Endpoint};
pub use error::OpenError;
pub use shutdown::{ShutdownInitiator, ShutdownReason};

pub(crate) use shutdown::ShutdownNotifier;

use self::builder::ConnectionConfig;
use self::engine::{ConnectionEngine, Handshake};

pub(crate) const DEFAULT_CONTROL_BUFFER: usize = 128;

/// Default timeout for a graceful close
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection states
///
/// Transitions are monotonic: `Opening → Open → Quiescing → Closed`, with
/// the `Opening → Closed` and `Open → Closed` shortcuts. The close reason
/// is latched exactly once by the first transition out of Open or Opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress
    Opening,

    /// Fully open
    Open,

    /// connection.close sent, waiting for close-ok; only channel zero is
    /// still serviced
    Quiescing,

    /// Fully closed
    Closed,
}

/// Observers for connection.blocked / connection.unblocked notifications
#[derive(Clone)]
pub(crate) struct BlockedSink {
    handlers: Arc<Mutex<Vec<Box<dyn Fn(Option<&str>) + Send + Sync>>>>,
}

impl BlockedSink {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(Option<&str>) + Send + Sync + 'static) {
        self.handlers.lock().push(Box::new(handler));
    }

    pub fn notify(&self, reason: Option<&str>) {
        for handler in self.handlers.lock().iter() {
            handler(reason);
        }
    }
}

struct ConnectionInner {
    control: mpsc::Sender<ConnectionControl>,
    shutdown: Arc<ShutdownNotifier>,
    callback_exceptions: CallbackExceptionSink,
    blocked: BlockedSink,
    server_properties: FieldTable,
    channel_max: u16,
    frame_max: u32,
    heartbeat: u16,
    endpoint: Endpoint,
    config: Arc<ConnectionConfig>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        let _ = self.control.try_send(ConnectionControl::Abort);
    }
}

/// A handle to an open AMQP 0-9-1 connection
///
/// Clones share the same underlying connection. Without automatic
/// recovery, the first failure shuts the connection down permanently; see
/// [`crate::RecoveringConnection`] for the auto-recovering variant.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.inner.endpoint)
            .field("is_open", &self.is_open())
            .finish()
    }
}

impl Connection {
    /// Creates a builder for a connection
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Open a plain connection from an `amqp://` URI
    pub async fn open(uri: &str) -> Result<Connection, OpenError> {
        Self::builder().uri(uri)?.open().await
    }

    /// Bind the engine onto a completed handshake and spawn its main loop
    pub(crate) fn start<Io>(
        transport: Transport<Io>,
        handshake: Handshake,
        endpoint: Endpoint,
        config: Arc<ConnectionConfig>,
    ) -> Self
    where
        Io: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let (control_tx, control_rx) = mpsc::channel(DEFAULT_CONTROL_BUFFER);
        let shutdown = Arc::new(ShutdownNotifier::new());
        let callback_exceptions = CallbackExceptionSink::new();
        let blocked = BlockedSink::new();
        let work = WorkService::new(
            config.consumer_dispatch_concurrency,
            callback_exceptions.clone(),
        );

        ConnectionEngine::new(
            transport,
            handshake.tune,
            control_rx,
            shutdown.clone(),
            work,
            blocked.clone(),
        )
        .spawn();

        Self {
            inner: Arc::new(ConnectionInner {
                control: control_tx,
                shutdown,
                callback_exceptions,
                blocked,
                server_properties: handshake.server_properties,
                channel_max: handshake.tune.channel_max,
                frame_max: handshake.tune.frame_max,
                heartbeat: handshake.tune.heartbeat,
                endpoint,
                config,
            }),
        }
    }

    /// Whether the connection is open
    pub fn is_open(&self) -> bool {
        !self.inner.shutdown.is_latched()
    }

    /// The shutdown reason, once there is one
    pub fn shutdown_reason(&self) -> Option<Arc<ShutdownReason>> {
        self.inner.shutdown.reason()
    }

    /// Subscribe a shutdown observer
    ///
    /// The handler is invoked exactly once with the final shutdown reason.
    /// Subscribing after the connection already shut down invokes the
    /// handler synchronously with the existing reason.
    pub fn on_shutdown(&self, handler: impl FnOnce(Arc<ShutdownReason>) + Send + 'static) {
        self.inner.shutdown.on_shutdown(handler);
    }

    /// Subscribe an observer for exceptions escaping consumer callbacks
    pub fn on_callback_exception(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.callback_exceptions.subscribe(handler);
    }

    /// Subscribe an observer for connection.blocked notifications
    ///
    /// Called with `Some(reason)` when the broker blocks the connection
    /// and `None` when it unblocks it.
    pub fn on_blocked(&self, handler: impl Fn(Option<&str>) + Send + Sync + 'static) {
        self.inner.blocked.subscribe(handler);
    }

    /// Properties the server reported on connection.start
    pub fn server_properties(&self) -> &FieldTable {
        &self.inner.server_properties
    }

    /// Negotiated channel-max
    pub fn channel_max(&self) -> u16 {
        self.inner.channel_max
    }

    /// Negotiated frame-max in octets
    pub fn frame_max(&self) -> u32 {
        self.inner.frame_max
    }

    /// Negotiated heartbeat in seconds; zero means heartbeats are off
    pub fn heartbeat(&self) -> u16 {
        self.inner.heartbeat
    }

    /// The endpoint this connection is attached to
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub(crate) fn config(&self) -> &Arc<ConnectionConfig> {
        &self.inner.config
    }

    fn closed_error(&self) -> Error {
        let reason = self
            .inner
            .shutdown
            .reason()
            .unwrap_or_else(|| Arc::new(ShutdownReason::end_of_stream()));
        Error::AlreadyClosed(reason)
    }

    /// Open a channel on the lowest free channel number
    pub async fn open_channel(&self) -> Result<Channel, Error> {
        self.open_channel_inner(None).await
    }

    /// Open a channel on a specific channel number
    pub async fn open_channel_with(&self, number: u16) -> Result<Channel, Error> {
        self.open_channel_inner(Some(number)).await
    }

    async fn open_channel_inner(&self, number: Option<u16>) -> Result<Channel, Error> {
        if let Some(reason) = self.inner.shutdown.reason() {
            return Err(Error::AlreadyClosed(reason));
        }
        let (responder, outcome) = oneshot::channel();
        self.inner
            .control
            .send(ConnectionControl::OpenChannel { number, responder })
            .await
            .map_err(|_| self.closed_error())?;

        let opened = match tokio::time::timeout(self.inner.config.continuation_timeout, outcome)
            .await
        {
            Err(_) => return Err(Error::Timeout),
            Ok(Err(_)) => return Err(self.closed_error()),
            Ok(Ok(result)) => result?,
        };

        Ok(Channel::new(
            opened.number,
            self.inner.control.clone(),
            opened.shutdown,
            self.inner.shutdown.clone(),
            self.inner.config.continuation_timeout,
        ))
    }

    /// Gracefully close with reply code 200 and the default timeout
    ///
    /// A second close reports [`Error::AlreadyClosed`]; use [`abort`](Self::abort)
    /// to close without surfacing such errors.
    pub async fn close(&self) -> Result<(), Error> {
        self.shut(
            ShutdownReason::application(REPLY_SUCCESS, "Goodbye"),
            DEFAULT_CLOSE_TIMEOUT,
            false,
        )
        .await
    }

    /// Gracefully close with an explicit reply code, text and timeout
    pub async fn close_with(
        &self,
        reply_code: u16,
        reply_text: impl Into<String>,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.shut(
            ShutdownReason::application(reply_code, reply_text),
            timeout,
            false,
        )
        .await
    }

    /// Close, suppressing AlreadyClosed and IO errors
    pub async fn abort(&self) {
        let _ = self
            .shut(
                ShutdownReason::application(REPLY_SUCCESS, "Connection aborted"),
                DEFAULT_CLOSE_TIMEOUT,
                true,
            )
            .await;
    }

    async fn shut(
        &self,
        reason: ShutdownReason,
        timeout: Duration,
        abort: bool,
    ) -> Result<(), Error> {
        if let Some(existing) = self.inner.shutdown.reason() {
            if abort {
                return Ok(());
            }
            return Err(Error::AlreadyClosed(existing));
        }

        let (responder, outcome) = oneshot::channel();
        let sent = self
            .inner
            .control
            .send(ConnectionControl::Close { reason, responder })
            .await;
        if sent.is_err() {
            if abort {
                return Ok(());
            }
            return Err(self.closed_error());
        }

        match tokio::time::timeout(timeout, outcome).await {
            Ok(Ok(result)) => {
                if abort {
                    Ok(())
                } else {
                    result
                }
            }
            // the engine went away while closing; that is a completed close
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                // deadline elapsed: escalate to dropping the transport
                let _ = self.inner.control.try_send(ConnectionControl::Abort);
                if abort {
                    Ok(())
                } else {
                    Err(Error::Timeout)
                }
            }
        }
    }
}
