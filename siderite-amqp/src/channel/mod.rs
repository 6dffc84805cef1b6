//! The user-facing channel handle
//!
//! A [`Channel`] is bound to one session multiplexed on the connection's
//! socket. Synchronous methods (declares, binds, consume) block on a
//! single-slot rendezvous until the engine posts the matching `-ok` or the
//! channel closes, whichever comes first; asynchronous methods (publish,
//! ack, nack, reject) enqueue their frames and return.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use siderite_amqp_types::methods::{basic, queue};
use siderite_amqp_types::primitives::FieldTable;
use siderite_amqp_types::{BasicProperties, Method};
use tokio::sync::{mpsc, oneshot};

use crate::connection::shutdown::ShutdownNotifier;
use crate::connection::ShutdownReason;
use crate::control::ConnectionControl;
use crate::error::Error;

/// A message delivered to a consumer callback
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Tag of the consumer the message was delivered to
    pub consumer_tag: String,
    /// Channel-scoped tag used to acknowledge this delivery
    pub delivery_tag: u64,
    /// Whether the message has been delivered before
    pub redelivered: bool,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Message properties
    pub properties: BasicProperties,
    /// Message body
    pub body: Bytes,
}

/// Options for [`Channel::exchange_declare`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ExchangeDeclareOptions {
    /// Check for existence without creating
    pub passive: bool,
    /// Survive broker restarts
    pub durable: bool,
    /// Delete when the last binding is removed
    pub auto_delete: bool,
    /// Not directly publishable by clients
    pub internal: bool,
}

/// Options for [`Channel::queue_declare`]
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDeclareOptions {
    /// Check for existence without creating
    pub passive: bool,
    /// Survive broker restarts
    pub durable: bool,
    /// Only accessible on this connection, deleted with it
    pub exclusive: bool,
    /// Delete when the last consumer cancels
    pub auto_delete: bool,
}

/// Options for [`Channel::queue_delete`]
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDeleteOptions {
    /// Only delete when the queue has no consumers
    pub if_unused: bool,
    /// Only delete when the queue is empty
    pub if_empty: bool,
}

/// Options for [`Channel::basic_consume`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumeOptions {
    /// Do not deliver messages published on this connection
    pub no_local: bool,
    /// Deliveries need no acknowledgement
    pub no_ack: bool,
    /// Request exclusive consumer access to the queue
    pub exclusive: bool,
}

struct ChannelInner {
    number: u16,
    control: mpsc::Sender<ConnectionControl>,
    shutdown: Arc<ShutdownNotifier>,
    connection_shutdown: Arc<ShutdownNotifier>,
    rpc_gate: tokio::sync::Mutex<()>,
    continuation_timeout: Duration,
}

/// A handle to one channel of an open connection
///
/// Clones share the same channel. The handle stays valid after the channel
/// closed; operations then report [`Error::AlreadyClosed`] carrying the
/// channel's shutdown reason.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.inner.number)
            .field("is_open", &self.is_open())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        number: u16,
        control: mpsc::Sender<ConnectionControl>,
        shutdown: Arc<ShutdownNotifier>,
        connection_shutdown: Arc<ShutdownNotifier>,
        continuation_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                number,
                control,
                shutdown,
                connection_shutdown,
                rpc_gate: tokio::sync::Mutex::new(()),
                continuation_timeout,
            }),
        }
    }

    /// The channel number
    pub fn number(&self) -> u16 {
        self.inner.number
    }

    /// Whether both this channel and its connection are open
    pub fn is_open(&self) -> bool {
        !self.inner.shutdown.is_latched() && !self.inner.connection_shutdown.is_latched()
    }

    /// The channel's shutdown reason, once there is one
    pub fn shutdown_reason(&self) -> Option<Arc<ShutdownReason>> {
        self.inner.shutdown.reason()
    }

    /// Subscribe a shutdown observer; invoked exactly once with the final
    /// reason, synchronously when the channel is already closed
    pub fn on_shutdown(&self, handler: impl FnOnce(Arc<ShutdownReason>) + Send + 'static) {
        self.inner.shutdown.on_shutdown(handler);
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if let Some(reason) = self.inner.shutdown.reason() {
            return Err(Error::AlreadyClosed(reason));
        }
        if let Some(reason) = self.inner.connection_shutdown.reason() {
            return Err(Error::AlreadyClosed(reason));
        }
        Ok(())
    }

    fn closed_error(&self) -> Error {
        let reason = self
            .inner
            .shutdown
            .reason()
            .or_else(|| self.inner.connection_shutdown.reason())
            .unwrap_or_else(|| Arc::new(ShutdownReason::end_of_stream()));
        Error::AlreadyClosed(reason)
    }

    async fn rpc(&self, method: Method) -> Result<Method, Error> {
        let _gate = self.inner.rpc_gate.lock().await;
        self.ensure_open()?;

        let (responder, outcome) = oneshot::channel();
        self.inner
            .control
            .send(ConnectionControl::Rpc {
                number: self.inner.number,
                method,
                responder,
            })
            .await
            .map_err(|_| self.closed_error())?;

        match tokio::time::timeout(self.inner.continuation_timeout, outcome).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(_)) => Err(self.closed_error()),
            Ok(Ok(result)) => result,
        }
    }

    async fn send(&self, method: Method) -> Result<(), Error> {
        self.ensure_open()?;
        self.inner
            .control
            .send(ConnectionControl::Send {
                number: self.inner.number,
                method,
            })
            .await
            .map_err(|_| self.closed_error())
    }

    /// Declare an exchange
    pub async fn exchange_declare(
        &self,
        exchange: impl Into<String>,
        kind: impl Into<String>,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let declare = siderite_amqp_types::methods::exchange::Declare {
            exchange: exchange.into(),
            kind: kind.into(),
            passive: options.passive,
            durable: options.durable,
            auto_delete: options.auto_delete,
            internal: options.internal,
            no_wait: false,
            arguments,
        };
        self.rpc(Method::ExchangeDeclare(declare)).await?;
        Ok(())
    }

    /// Delete an exchange
    pub async fn exchange_delete(
        &self,
        exchange: impl Into<String>,
        if_unused: bool,
    ) -> Result<(), Error> {
        let delete = siderite_amqp_types::methods::exchange::Delete {
            exchange: exchange.into(),
            if_unused,
            no_wait: false,
        };
        self.rpc(Method::ExchangeDelete(delete)).await?;
        Ok(())
    }

    /// Bind an exchange to an exchange
    pub async fn exchange_bind(
        &self,
        destination: impl Into<String>,
        source: impl Into<String>,
        routing_key: impl Into<String>,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let bind = siderite_amqp_types::methods::exchange::Bind {
            destination: destination.into(),
            source: source.into(),
            routing_key: routing_key.into(),
            no_wait: false,
            arguments,
        };
        self.rpc(Method::ExchangeBind(bind)).await?;
        Ok(())
    }

    /// Unbind an exchange from an exchange
    pub async fn exchange_unbind(
        &self,
        destination: impl Into<String>,
        source: impl Into<String>,
        routing_key: impl Into<String>,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let unbind = siderite_amqp_types::methods::exchange::Unbind {
            destination: destination.into(),
            source: source.into(),
            routing_key: routing_key.into(),
            no_wait: false,
            arguments,
        };
        self.rpc(Method::ExchangeUnbind(unbind)).await?;
        Ok(())
    }

    /// Declare a queue; an empty name asks the server to generate one
    pub async fn queue_declare(
        &self,
        queue: impl Into<String>,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<queue::DeclareOk, Error> {
        let declare = queue::Declare {
            queue: queue.into(),
            passive: options.passive,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            no_wait: false,
            arguments,
        };
        match self.rpc(Method::QueueDeclare(declare)).await? {
            Method::QueueDeclareOk(ok) => Ok(ok),
            _ => Err(self.closed_error()),
        }
    }

    /// Bind a queue to an exchange
    pub async fn queue_bind(
        &self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let bind = queue::Bind {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            no_wait: false,
            arguments,
        };
        self.rpc(Method::QueueBind(bind)).await?;
        Ok(())
    }

    /// Unbind a queue from an exchange
    pub async fn queue_unbind(
        &self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let unbind = queue::Unbind {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            arguments,
        };
        self.rpc(Method::QueueUnbind(unbind)).await?;
        Ok(())
    }

    /// Delete a queue, returning the number of messages deleted with it
    pub async fn queue_delete(
        &self,
        queue: impl Into<String>,
        options: QueueDeleteOptions,
    ) -> Result<u32, Error> {
        let delete = queue::Delete {
            queue: queue.into(),
            if_unused: options.if_unused,
            if_empty: options.if_empty,
            no_wait: false,
        };
        match self.rpc(Method::QueueDelete(delete)).await? {
            Method::QueueDeleteOk(ok) => Ok(ok.message_count),
            _ => Err(self.closed_error()),
        }
    }

    /// Set the prefetch window for this channel's consumers
    pub async fn basic_qos(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<(), Error> {
        let qos = basic::Qos {
            prefetch_size,
            prefetch_count,
            global,
        };
        self.rpc(Method::BasicQos(qos)).await?;
        Ok(())
    }

    /// Start a consumer; the callback runs on the connection's dispatch
    /// workers, in broker order within this channel
    ///
    /// An empty `consumer_tag` asks the server to generate one; the tag in
    /// use is returned.
    pub async fn basic_consume(
        &self,
        queue: impl Into<String>,
        consumer_tag: impl Into<String>,
        options: ConsumeOptions,
        arguments: FieldTable,
        callback: impl Fn(Delivery) + Send + Sync + 'static,
    ) -> Result<String, Error> {
        let _gate = self.inner.rpc_gate.lock().await;
        self.ensure_open()?;

        let consume = basic::Consume {
            queue: queue.into(),
            consumer_tag: consumer_tag.into(),
            no_local: options.no_local,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            no_wait: false,
            arguments,
        };
        let (responder, outcome) = oneshot::channel();
        self.inner
            .control
            .send(ConnectionControl::Consume {
                number: self.inner.number,
                method: consume,
                callback: Arc::new(callback),
                responder,
            })
            .await
            .map_err(|_| self.closed_error())?;

        match tokio::time::timeout(self.inner.continuation_timeout, outcome).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(_)) => Err(self.closed_error()),
            Ok(Ok(result)) => result,
        }
    }

    /// Cancel a consumer
    pub async fn basic_cancel(&self, consumer_tag: impl Into<String>) -> Result<(), Error> {
        let cancel = basic::Cancel {
            consumer_tag: consumer_tag.into(),
            no_wait: false,
        };
        self.rpc(Method::BasicCancel(cancel)).await?;
        Ok(())
    }

    /// Publish a message; enqueued and sent without waiting for the broker
    pub async fn basic_publish(
        &self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        properties: BasicProperties,
        body: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let publish = basic::Publish {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            mandatory: false,
            immediate: false,
        };
        self.inner
            .control
            .send(ConnectionControl::Publish {
                number: self.inner.number,
                method: publish,
                properties,
                body: body.into(),
            })
            .await
            .map_err(|_| self.closed_error())
    }

    /// Acknowledge a delivery
    ///
    /// A tag obtained before a recovery is out of range on the recovered
    /// channel; the broker may reject it, but the client sends it as-is
    /// and does not treat the stale tag as a channel error.
    pub async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), Error> {
        self.send(Method::BasicAck(basic::Ack {
            delivery_tag,
            multiple,
        }))
        .await
    }

    /// Negatively acknowledge one or more deliveries
    pub async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), Error> {
        self.send(Method::BasicNack(basic::Nack {
            delivery_tag,
            multiple,
            requeue,
        }))
        .await
    }

    /// Reject a delivery
    pub async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.send(Method::BasicReject(basic::Reject {
            delivery_tag,
            requeue,
        }))
        .await
    }

    /// Gracefully close the channel
    pub async fn close(&self) -> Result<(), Error> {
        let _gate = self.inner.rpc_gate.lock().await;
        if let Some(reason) = self.inner.shutdown.reason() {
            return Err(Error::AlreadyClosed(reason));
        }

        let (responder, outcome) = oneshot::channel();
        self.inner
            .control
            .send(ConnectionControl::CloseChannel {
                number: self.inner.number,
                responder,
            })
            .await
            .map_err(|_| self.closed_error())?;

        match tokio::time::timeout(self.inner.continuation_timeout, outcome).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(_)) => Ok(()),
            Ok(Ok(result)) => result,
        }
    }
}
