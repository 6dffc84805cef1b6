//! Automatic connection and topology recovery
//!
//! [`RecoveringConnection`] and [`RecoveringChannel`] are the long-lived
//! handles an application holds. They delegate every call to the current
//! underlying [`Connection`] / [`Channel`] and feed the topology recorder;
//! when the underlying connection shuts down for any reason other than an
//! application close, a recovery task reconnects through the configured
//! endpoint list, recreates each channel and replays the recorded topology
//! in declaration order, rewriting server-assigned names as the broker
//! hands out fresh ones.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use siderite_amqp_types::definitions::REPLY_SUCCESS;
use siderite_amqp_types::methods::basic;
use siderite_amqp_types::primitives::FieldTable;
use tracing::{debug, info, warn};

use crate::channel::{
    Channel, ConsumeOptions, Delivery, ExchangeDeclareOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use crate::connection::builder::{open_with_config, ConnectionConfig};
use crate::connection::{Connection, Endpoint, OpenError, ShutdownInitiator, ShutdownReason};
use crate::dispatch::DeliveryCallback;
use crate::error::Error;
use crate::topology::{
    BindingDestination, RecordedBinding, RecordedConsumer, RecordedExchange, RecordedQueue,
    TopologyRecorder,
};

use bytes::Bytes;
use siderite_amqp_types::methods::queue;
use siderite_amqp_types::BasicProperties;

/// Where the recovery state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// Connected and serving
    Running,

    /// Disconnected; the numbered reconnect attempt is in progress
    Reconnecting(u32),

    /// The configured attempt limit was exhausted
    GivenUp,

    /// The user closed the connection; recovery never runs again
    UserClosed,
}

/// Why a recovery step failed
///
/// Reported through [`RecoveringConnection::on_recovery_error`]; a failed
/// step never aborts the rest of the recovery pass.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// A reconnect attempt failed; another follows after the configured
    /// interval
    #[error("reconnect attempt failed: {0}")]
    Connect(#[source] OpenError),

    /// A channel could not be re-opened on the fresh connection
    #[error("channel recovery failed: {0}")]
    ChannelRecovery(#[source] Error),

    /// One recorded entity could not be replayed
    #[error("topology recovery of {entity} failed: {source}")]
    Topology {
        /// Description of the entity that failed to replay
        entity: String,
        /// The underlying error
        #[source]
        source: Error,
    },
}

type Listener<A> = Box<dyn Fn(&A) + Send + Sync>;

struct RecoveryEvents {
    recovery_succeeded: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    recovery_error: Mutex<Vec<Listener<RecoveryError>>>,
    queue_name_change: Mutex<Vec<Box<dyn Fn(&str, &str) + Send + Sync>>>,
    consumer_tag_change: Mutex<Vec<Box<dyn Fn(&str, &str) + Send + Sync>>>,
    shutdown: Mutex<Vec<Listener<ShutdownReason>>>,
}

impl RecoveryEvents {
    fn new() -> Self {
        Self {
            recovery_succeeded: Mutex::new(Vec::new()),
            recovery_error: Mutex::new(Vec::new()),
            queue_name_change: Mutex::new(Vec::new()),
            consumer_tag_change: Mutex::new(Vec::new()),
            shutdown: Mutex::new(Vec::new()),
        }
    }
}

pub(crate) struct RecoveringConnectionInner {
    config: Arc<ConnectionConfig>,
    current: RwLock<Connection>,
    recorder: TopologyRecorder,
    channels: Mutex<Vec<Weak<RecoveringChannelInner>>>,
    phase: Mutex<RecoveryPhase>,
    closed: AtomicBool,
    events: RecoveryEvents,
}

impl RecoveringConnectionInner {
    fn fire_shutdown(&self, reason: &ShutdownReason) {
        for listener in self.events.shutdown.lock().iter() {
            listener(reason);
        }
    }

    /// Suppressed once the user closed the connection, including for
    /// listeners subscribed after the close
    fn fire_recovery_error(&self, error: &RecoveryError) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        warn!(%error, "recovery step failed");
        for listener in self.events.recovery_error.lock().iter() {
            listener(error);
        }
    }

    fn fire_recovery_succeeded(&self) {
        for listener in self.events.recovery_succeeded.lock().iter() {
            listener();
        }
    }

    fn fire_queue_name_change(&self, before: &str, after: &str) {
        for listener in self.events.queue_name_change.lock().iter() {
            listener(before, after);
        }
    }

    fn fire_consumer_tag_change(&self, before: &str, after: &str) {
        for listener in self.events.consumer_tag_change.lock().iter() {
            listener(before, after);
        }
    }

    fn live_channels(&self) -> Vec<Arc<RecoveringChannelInner>> {
        let mut channels = self.channels.lock();
        channels.retain(|weak| weak.strong_count() > 0);
        channels.iter().filter_map(Weak::upgrade).collect()
    }
}

pub(crate) struct RecoveringChannelInner {
    connection: Weak<RecoveringConnectionInner>,
    current: RwLock<Channel>,
    qos: Mutex<Option<basic::Qos>>,
    recovery_listeners: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl RecoveringChannelInner {
    fn fire_recovery_succeeded(&self) {
        for listener in self.recovery_listeners.lock().iter() {
            listener();
        }
    }
}

/// An auto-recovering connection handle
///
/// Stays valid across socket loss: the handle transparently switches to
/// the recovered underlying connection. It is closed for good only by
/// [`close`](Self::close) or [`abort`](Self::abort).
#[derive(Clone)]
pub struct RecoveringConnection {
    inner: Arc<RecoveringConnectionInner>,
}

impl fmt::Debug for RecoveringConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveringConnection")
            .field("phase", &self.recovery_phase())
            .field("is_open", &self.is_open())
            .finish()
    }
}

fn install_shutdown_hook(inner: &Arc<RecoveringConnectionInner>, connection: &Connection) {
    let weak = Arc::downgrade(inner);
    connection.on_shutdown(move |reason| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.fire_shutdown(&reason);
        if reason.initiator == ShutdownInitiator::Application {
            return;
        }
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        info!(%reason, "connection lost, starting recovery");
        tokio::spawn(recover(inner));
    });
}

/// The reconnect loop, spawned on each non-application shutdown
async fn recover(inner: Arc<RecoveringConnectionInner>) {
    let mut attempt: u32 = 1;
    {
        let mut phase = inner.phase.lock();
        match *phase {
            RecoveryPhase::UserClosed => return,
            // another recovery task is already driving the reconnect
            RecoveryPhase::Reconnecting(_) => return,
            _ => *phase = RecoveryPhase::Reconnecting(attempt),
        }
    }

    loop {
        if inner.closed.load(Ordering::SeqCst) {
            *inner.phase.lock() = RecoveryPhase::UserClosed;
            return;
        }

        match open_with_config(inner.config.clone()).await {
            Ok(connection) => {
                // the user may have closed while this attempt was still
                // connecting; that close only saw the old dead connection,
                // so the fresh one is ours to put down
                if inner.closed.load(Ordering::SeqCst) {
                    connection.abort().await;
                    *inner.phase.lock() = RecoveryPhase::UserClosed;
                    return;
                }
                debug!(endpoint = %connection.endpoint(), attempt, "reconnected");
                install_shutdown_hook(&inner, &connection);
                *inner.current.write() = connection.clone();

                recover_channels_and_topology(&inner, &connection).await;

                // same race, one window later: a close that landed during
                // replay must win, and no success event may follow it
                if inner.closed.load(Ordering::SeqCst) {
                    connection.abort().await;
                    *inner.phase.lock() = RecoveryPhase::UserClosed;
                    return;
                }

                // a connection that died during replay could not restart
                // recovery itself while this attempt held the state; pick
                // the loss up here
                if !connection.is_open() {
                    attempt += 1;
                    let mut phase = inner.phase.lock();
                    if *phase == RecoveryPhase::UserClosed {
                        return;
                    }
                    *phase = RecoveryPhase::Reconnecting(attempt);
                    continue;
                }

                *inner.phase.lock() = RecoveryPhase::Running;
                // the connection reports success before any of its channels
                inner.fire_recovery_succeeded();
                for channel in inner.live_channels() {
                    channel.fire_recovery_succeeded();
                }
                return;
            }
            Err(err) => {
                if inner.closed.load(Ordering::SeqCst) {
                    *inner.phase.lock() = RecoveryPhase::UserClosed;
                    return;
                }
                inner.fire_recovery_error(&RecoveryError::Connect(err));
                if let Some(limit) = inner.config.recovery_attempt_limit {
                    if attempt >= limit {
                        warn!(attempt, "recovery attempt limit reached, giving up");
                        *inner.phase.lock() = RecoveryPhase::GivenUp;
                        return;
                    }
                }
                tokio::time::sleep(inner.config.network_recovery_interval).await;
                attempt += 1;
                let mut phase = inner.phase.lock();
                if *phase == RecoveryPhase::UserClosed {
                    return;
                }
                *phase = RecoveryPhase::Reconnecting(attempt);
            }
        }
    }
}

async fn recover_channels_and_topology(
    inner: &Arc<RecoveringConnectionInner>,
    connection: &Connection,
) {
    // first bring every user-held channel back so its handle works again
    let channels = inner.live_channels();
    for channel in &channels {
        match connection.open_channel().await {
            Ok(fresh) => {
                *channel.current.write() = fresh.clone();
                let qos = *channel.qos.lock();
                if let Some(qos) = qos {
                    if let Err(err) = fresh
                        .basic_qos(qos.prefetch_size, qos.prefetch_count, qos.global)
                        .await
                    {
                        inner.fire_recovery_error(&RecoveryError::Topology {
                            entity: "channel qos".to_string(),
                            source: err,
                        });
                    }
                }
            }
            Err(err) => inner.fire_recovery_error(&RecoveryError::ChannelRecovery(err)),
        }
    }

    if !inner.config.topology_recovery {
        // the recorded entities become server-side ghosts; forget them so
        // a later recovery does not resurrect them either
        inner.recorder.clear();
        return;
    }

    // declarations and bindings replay on a dedicated channel; replay
    // order is exchanges, queues, bindings, consumers
    let replay = match connection.open_channel().await {
        Ok(channel) => channel,
        Err(err) => {
            inner.fire_recovery_error(&RecoveryError::ChannelRecovery(err));
            return;
        }
    };

    for exchange in inner.recorder.snapshot_exchanges() {
        let options = ExchangeDeclareOptions {
            passive: false,
            durable: exchange.durable,
            auto_delete: exchange.auto_delete,
            internal: exchange.internal,
        };
        if let Err(err) = replay
            .exchange_declare(
                exchange.name.clone(),
                exchange.kind.clone(),
                options,
                exchange.arguments.clone(),
            )
            .await
        {
            inner.fire_recovery_error(&RecoveryError::Topology {
                entity: format!("exchange {}", exchange.name),
                source: err,
            });
        }
    }

    // server-named queues are re-declared with an empty name; dependent
    // bindings and consumers are rewritten before they replay below
    for queue in inner.recorder.snapshot_queues() {
        let options = QueueDeclareOptions {
            passive: false,
            durable: queue.durable,
            exclusive: queue.exclusive,
            auto_delete: queue.auto_delete,
        };
        let requested = if queue.server_named {
            String::new()
        } else {
            queue.name.clone()
        };
        match replay
            .queue_declare(requested, options, queue.arguments.clone())
            .await
        {
            Ok(ok) => {
                if queue.server_named && ok.queue != queue.name {
                    inner.recorder.rename_queue(&queue.name, &ok.queue);
                    inner.fire_queue_name_change(&queue.name, &ok.queue);
                }
            }
            Err(err) => {
                inner.fire_recovery_error(&RecoveryError::Topology {
                    entity: format!("queue {}", queue.name),
                    source: err,
                });
            }
        }
    }

    for binding in inner.recorder.snapshot_bindings() {
        let replayed = match &binding.destination {
            BindingDestination::Queue(queue) => {
                replay
                    .queue_bind(
                        queue.clone(),
                        binding.source.clone(),
                        binding.routing_key.clone(),
                        binding.arguments.clone(),
                    )
                    .await
            }
            BindingDestination::Exchange(exchange) => {
                replay
                    .exchange_bind(
                        exchange.clone(),
                        binding.source.clone(),
                        binding.routing_key.clone(),
                        binding.arguments.clone(),
                    )
                    .await
            }
        };
        if let Err(err) = replayed {
            inner.fire_recovery_error(&RecoveryError::Topology {
                entity: format!("binding {} -> {:?}", binding.source, binding.destination),
                source: err,
            });
        }
    }

    let _ = replay.close().await;

    // consumers replay on their owning channel; a consumer whose channel
    // handle is gone is pruned instead
    for consumer in inner.recorder.snapshot_consumers() {
        let Some(owner) = consumer.channel.upgrade() else {
            inner.recorder.delete_consumer(&consumer.consumer_tag);
            continue;
        };
        let channel = owner.current.read().clone();
        let callback = consumer.callback.clone();
        let options = ConsumeOptions {
            no_local: false,
            no_ack: consumer.no_ack,
            exclusive: consumer.exclusive,
        };
        match channel
            .basic_consume(
                consumer.queue.clone(),
                consumer.consumer_tag.clone(),
                options,
                consumer.arguments.clone(),
                move |delivery| callback(delivery),
            )
            .await
        {
            Ok(tag) => {
                if tag != consumer.consumer_tag {
                    inner.recorder.rename_consumer(&consumer.consumer_tag, &tag);
                    inner.fire_consumer_tag_change(&consumer.consumer_tag, &tag);
                }
            }
            Err(err) => {
                inner.fire_recovery_error(&RecoveryError::Topology {
                    entity: format!("consumer {}", consumer.consumer_tag),
                    source: err,
                });
            }
        }
    }
}

impl RecoveringConnection {
    pub(crate) async fn open(config: Arc<ConnectionConfig>) -> Result<Self, OpenError> {
        let connection = open_with_config(config.clone()).await?;
        let inner = Arc::new(RecoveringConnectionInner {
            config,
            current: RwLock::new(connection.clone()),
            recorder: TopologyRecorder::new(),
            channels: Mutex::new(Vec::new()),
            phase: Mutex::new(RecoveryPhase::Running),
            closed: AtomicBool::new(false),
            events: RecoveryEvents::new(),
        });
        install_shutdown_hook(&inner, &connection);
        Ok(Self { inner })
    }

    /// The current underlying connection
    pub fn connection(&self) -> Connection {
        self.inner.current.read().clone()
    }

    /// The endpoint the current underlying connection is attached to
    pub fn endpoint(&self) -> Endpoint {
        self.inner.current.read().endpoint().clone()
    }

    /// Where the recovery state machine currently is
    pub fn recovery_phase(&self) -> RecoveryPhase {
        *self.inner.phase.lock()
    }

    /// The recorded topology replayed on every recovery
    pub fn topology(&self) -> &TopologyRecorder {
        &self.inner.recorder
    }

    /// Whether the underlying connection is open and recovery has neither
    /// given up nor been cancelled by a user close
    pub fn is_open(&self) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }
        if matches!(
            *self.inner.phase.lock(),
            RecoveryPhase::GivenUp | RecoveryPhase::UserClosed
        ) {
            return false;
        }
        self.inner.current.read().is_open()
    }

    fn closed_error(&self) -> Error {
        let reason = self
            .inner
            .current
            .read()
            .shutdown_reason()
            .unwrap_or_else(|| {
                Arc::new(ShutdownReason::application(
                    REPLY_SUCCESS,
                    "Connection closed by application",
                ))
            });
        Error::AlreadyClosed(reason)
    }

    /// Open a recovering channel
    ///
    /// The handle stays usable across recoveries; while the connection is
    /// down its operations fail with [`Error::AlreadyClosed`] until
    /// recovery completes.
    pub async fn create_channel(&self) -> Result<RecoveringChannel, Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        let connection = self.connection();
        let channel = connection.open_channel().await?;
        let inner = Arc::new(RecoveringChannelInner {
            connection: Arc::downgrade(&self.inner),
            current: RwLock::new(channel),
            qos: Mutex::new(None),
            recovery_listeners: Mutex::new(Vec::new()),
        });
        self.inner.channels.lock().push(Arc::downgrade(&inner));
        Ok(RecoveringChannel { inner })
    }

    /// Close for good; no further recovery attempt is made
    pub async fn close(&self) -> Result<(), Error> {
        self.inner.closed.store(true, Ordering::SeqCst);
        *self.inner.phase.lock() = RecoveryPhase::UserClosed;
        let connection = self.connection();
        connection.close().await
    }

    /// Close for good, suppressing AlreadyClosed and IO errors
    pub async fn abort(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        *self.inner.phase.lock() = RecoveryPhase::UserClosed;
        let connection = self.connection();
        connection.abort().await;
    }

    /// Subscribe to successful recoveries; fires after the connection and
    /// before its channels report theirs
    pub fn on_recovery_succeeded(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.inner
            .events
            .recovery_succeeded
            .lock()
            .push(Box::new(listener));
    }

    /// Subscribe to failed recovery steps
    ///
    /// Never fires after [`close`](Self::close), regardless of when the
    /// listener was subscribed.
    pub fn on_recovery_error(&self, listener: impl Fn(&RecoveryError) + Send + Sync + 'static) {
        self.inner
            .events
            .recovery_error
            .lock()
            .push(Box::new(listener));
    }

    /// Subscribe to server-named queue renames during recovery
    ///
    /// The listener receives the name before and after the rename.
    pub fn on_queue_name_change(
        &self,
        listener: impl Fn(&str, &str) + Send + Sync + 'static,
    ) {
        self.inner
            .events
            .queue_name_change
            .lock()
            .push(Box::new(listener));
    }

    /// Subscribe to consumer tag renames during recovery
    pub fn on_consumer_tag_change(
        &self,
        listener: impl Fn(&str, &str) + Send + Sync + 'static,
    ) {
        self.inner
            .events
            .consumer_tag_change
            .lock()
            .push(Box::new(listener));
    }

    /// Subscribe to shutdowns of the underlying connection; unlike
    /// [`Connection::on_shutdown`] this fires on every disconnect
    pub fn on_shutdown(&self, listener: impl Fn(&ShutdownReason) + Send + Sync + 'static) {
        self.inner.events.shutdown.lock().push(Box::new(listener));
    }
}

/// An auto-recovering channel handle
///
/// Declarative operations are recorded for replay; the handle switches to
/// the re-opened underlying channel after each recovery.
#[derive(Clone)]
pub struct RecoveringChannel {
    inner: Arc<RecoveringChannelInner>,
}

impl fmt::Debug for RecoveringChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveringChannel")
            .field("number", &self.channel().number())
            .finish()
    }
}

impl RecoveringChannel {
    /// The current underlying channel
    pub fn channel(&self) -> Channel {
        self.inner.current.read().clone()
    }

    fn connection(&self) -> Result<Arc<RecoveringConnectionInner>, Error> {
        self.inner.connection.upgrade().ok_or(Error::ObjectDisposed)
    }

    /// Whether the underlying channel is open and recovery is still alive
    pub fn is_open(&self) -> bool {
        let Ok(connection) = self.connection() else {
            return false;
        };
        if matches!(
            *connection.phase.lock(),
            RecoveryPhase::GivenUp | RecoveryPhase::UserClosed
        ) {
            return false;
        }
        self.channel().is_open()
    }

    /// Subscribe to this channel's recovery completions
    pub fn on_recovery_succeeded(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.inner.recovery_listeners.lock().push(Box::new(listener));
    }

    /// Declare an exchange and record it for recovery
    pub async fn exchange_declare(
        &self,
        exchange: impl Into<String>,
        kind: impl Into<String>,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let connection = self.connection()?;
        let exchange = exchange.into();
        let kind = kind.into();
        if !options.passive {
            connection.recorder.record_exchange(RecordedExchange {
                name: exchange.clone(),
                kind: kind.clone(),
                durable: options.durable,
                auto_delete: options.auto_delete,
                internal: options.internal,
                arguments: arguments.clone(),
            });
        }
        self.channel()
            .exchange_declare(exchange, kind, options, arguments)
            .await
    }

    /// Delete an exchange; the record goes once the broker confirmed
    pub async fn exchange_delete(
        &self,
        exchange: impl Into<String>,
        if_unused: bool,
    ) -> Result<(), Error> {
        let connection = self.connection()?;
        let exchange = exchange.into();
        self.channel()
            .exchange_delete(exchange.clone(), if_unused)
            .await?;
        connection.recorder.delete_exchange(&exchange);
        Ok(())
    }

    /// Bind an exchange to an exchange and record the binding
    pub async fn exchange_bind(
        &self,
        destination: impl Into<String>,
        source: impl Into<String>,
        routing_key: impl Into<String>,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let connection = self.connection()?;
        let destination = destination.into();
        let source = source.into();
        let routing_key = routing_key.into();
        connection.recorder.record_binding(RecordedBinding {
            source: source.clone(),
            destination: BindingDestination::Exchange(destination.clone()),
            routing_key: routing_key.clone(),
            arguments: arguments.clone(),
        });
        self.channel()
            .exchange_bind(destination, source, routing_key, arguments)
            .await
    }

    /// Unbind an exchange from an exchange and drop the record
    pub async fn exchange_unbind(
        &self,
        destination: impl Into<String>,
        source: impl Into<String>,
        routing_key: impl Into<String>,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let connection = self.connection()?;
        let destination = destination.into();
        let source = source.into();
        let routing_key = routing_key.into();
        self.channel()
            .exchange_unbind(
                destination.clone(),
                source.clone(),
                routing_key.clone(),
                arguments.clone(),
            )
            .await?;
        connection.recorder.delete_binding(&RecordedBinding {
            source,
            destination: BindingDestination::Exchange(destination),
            routing_key,
            arguments,
        });
        Ok(())
    }

    /// Declare a queue and record it for recovery
    ///
    /// A queue declared with an empty name is recorded as server-named
    /// under the name the broker assigned; recovery re-declares it with an
    /// empty name and rewrites its bindings and consumers to the fresh
    /// name.
    pub async fn queue_declare(
        &self,
        queue: impl Into<String>,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<queue::DeclareOk, Error> {
        let connection = self.connection()?;
        let name = queue.into();
        if options.passive {
            return self.channel().queue_declare(name, options, arguments).await;
        }
        if name.is_empty() {
            let ok = self
                .channel()
                .queue_declare(String::new(), options, arguments.clone())
                .await?;
            connection.recorder.record_queue(RecordedQueue {
                name: ok.queue.clone(),
                durable: options.durable,
                exclusive: options.exclusive,
                auto_delete: options.auto_delete,
                server_named: true,
                arguments,
            });
            Ok(ok)
        } else {
            connection.recorder.record_queue(RecordedQueue {
                name: name.clone(),
                durable: options.durable,
                exclusive: options.exclusive,
                auto_delete: options.auto_delete,
                server_named: false,
                arguments: arguments.clone(),
            });
            self.channel().queue_declare(name, options, arguments).await
        }
    }

    /// Bind a queue to an exchange and record the binding
    pub async fn queue_bind(
        &self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let connection = self.connection()?;
        let queue = queue.into();
        let exchange = exchange.into();
        let routing_key = routing_key.into();
        connection.recorder.record_binding(RecordedBinding {
            source: exchange.clone(),
            destination: BindingDestination::Queue(queue.clone()),
            routing_key: routing_key.clone(),
            arguments: arguments.clone(),
        });
        self.channel()
            .queue_bind(queue, exchange, routing_key, arguments)
            .await
    }

    /// Unbind a queue from an exchange and drop the record
    pub async fn queue_unbind(
        &self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let connection = self.connection()?;
        let queue = queue.into();
        let exchange = exchange.into();
        let routing_key = routing_key.into();
        self.channel()
            .queue_unbind(
                queue.clone(),
                exchange.clone(),
                routing_key.clone(),
                arguments.clone(),
            )
            .await?;
        connection.recorder.delete_binding(&RecordedBinding {
            source: exchange,
            destination: BindingDestination::Queue(queue),
            routing_key,
            arguments,
        });
        Ok(())
    }

    /// Delete a queue; its record, bindings and consumers go once the
    /// broker confirmed
    pub async fn queue_delete(
        &self,
        queue: impl Into<String>,
        options: QueueDeleteOptions,
    ) -> Result<u32, Error> {
        let connection = self.connection()?;
        let queue = queue.into();
        let deleted = self.channel().queue_delete(queue.clone(), options).await?;
        connection.recorder.delete_queue(&queue);
        Ok(deleted)
    }

    /// Set the prefetch window; replayed on this channel before its
    /// consumers during recovery
    pub async fn basic_qos(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<(), Error> {
        *self.inner.qos.lock() = Some(basic::Qos {
            prefetch_size,
            prefetch_count,
            global,
        });
        self.channel()
            .basic_qos(prefetch_size, prefetch_count, global)
            .await
    }

    /// Start a consumer and record it for recovery
    pub async fn basic_consume(
        &self,
        queue: impl Into<String>,
        consumer_tag: impl Into<String>,
        options: ConsumeOptions,
        arguments: FieldTable,
        callback: impl Fn(Delivery) + Send + Sync + 'static,
    ) -> Result<String, Error> {
        let connection = self.connection()?;
        let queue = queue.into();
        let callback: DeliveryCallback = Arc::new(callback);
        let forwarded = callback.clone();
        let tag = self
            .channel()
            .basic_consume(
                queue.clone(),
                consumer_tag.into(),
                options,
                arguments.clone(),
                move |delivery| forwarded(delivery),
            )
            .await?;
        connection.recorder.record_consumer(RecordedConsumer {
            consumer_tag: tag.clone(),
            queue,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            arguments,
            channel: Arc::downgrade(&self.inner),
            callback,
        });
        Ok(tag)
    }

    /// Cancel a consumer and drop its record
    pub async fn basic_cancel(&self, consumer_tag: impl Into<String>) -> Result<(), Error> {
        let connection = self.connection()?;
        let consumer_tag = consumer_tag.into();
        self.channel().basic_cancel(consumer_tag.clone()).await?;
        connection.recorder.delete_consumer(&consumer_tag);
        Ok(())
    }

    /// Publish a message through the current underlying channel
    pub async fn basic_publish(
        &self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        properties: BasicProperties,
        body: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.channel()
            .basic_publish(exchange, routing_key, properties, body)
            .await
    }

    /// Acknowledge a delivery; a tag from before a recovery is forwarded
    /// as-is and left to the broker to judge
    pub async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), Error> {
        self.channel().basic_ack(delivery_tag, multiple).await
    }

    /// Negatively acknowledge one or more deliveries
    pub async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), Error> {
        self.channel().basic_nack(delivery_tag, multiple, requeue).await
    }

    /// Reject a delivery
    pub async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.channel().basic_reject(delivery_tag, requeue).await
    }

    /// Close the channel and withdraw its consumers from recovery
    pub async fn close(&self) -> Result<(), Error> {
        let result = self.channel().close().await;
        if let Ok(connection) = self.connection() {
            connection
                .recorder
                .purge_channel_consumers(&Arc::downgrade(&self.inner));
        }
        result
    }
}
