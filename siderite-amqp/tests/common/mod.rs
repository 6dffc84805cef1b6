//! An in-process AMQP 0-9-1 broker for integration tests
//!
//! Speaks the real frame codec over a local TCP listener, keeps
//! broker-side topology across connections (so recovery observably
//! replays), and can drop its sockets on demand to force the client into
//! recovery.

// each integration test binary compiles this module separately and not
// all of them use every helper
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;

use siderite_amqp::frames::{Frame, FrameCodec, FramePayload};
use siderite_amqp::types::methods::{basic, channel, connection, queue};
use siderite_amqp::types::primitives::FieldTable;
use siderite_amqp::types::{ContentHeader, Method};

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub heartbeat: u16,
    /// Hand out a fresh consumer tag on every consume, even when the
    /// client asked for a specific one
    pub reassign_consumer_tags: bool,
    /// Hold every accepted socket this long before starting the
    /// handshake; lets tests race other calls against a connect that is
    /// guaranteed to still be in flight
    pub handshake_delay: Option<Duration>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            heartbeat: 0,
            reassign_consumer_tags: false,
            handshake_delay: None,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ()>,
    queues: HashMap<String, ()>,
    /// (source exchange, destination queue)
    bindings: Vec<(String, String)>,
    name_counter: u64,
    tag_counter: u64,
}

impl BrokerState {
    fn exchange_exists(&self, name: &str) -> bool {
        name.is_empty() || name.starts_with("amq.") || self.exchanges.contains_key(name)
    }
}

pub struct TestBroker {
    port: u16,
    state: Arc<Mutex<BrokerState>>,
    kill: watch::Sender<u64>,
    accepting: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    accepted: Arc<AtomicUsize>,
}

impl TestBroker {
    pub async fn start() -> Self {
        Self::start_with(BrokerOptions::default()).await
    }

    pub async fn start_with(options: BrokerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(BrokerState::default()));
        let (kill, _) = watch::channel(0u64);
        let accepting = Arc::new(AtomicBool::new(true));
        let connections = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::new(AtomicUsize::new(0));

        let accept_state = state.clone();
        let accept_kill = kill.clone();
        let accept_accepting = accepting.clone();
        let accept_connections = connections.clone();
        let accept_accepted = accepted.clone();
        let accept_options = options.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                if !accept_accepting.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                accept_accepted.fetch_add(1, Ordering::SeqCst);
                let state = accept_state.clone();
                let kill = accept_kill.subscribe();
                let connections = accept_connections.clone();
                let options = accept_options.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, state, kill, connections, options).await;
                });
            }
        });

        Self {
            port,
            state,
            kill,
            accepting,
            connections,
            accepted,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Abruptly drop every live socket, as a dying broker would
    pub fn kill_connections(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }

    /// Refuse to serve new connections; accepted sockets are dropped
    /// before the handshake
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn resume_accepting(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    /// Forget all broker-side topology, as a broker restart would
    pub fn clear_state(&self) {
        let mut state = self.state.lock();
        state.exchanges.clear();
        state.queues.clear();
        state.bindings.clear();
    }

    /// How many connections have completed the handshake so far
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// How many sockets have been accepted, handshake finished or not
    pub fn accepted_count(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` connections have completed handshakes
    pub async fn wait_for_connections(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.connection_count() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for the client to connect");
    }
}

struct PendingPublish {
    channel: u16,
    exchange: String,
    routing_key: String,
    header: Option<ContentHeader>,
    body: BytesMut,
}

async fn serve_connection(
    mut stream: TcpStream,
    state: Arc<Mutex<BrokerState>>,
    mut kill: watch::Receiver<u64>,
    connections: Arc<AtomicUsize>,
    options: BrokerOptions,
) -> Option<()> {
    if let Some(delay) = options.handshake_delay {
        tokio::time::sleep(delay).await;
    }

    let mut preamble = [0u8; 8];
    stream.read_exact(&mut preamble).await.ok()?;
    assert_eq!(&preamble[..4], b"AMQP");

    let mut framed = Framed::new(stream, FrameCodec::new(1024 * 1024));

    let mut server_properties = FieldTable::new();
    server_properties.insert("product", "siderite-test-broker");
    send(
        &mut framed,
        Frame::method(
            0,
            Method::ConnectionStart(connection::Start {
                version_major: 0,
                version_minor: 9,
                server_properties,
                mechanisms: "PLAIN AMQPLAIN".to_string(),
                locales: "en_US".to_string(),
            }),
        ),
    )
    .await?;

    match recv(&mut framed).await? {
        Method::ConnectionStartOk(start_ok) => assert_eq!(start_ok.mechanism, "PLAIN"),
        other => panic!("expected start-ok, got {other:?}"),
    }

    send(
        &mut framed,
        Frame::method(
            0,
            Method::ConnectionTune(connection::Tune {
                channel_max: 2047,
                frame_max: 131_072,
                heartbeat: options.heartbeat,
            }),
        ),
    )
    .await?;

    match recv(&mut framed).await? {
        Method::ConnectionTuneOk(_) => {}
        other => panic!("expected tune-ok, got {other:?}"),
    }
    match recv(&mut framed).await? {
        Method::ConnectionOpen(_) => {}
        other => panic!("expected connection.open, got {other:?}"),
    }
    send(
        &mut framed,
        Frame::method(
            0,
            Method::ConnectionOpenOk(connection::OpenOk::default()),
        ),
    )
    .await?;

    connections.fetch_add(1, Ordering::SeqCst);

    // per-connection consumer registry: queue -> (channel, tag)
    let mut consumers: HashMap<String, Vec<(u16, String)>> = HashMap::new();
    let mut pending: Option<PendingPublish> = None;
    let mut delivery_tag = 0u64;

    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame?.ok()?,
            _ = kill.changed() => return None,
        };

        let channel_number = frame.channel;
        match frame.payload {
            FramePayload::Heartbeat => continue,
            FramePayload::Header(header) => {
                if let Some(publish) = &mut pending {
                    let body_size = header.body_size;
                    publish.header = Some(header);
                    if body_size == 0 {
                        let publish = pending.take().unwrap();
                        deliver(&mut framed, &state, &consumers, &mut delivery_tag, publish)
                            .await?;
                    }
                }
                continue;
            }
            FramePayload::Body(chunk) => {
                let complete = match &mut pending {
                    Some(publish) => {
                        publish.body.extend_from_slice(&chunk);
                        let expected = publish
                            .header
                            .as_ref()
                            .map(|header| header.body_size)
                            .unwrap_or_default();
                        publish.body.len() as u64 >= expected
                    }
                    None => false,
                };
                if complete {
                    let publish = pending.take().unwrap();
                    deliver(&mut framed, &state, &consumers, &mut delivery_tag, publish).await?;
                }
                continue;
            }
            FramePayload::Method(method) => match method {
                Method::ConnectionClose(_) => {
                    send(&mut framed, Frame::method(0, Method::ConnectionCloseOk)).await?;
                    return None;
                }
                Method::ConnectionCloseOk => return None,
                Method::ChannelOpen(_) => {
                    send(
                        &mut framed,
                        Frame::method(
                            channel_number,
                            Method::ChannelOpenOk(channel::OpenOk::default()),
                        ),
                    )
                    .await?;
                }
                Method::ChannelClose(_) => {
                    consumers
                        .values_mut()
                        .for_each(|list| list.retain(|(ch, _)| *ch != channel_number));
                    send(
                        &mut framed,
                        Frame::method(channel_number, Method::ChannelCloseOk),
                    )
                    .await?;
                }
                Method::ChannelCloseOk => {}
                Method::ExchangeDeclare(declare) => {
                    let exists = state.lock().exchange_exists(&declare.exchange);
                    if declare.passive && !exists {
                        close_channel_not_found(
                            &mut framed,
                            channel_number,
                            &format!("no exchange '{}'", declare.exchange),
                        )
                        .await?;
                        continue;
                    }
                    if !declare.passive {
                        state.lock().exchanges.insert(declare.exchange.clone(), ());
                    }
                    send(
                        &mut framed,
                        Frame::method(channel_number, Method::ExchangeDeclareOk),
                    )
                    .await?;
                }
                Method::ExchangeDelete(delete) => {
                    let mut state = state.lock();
                    state.exchanges.remove(&delete.exchange);
                    state.bindings.retain(|(source, _)| source != &delete.exchange);
                    drop(state);
                    send(
                        &mut framed,
                        Frame::method(channel_number, Method::ExchangeDeleteOk),
                    )
                    .await?;
                }
                Method::ExchangeBind(_) => {
                    send(
                        &mut framed,
                        Frame::method(channel_number, Method::ExchangeBindOk),
                    )
                    .await?;
                }
                Method::ExchangeUnbind(_) => {
                    send(
                        &mut framed,
                        Frame::method(channel_number, Method::ExchangeUnbindOk),
                    )
                    .await?;
                }
                Method::QueueDeclare(declare) => {
                    let mut locked = state.lock();
                    if declare.passive {
                        if !locked.queues.contains_key(&declare.queue) {
                            drop(locked);
                            close_channel_not_found(
                                &mut framed,
                                channel_number,
                                &format!("no queue '{}'", declare.queue),
                            )
                            .await?;
                            continue;
                        }
                        let name = declare.queue.clone();
                        drop(locked);
                        send(
                            &mut framed,
                            Frame::method(
                                channel_number,
                                Method::QueueDeclareOk(queue::DeclareOk {
                                    queue: name,
                                    message_count: 0,
                                    consumer_count: 0,
                                }),
                            ),
                        )
                        .await?;
                        continue;
                    }
                    let name = if declare.queue.is_empty() {
                        locked.name_counter += 1;
                        format!("amq.gen-{}", locked.name_counter)
                    } else {
                        declare.queue.clone()
                    };
                    locked.queues.insert(name.clone(), ());
                    drop(locked);
                    send(
                        &mut framed,
                        Frame::method(
                            channel_number,
                            Method::QueueDeclareOk(queue::DeclareOk {
                                queue: name,
                                message_count: 0,
                                consumer_count: 0,
                            }),
                        ),
                    )
                    .await?;
                }
                Method::QueueBind(bind) => {
                    state
                        .lock()
                        .bindings
                        .push((bind.exchange.clone(), bind.queue.clone()));
                    send(
                        &mut framed,
                        Frame::method(channel_number, Method::QueueBindOk),
                    )
                    .await?;
                }
                Method::QueueUnbind(unbind) => {
                    state
                        .lock()
                        .bindings
                        .retain(|(source, destination)| {
                            !(source == &unbind.exchange && destination == &unbind.queue)
                        });
                    send(
                        &mut framed,
                        Frame::method(channel_number, Method::QueueUnbindOk),
                    )
                    .await?;
                }
                Method::QueueDelete(delete) => {
                    let mut locked = state.lock();
                    locked.queues.remove(&delete.queue);
                    locked
                        .bindings
                        .retain(|(_, destination)| destination != &delete.queue);
                    drop(locked);
                    send(
                        &mut framed,
                        Frame::method(
                            channel_number,
                            Method::QueueDeleteOk(queue::DeleteOk { message_count: 0 }),
                        ),
                    )
                    .await?;
                }
                Method::BasicQos(_) => {
                    send(
                        &mut framed,
                        Frame::method(channel_number, Method::BasicQosOk),
                    )
                    .await?;
                }
                Method::BasicConsume(consume) => {
                    let tag = {
                        let mut locked = state.lock();
                        if consume.consumer_tag.is_empty() || options.reassign_consumer_tags {
                            locked.tag_counter += 1;
                            format!("ctag-{}", locked.tag_counter)
                        } else {
                            consume.consumer_tag.clone()
                        }
                    };
                    consumers
                        .entry(consume.queue.clone())
                        .or_default()
                        .push((channel_number, tag.clone()));
                    send(
                        &mut framed,
                        Frame::method(
                            channel_number,
                            Method::BasicConsumeOk(basic::ConsumeOk { consumer_tag: tag }),
                        ),
                    )
                    .await?;
                }
                Method::BasicCancel(cancel) => {
                    consumers
                        .values_mut()
                        .for_each(|list| list.retain(|(_, tag)| tag != &cancel.consumer_tag));
                    send(
                        &mut framed,
                        Frame::method(
                            channel_number,
                            Method::BasicCancelOk(basic::CancelOk {
                                consumer_tag: cancel.consumer_tag,
                            }),
                        ),
                    )
                    .await?;
                }
                Method::BasicPublish(publish) => {
                    pending = Some(PendingPublish {
                        channel: channel_number,
                        exchange: publish.exchange,
                        routing_key: publish.routing_key,
                        header: None,
                        body: BytesMut::new(),
                    });
                }
                Method::BasicAck(_) | Method::BasicNack(_) | Method::BasicReject(_) => {}
                other => panic!("test broker cannot handle {other:?}"),
            },
        }
    }
}

async fn deliver(
    framed: &mut Framed<TcpStream, FrameCodec>,
    state: &Arc<Mutex<BrokerState>>,
    consumers: &HashMap<String, Vec<(u16, String)>>,
    delivery_tag: &mut u64,
    publish: PendingPublish,
) -> Option<()> {
    let _ = publish.channel;
    let queues: Vec<String> = if publish.exchange.is_empty() {
        vec![publish.routing_key.clone()]
    } else {
        state
            .lock()
            .bindings
            .iter()
            .filter(|(source, _)| source == &publish.exchange)
            .map(|(_, destination)| destination.clone())
            .collect()
    };

    let properties = publish
        .header
        .map(|header| header.properties)
        .unwrap_or_default();
    let body: Bytes = publish.body.freeze();

    for queue in queues {
        let Some(list) = consumers.get(&queue) else {
            continue;
        };
        for (channel_number, tag) in list {
            *delivery_tag += 1;
            send(
                framed,
                Frame::method(
                    *channel_number,
                    Method::BasicDeliver(basic::Deliver {
                        consumer_tag: tag.clone(),
                        delivery_tag: *delivery_tag,
                        redelivered: false,
                        exchange: publish.exchange.clone(),
                        routing_key: publish.routing_key.clone(),
                    }),
                ),
            )
            .await?;
            send(
                framed,
                Frame::header(
                    *channel_number,
                    ContentHeader {
                        body_size: body.len() as u64,
                        properties: properties.clone(),
                    },
                ),
            )
            .await?;
            // stay within the client's negotiated frame-max
            let mut rest = body.clone();
            while !rest.is_empty() {
                let chunk = rest.split_to(rest.len().min(131_072 - 8));
                send(framed, Frame::body(*channel_number, chunk)).await?;
            }
        }
    }
    Some(())
}

async fn close_channel_not_found(
    framed: &mut Framed<TcpStream, FrameCodec>,
    channel_number: u16,
    text: &str,
) -> Option<()> {
    send(
        framed,
        Frame::method(
            channel_number,
            Method::ChannelClose(channel::Close {
                reply_code: 404,
                reply_text: format!("NOT_FOUND - {text}"),
                class_id: 0,
                method_id: 0,
            }),
        ),
    )
    .await
}

async fn send(framed: &mut Framed<TcpStream, FrameCodec>, frame: Frame) -> Option<()> {
    framed.send(frame).await.ok()
}

async fn recv(framed: &mut Framed<TcpStream, FrameCodec>) -> Option<Method> {
    loop {
        match framed.next().await?.ok()? {
            Frame {
                payload: FramePayload::Method(method),
                ..
            } => return Some(method),
            Frame {
                payload: FramePayload::Heartbeat,
                ..
            } => continue,
            other => panic!("unexpected frame during handshake: {other:?}"),
        }
    }
}

/// Poll until the condition holds or a generous deadline passes
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition did not hold in time");
}
