//! The connection engine: handshake, main loop, heartbeats and shutdown
//!
//! A single task owns the transport and every session. All user calls
//! arrive as [`ConnectionControl`] messages, all broker traffic arrives as
//! frames; the event loop interleaves both with the two heartbeat timers.
//! The engine never runs user code inline: deliveries go through the
//! dispatch workers and shutdown observers run once, at the very end of the
//! loop.

use std::io;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use siderite_amqp_types::definitions::{hard_error, soft_error, REPLY_SUCCESS};
use siderite_amqp_types::methods::{basic, channel, connection};
use siderite_amqp_types::{ContentHeader, FieldTable, Method};

use std::sync::Arc;

use crate::control::ConnectionControl;
use crate::error::Error;
use crate::frames::{Frame, FramePayload};
use crate::sasl_profile::SaslProfile;
use crate::session::{Continuation, Reply, Session, SessionTable, Violation};
use crate::transport::{self, Transport};
use crate::util::Running;

use super::builder::ConnectionConfig;
use super::heartbeat::HeartBeat;
use super::shutdown::ShutdownNotifier;
use super::{BlockedSink, ConnectionState, ShutdownReason};

use crate::dispatch::WorkService;

/// How long to wait for the peer's close-ok after sending a close caused by
/// a protocol error
pub(crate) const ERROR_CLOSE_WAIT: Duration = Duration::from_secs(10);

/// Consecutive quarter-interval monitor ticks without traffic before the
/// peer counts as dead; eight quarters make two full heartbeat intervals
const MAX_MISSED_HEARTBEATS: u32 = 8;

/// Negotiate one tune parameter: zero means "no limit", so either side
/// offering zero yields the other side's value, otherwise the minimum wins
fn negotiate_u16(client: u16, server: u16) -> u16 {
    if client == 0 || server == 0 {
        client.max(server)
    } else {
        client.min(server)
    }
}

fn negotiate_u32(client: u32, server: u32) -> u32 {
    if client == 0 || server == 0 {
        client.max(server)
    } else {
        client.min(server)
    }
}

/// What the handshake produced
pub(crate) struct Handshake {
    pub server_properties: FieldTable,
    pub tune: connection::TuneOk,
}

fn client_properties(config: &ConnectionConfig) -> FieldTable {
    let mut capabilities = FieldTable::new();
    capabilities.insert("exchange_exchange_bindings", true);
    capabilities.insert("basic.nack", true);
    capabilities.insert("consumer_cancel_notify", true);
    capabilities.insert("connection.blocked", true);
    capabilities.insert("authentication_failure_close", true);

    let mut properties = FieldTable::new();
    properties.insert("product", "siderite-amqp");
    properties.insert("version", env!("CARGO_PKG_VERSION"));
    properties.insert("platform", "Rust");
    properties.insert("copyright", "the siderite-amqp contributors");
    properties.insert("information", "https://github.com/siderite-rs/siderite-amqp");
    properties.insert("capabilities", capabilities);
    if let Some(name) = &config.client_provided_name {
        properties.insert("connection_name", name.as_str());
    }
    for (key, value) in config.properties.iter() {
        properties.insert(key.as_str(), value.clone());
    }
    properties
}

async fn next_method<Io>(
    transport: &mut Transport<Io>,
    expecting: &'static str,
) -> Result<Method, super::OpenError>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match transport.next().await {
            Some(Ok(Frame {
                payload: FramePayload::Method(method),
                ..
            })) => return Ok(method),
            Some(Ok(Frame {
                payload: FramePayload::Heartbeat,
                ..
            })) => continue,
            Some(Ok(_)) => return Err(super::OpenError::IllegalFrame { expecting }),
            Some(Err(err)) => return Err(err.into()),
            None => {
                return Err(super::OpenError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed while waiting for {expecting}"),
                )))
            }
        }
    }
}

/// Run the AMQP 0-9-1 handshake on a freshly bound transport
///
/// Header exchange, start/start-ok with SASL mechanism selection, the
/// secure/secure-ok loop, tune/tune-ok negotiation and connection.open.
/// Must complete before the engine loop starts.
pub(crate) async fn handshake<Io>(
    transport: &mut Transport<Io>,
    config: &ConnectionConfig,
) -> Result<Handshake, super::OpenError>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    use super::OpenError;

    transport.send_protocol_header().await.map_err(OpenError::from)?;

    let start = match next_method(transport, "connection.start").await? {
        Method::ConnectionStart(start) => start,
        _ => return Err(OpenError::IllegalFrame {
            expecting: "connection.start",
        }),
    };
    if start.version_major != siderite_amqp_types::definitions::MAJOR
        || start.version_minor != siderite_amqp_types::definitions::MINOR
    {
        return Err(OpenError::ProtocolVersionMismatch {
            major: start.version_major,
            minor: start.version_minor,
        });
    }

    let profile = SaslProfile::select(&config.sasl_profiles, &start.mechanisms).ok_or_else(|| {
        OpenError::Io(io::Error::new(
            io::ErrorKind::Other,
            "No compatible authentication mechanism found",
        ))
    })?;

    let start_ok = connection::StartOk {
        client_properties: client_properties(config),
        mechanism: profile.mechanism().to_string(),
        response: profile.initial_response(),
        locale: "en_US".to_string(),
    };
    transport
        .send(Frame::method(0, Method::ConnectionStartOk(start_ok)))
        .await?;

    let tune = loop {
        match next_method(transport, "connection.tune").await? {
            Method::ConnectionSecure(secure) => {
                let secure_ok = connection::SecureOk {
                    response: profile.respond(&secure.challenge),
                };
                transport
                    .send(Frame::method(0, Method::ConnectionSecureOk(secure_ok)))
                    .await?;
            }
            Method::ConnectionTune(tune) => break tune,
            Method::ConnectionClose(close) => {
                let _ = transport
                    .send(Frame::method(0, Method::ConnectionCloseOk))
                    .await;
                return Err(if close.reply_code == soft_error::ACCESS_REFUSED {
                    OpenError::AuthenticationFailure {
                        reply_text: close.reply_text,
                    }
                } else {
                    OpenError::ServerClosed {
                        reply_code: close.reply_code,
                        reply_text: close.reply_text,
                    }
                });
            }
            _ => {
                return Err(OpenError::IllegalFrame {
                    expecting: "connection.tune",
                })
            }
        }
    };

    let negotiated = connection::TuneOk {
        channel_max: negotiate_u16(config.channel_max, tune.channel_max),
        frame_max: negotiate_u32(config.frame_max, tune.frame_max),
        heartbeat: negotiate_u16(config.heartbeat, tune.heartbeat),
    };
    transport
        .send(Frame::method(0, Method::ConnectionTuneOk(negotiated)))
        .await?;

    transport.set_max_frame_size(negotiated.frame_max as usize);
    if negotiated.heartbeat > 0 {
        // read timeout is twice the negotiated heartbeat
        transport.set_read_timeout(Some(Duration::from_secs(2 * negotiated.heartbeat as u64)));
    }

    let open = connection::Open {
        virtual_host: config.virtual_host.clone(),
        capabilities: String::new(),
        insist: config.insist,
    };
    transport
        .send(Frame::method(0, Method::ConnectionOpen(open)))
        .await?;

    loop {
        match next_method(transport, "connection.open-ok").await? {
            Method::ConnectionOpenOk(_) => break,
            Method::ConnectionClose(close) => {
                let _ = transport
                    .send(Frame::method(0, Method::ConnectionCloseOk))
                    .await;
                return Err(if close.reply_code == soft_error::ACCESS_REFUSED {
                    OpenError::AuthenticationFailure {
                        reply_text: close.reply_text,
                    }
                } else {
                    OpenError::ServerClosed {
                        reply_code: close.reply_code,
                        reply_text: close.reply_text,
                    }
                });
            }
            _ => {
                return Err(OpenError::IllegalFrame {
                    expecting: "connection.open-ok",
                })
            }
        }
    }

    Ok(Handshake {
        server_properties: start.server_properties,
        tune: negotiated,
    })
}

#[derive(Debug, thiserror::Error)]
enum InnerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("End of stream")]
    EndOfStream,

    #[error("Protocol error {reply_code}: {text}")]
    Hard { reply_code: u16, text: String },
}

impl From<transport::Error> for InnerError {
    fn from(err: transport::Error) -> Self {
        match err {
            transport::Error::Io(err) => Self::Io(err),
            transport::Error::IdleTimeoutElapsed => Self::EndOfStream,
            transport::Error::Framing(err) => Self::Hard {
                reply_code: hard_error::FRAME_ERROR,
                text: err.to_string(),
            },
        }
    }
}

pub(crate) struct ConnectionEngine<Io> {
    transport: Transport<Io>,
    sessions: SessionTable,
    control: mpsc::Receiver<ConnectionControl>,
    shutdown: Arc<ShutdownNotifier>,
    state: ConnectionState,
    work: WorkService,
    heartbeat: HeartBeat,
    monitor: HeartBeat,
    heartbeat_detected: bool,
    missed_heartbeats: u32,
    close_responder: Option<oneshot::Sender<Result<(), Error>>>,
    blocked: BlockedSink,
    max_body: usize,
}

impl<Io> ConnectionEngine<Io>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: Transport<Io>,
        tune: connection::TuneOk,
        control: mpsc::Receiver<ConnectionControl>,
        shutdown: Arc<ShutdownNotifier>,
        work: WorkService,
        blocked: BlockedSink,
    ) -> Self {
        let (heartbeat, monitor) = if tune.heartbeat > 0 {
            let interval = Duration::from_secs(tune.heartbeat as u64);
            (HeartBeat::quartered(interval), HeartBeat::quartered(interval))
        } else {
            (HeartBeat::never(), HeartBeat::never())
        };

        Self {
            transport,
            sessions: SessionTable::new(tune.channel_max),
            control,
            shutdown,
            state: ConnectionState::Open,
            work,
            heartbeat,
            monitor,
            heartbeat_detected: false,
            missed_heartbeats: 0,
            close_responder: None,
            blocked,
            max_body: (tune.frame_max as usize).saturating_sub(8).max(1),
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.event_loop())
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), InnerError> {
        self.transport.send(frame).await.map_err(Into::into)
    }

    #[inline]
    async fn on_incoming(&mut self, frame: Frame) -> Result<Running, InnerError> {
        self.heartbeat_detected = true;
        let Frame { channel, payload } = frame;
        match payload {
            FramePayload::Heartbeat => Ok(Running::Continue),
            payload if channel == 0 => self.on_channel_zero(payload).await,
            // quiescing: non-zero channels are silently dropped
            _ if self.shutdown.is_latched() => Ok(Running::Continue),
            payload => self.on_session_frame(channel, payload).await,
        }
    }

    async fn on_channel_zero(&mut self, payload: FramePayload) -> Result<Running, InnerError> {
        let method = match payload {
            FramePayload::Method(method) => method,
            FramePayload::Heartbeat => return Ok(Running::Continue),
            _ => {
                return Err(InnerError::Hard {
                    reply_code: hard_error::UNEXPECTED_FRAME,
                    text: "content frame on channel zero".to_string(),
                })
            }
        };
        trace!(channel = 0, ids = ?method.class_method(), "RECV");

        match method {
            Method::ConnectionClose(close) => {
                self.shutdown
                    .latch(ShutdownReason::peer(close.reply_code, close.reply_text));
                self.state = ConnectionState::Closed;
                let _ = self
                    .write_frame(Frame::method(0, Method::ConnectionCloseOk))
                    .await;
                Ok(Running::Stop)
            }
            // the close responder resolves in finish_close, after the
            // sessions are torn down
            Method::ConnectionCloseOk => {
                self.state = ConnectionState::Closed;
                Ok(Running::Stop)
            }
            Method::ConnectionBlocked(blocked) => {
                self.blocked.notify(Some(&blocked.reason));
                Ok(Running::Continue)
            }
            Method::ConnectionUnblocked => {
                self.blocked.notify(None);
                Ok(Running::Continue)
            }
            other => Err(InnerError::Hard {
                reply_code: hard_error::COMMAND_INVALID,
                text: format!(
                    "unexpected connection method {:?}",
                    other.class_method()
                ),
            }),
        }
    }

    async fn on_session_frame(
        &mut self,
        number: u16,
        payload: FramePayload,
    ) -> Result<Running, InnerError> {
        let Some(session) = self.sessions.get_mut(number) else {
            return Err(InnerError::Hard {
                reply_code: hard_error::CHANNEL_ERROR,
                text: format!("frame on unknown channel {number}"),
            });
        };

        let outcome = match payload {
            FramePayload::Method(method) => {
                trace!(channel = number, ids = ?method.class_method(), "RECV");
                session.on_method(method)
            }
            FramePayload::Header(header) => session.on_header(header),
            FramePayload::Body(body) => session.on_body(body),
            FramePayload::Heartbeat => Ok(Reply::None),
        };

        match outcome {
            Ok(Reply::None) => Ok(Running::Continue),
            Ok(Reply::CloseOk) => {
                self.sessions.free(number);
                self.write_frame(Frame::method(number, Method::ChannelCloseOk))
                    .await?;
                Ok(Running::Continue)
            }
            Ok(Reply::CancelOk(consumer_tag)) => {
                let cancel_ok = basic::CancelOk { consumer_tag };
                self.write_frame(Frame::method(number, Method::BasicCancelOk(cancel_ok)))
                    .await?;
                Ok(Running::Continue)
            }
            Ok(Reply::Freed) => {
                self.sessions.free(number);
                Ok(Running::Continue)
            }
            Err(violation) => self.soft_close_channel(number, violation).await,
        }
    }

    /// A channel-scoped protocol violation: swap in a quiescing session and
    /// close just that channel; the connection stays open
    async fn soft_close_channel(
        &mut self,
        number: u16,
        violation: Violation,
    ) -> Result<Running, InnerError> {
        let text = violation.reply_text();
        warn!(channel = number, text, "channel protocol violation");

        if let Some(mut old) = self.sessions.free(number) {
            old.begin_quiesce(ShutdownReason::library(
                hard_error::UNEXPECTED_FRAME,
                text.clone(),
            ));
            let replacement = Session::quiescing(number, old.shutdown().clone());
            self.sessions.swap(number, replacement);
        }

        let close = channel::Close {
            reply_code: hard_error::UNEXPECTED_FRAME,
            reply_text: text,
            class_id: 0,
            method_id: 0,
        };
        self.write_frame(Frame::method(number, Method::ChannelClose(close)))
            .await?;
        Ok(Running::Continue)
    }

    #[inline]
    async fn on_control(&mut self, control: ConnectionControl) -> Result<Running, InnerError> {
        debug!(?control, "control");
        match control {
            ConnectionControl::Close { reason, responder } => {
                if self.shutdown.is_latched() {
                    let existing = self.shutdown.reason();
                    if let Some(existing) = existing {
                        let _ = responder.send(Err(Error::AlreadyClosed(existing)));
                    }
                    return Ok(Running::Continue);
                }
                let close = connection::Close {
                    reply_code: reason.reply_code,
                    reply_text: reason.reply_text.clone(),
                    class_id: 0,
                    method_id: 0,
                };
                self.shutdown.latch(reason);
                self.state = ConnectionState::Quiescing;
                self.close_responder = Some(responder);
                self.write_frame(Frame::method(0, Method::ConnectionClose(close)))
                    .await?;
                Ok(Running::Continue)
            }
            ConnectionControl::Abort => {
                self.shutdown
                    .latch(ShutdownReason::application(REPLY_SUCCESS, "Connection aborted"));
                self.state = ConnectionState::Closed;
                Ok(Running::Stop)
            }
            ConnectionControl::OpenChannel { number, responder } => {
                if let Some(reason) = self.shutdown.reason() {
                    let _ = responder.send(Err(Error::AlreadyClosed(reason)));
                    return Ok(Running::Continue);
                }
                let shutdown = Arc::new(ShutdownNotifier::new());
                let worker = self.work.start_worker();
                let session_shutdown = shutdown.clone();
                let make = move |n| Session::new(n, session_shutdown, worker);
                let allocated = match number {
                    Some(number) => self.sessions.allocate_with(number, make),
                    None => self.sessions.allocate(make),
                };
                match allocated {
                    Ok(number) => {
                        if let Some(session) = self.sessions.get_mut(number) {
                            // the slot of a fresh session is always empty
                            let _ = session.try_set_continuation(Continuation::Open(responder));
                        }
                        self.write_frame(Frame::method(
                            number,
                            Method::ChannelOpen(channel::Open::default()),
                        ))
                        .await?;
                    }
                    Err(err) => {
                        let _ = responder.send(Err(err));
                    }
                }
                Ok(Running::Continue)
            }
            ConnectionControl::CloseChannel { number, responder } => {
                let quiesced = match self.sessions.get_mut(number) {
                    Some(session) => {
                        session.begin_quiesce(ShutdownReason::application(
                            REPLY_SUCCESS,
                            "Goodbye",
                        ));
                        match session.try_set_continuation(Continuation::Close(responder)) {
                            Ok(()) => true,
                            Err(rejected) => {
                                rejected.fail(Error::RpcInFlight);
                                false
                            }
                        }
                    }
                    None => {
                        // the channel is already gone; closing it again is a no-op
                        let _ = responder.send(Ok(()));
                        false
                    }
                };
                if quiesced {
                    let close = channel::Close {
                        reply_code: REPLY_SUCCESS,
                        reply_text: "Goodbye".to_string(),
                        class_id: 0,
                        method_id: 0,
                    };
                    self.write_frame(Frame::method(number, Method::ChannelClose(close)))
                        .await?;
                }
                Ok(Running::Continue)
            }
            ConnectionControl::Rpc {
                number,
                method,
                responder,
            } => {
                let reason = self.shutdown.reason();
                let accepted = match self.sessions.get_mut(number) {
                    Some(session) if session.is_open() => {
                        match session.try_set_continuation(Continuation::Rpc(responder)) {
                            Ok(()) => true,
                            Err(rejected) => {
                                rejected.fail(Error::RpcInFlight);
                                false
                            }
                        }
                    }
                    Some(session) => {
                        let reason = session
                            .shutdown()
                            .reason()
                            .unwrap_or_else(|| Arc::new(ShutdownReason::end_of_stream()));
                        let _ = responder.send(Err(Error::AlreadyClosed(reason)));
                        false
                    }
                    None => {
                        let reason = reason
                            .unwrap_or_else(|| Arc::new(ShutdownReason::end_of_stream()));
                        let _ = responder.send(Err(Error::AlreadyClosed(reason)));
                        false
                    }
                };
                if accepted {
                    trace!(channel = number, ids = ?method.class_method(), "SEND");
                    self.write_frame(Frame::method(number, method)).await?;
                }
                Ok(Running::Continue)
            }
            ConnectionControl::Send { number, method } => {
                let open = self
                    .sessions
                    .get_mut(number)
                    .map(|session| session.is_open())
                    .unwrap_or(false);
                if open {
                    trace!(channel = number, ids = ?method.class_method(), "SEND");
                    self.write_frame(Frame::method(number, method)).await?;
                } else {
                    trace!(channel = number, "dropping send on a closed channel");
                }
                Ok(Running::Continue)
            }
            ConnectionControl::Publish {
                number,
                method,
                properties,
                body,
            } => {
                let open = self
                    .sessions
                    .get_mut(number)
                    .map(|session| session.is_open())
                    .unwrap_or(false);
                if open {
                    trace!(
                        channel = number,
                        exchange = %method.exchange,
                        routing_key = %method.routing_key,
                        body_len = body.len(),
                        "SEND publish"
                    );
                    self.write_frame(Frame::method(number, Method::BasicPublish(method)))
                        .await?;
                    let header = ContentHeader {
                        body_size: body.len() as u64,
                        properties,
                    };
                    self.write_frame(Frame::header(number, header)).await?;
                    let mut rest = body;
                    while !rest.is_empty() {
                        let chunk = rest.split_to(rest.len().min(self.max_body));
                        self.write_frame(Frame::body(number, chunk)).await?;
                    }
                } else {
                    trace!(channel = number, "dropping publish on a closed channel");
                }
                Ok(Running::Continue)
            }
            ConnectionControl::Consume {
                number,
                method,
                callback,
                responder,
            } => {
                let accepted = match self.sessions.get_mut(number) {
                    Some(session) if session.is_open() => {
                        match session.try_set_continuation(Continuation::Consume {
                            callback,
                            responder,
                        }) {
                            Ok(()) => true,
                            Err(rejected) => {
                                rejected.fail(Error::RpcInFlight);
                                false
                            }
                        }
                    }
                    _ => {
                        let reason = self
                            .shutdown
                            .reason()
                            .unwrap_or_else(|| Arc::new(ShutdownReason::end_of_stream()));
                        let _ = responder.send(Err(Error::AlreadyClosed(reason)));
                        false
                    }
                };
                if accepted {
                    self.write_frame(Frame::method(number, Method::BasicConsume(method)))
                        .await?;
                }
                Ok(Running::Continue)
            }
        }
    }

    #[inline]
    async fn on_heartbeat(&mut self) -> Result<Running, InnerError> {
        if !matches!(self.state, ConnectionState::Open) || self.shutdown.is_latched() {
            return Ok(Running::Continue);
        }
        self.write_frame(Frame::heartbeat()).await?;
        Ok(Running::Continue)
    }

    #[inline]
    fn on_monitor(&mut self) -> Result<Running, InnerError> {
        if self.heartbeat_detected {
            self.heartbeat_detected = false;
            self.missed_heartbeats = 0;
            return Ok(Running::Continue);
        }
        self.missed_heartbeats += 1;
        if self.missed_heartbeats > MAX_MISSED_HEARTBEATS {
            Err(InnerError::EndOfStream)
        } else {
            Ok(Running::Continue)
        }
    }

    async fn on_error(&mut self, err: InnerError) -> Running {
        error!(%err, "connection failed");
        match err {
            InnerError::Io(err) => {
                self.shutdown
                    .latch(ShutdownReason::library(0, "End of stream").with_cause(err));
            }
            InnerError::EndOfStream => {
                self.shutdown.latch(ShutdownReason::end_of_stream());
            }
            InnerError::Hard { reply_code, text } => {
                self.shutdown
                    .latch(ShutdownReason::library(reply_code, text.clone()));
                self.state = ConnectionState::Quiescing;
                let close = connection::Close {
                    reply_code,
                    reply_text: text,
                    class_id: 0,
                    method_id: 0,
                };
                if self
                    .write_frame(Frame::method(0, Method::ConnectionClose(close)))
                    .await
                    .is_ok()
                {
                    self.drain_for_close_ok().await;
                }
            }
        }
        Running::Stop
    }

    /// After a locally detected hard error, give the peer a moment to
    /// answer our close before dropping the socket
    async fn drain_for_close_ok(&mut self) {
        let _ = tokio::time::timeout(ERROR_CLOSE_WAIT, async {
            loop {
                match self.transport.next().await {
                    Some(Ok(Frame {
                        channel: 0,
                        payload: FramePayload::Method(Method::ConnectionCloseOk),
                    })) => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => break,
                }
            }
        })
        .await;
    }

    async fn finish_close(mut self) {
        // terminal, idempotent: the latch may already hold the real reason
        self.shutdown.latch(ShutdownReason::end_of_stream());
        self.state = ConnectionState::Closed;

        if let Some(reason) = self.shutdown.reason() {
            for mut session in self.sessions.drain() {
                session.shut_down(&reason);
            }
        }
        if let Some(responder) = self.close_responder.take() {
            let _ = responder.send(Ok(()));
        }

        let _ = self.transport.close().await;

        // drain queued user calls so their responders resolve promptly
        self.control.close();
        while self.control.try_recv().is_ok() {}

        self.shutdown.notify();
        debug!("connection engine stopped");
    }

    pub(crate) async fn event_loop(mut self) {
        loop {
            let result = tokio::select! {
                incoming = self.transport.next() => match incoming {
                    Some(Ok(frame)) => self.on_incoming(frame).await,
                    Some(Err(err)) => Err(err.into()),
                    None => {
                        if self.shutdown.is_latched() {
                            Ok(Running::Stop)
                        } else {
                            Err(InnerError::EndOfStream)
                        }
                    }
                },
                control = self.control.recv() => match control {
                    Some(control) => self.on_control(control).await,
                    None => {
                        // every handle is gone; there is nobody left to serve
                        self.shutdown.latch(ShutdownReason::library(
                            REPLY_SUCCESS,
                            "Connection handle dropped",
                        ));
                        Ok(Running::Stop)
                    }
                },
                Some(_) = self.heartbeat.next() => self.on_heartbeat().await,
                Some(_) = self.monitor.next() => self.on_monitor(),
            };

            let running = match result {
                Ok(running) => running,
                Err(err) => self.on_error(err).await,
            };

            match running {
                Running::Continue => {}
                Running::Stop => break,
            }
        }

        self.finish_close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::{negotiate_u16, negotiate_u32};

    #[test]
    fn zero_means_take_the_other_side() {
        assert_eq!(negotiate_u16(0, 2047), 2047);
        assert_eq!(negotiate_u16(2047, 0), 2047);
        assert_eq!(negotiate_u16(0, 0), 0);
        assert_eq!(negotiate_u32(0, 131_072), 131_072);
    }

    #[test]
    fn otherwise_the_minimum_wins() {
        assert_eq!(negotiate_u16(2047, 1024), 1024);
        assert_eq!(negotiate_u16(256, 2047), 256);
        assert_eq!(negotiate_u32(131_072, 4096), 4096);
    }
}
