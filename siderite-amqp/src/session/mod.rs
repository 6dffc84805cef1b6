//! Per-channel sessions and the session table
//!
//! A [`Session`] is the engine-side state of one channel: it assembles
//! inbound frames into completed commands (method, optional content header,
//! body fragments until `body_size` octets arrived), holds the single-slot
//! RPC continuation, and owns the consumer registry feeding the dispatch
//! worker. The [`SessionTable`] maps channel numbers to sessions; channel
//! zero is reserved for the connection itself and never enters the table.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::BytesMut;
use siderite_amqp_types::{ContentHeader, Method};
use tokio::sync::oneshot;
use tracing::warn;

use crate::channel::Delivery;
use crate::connection::shutdown::ShutdownNotifier;
use crate::connection::ShutdownReason;
use crate::control::OpenedChannel;
use crate::dispatch::{ChannelWorker, DeliveryCallback};
use crate::error::Error;
use crate::Payload;

/// Channel states
///
/// Transitions are monotonic: `Opening → Open → Quiescing → Closed`, with
/// `Opening → Closed` and `Open → Closed` shortcuts when the peer or the
/// connection ends the channel abruptly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// channel.open sent, waiting for open-ok
    Opening,

    /// Fully open
    Open,

    /// A close is in flight; everything but the close handshake is ignored
    Quiescing,

    /// The close handshake finished or the connection went down
    Closed,
}

/// The pending reply slot of one synchronous call
pub(crate) enum Continuation {
    /// channel.open awaiting open-ok
    Open(oneshot::Sender<Result<OpenedChannel, Error>>),

    /// channel.close awaiting close-ok
    Close(oneshot::Sender<Result<(), Error>>),

    /// Any other synchronous method awaiting its -ok
    Rpc(oneshot::Sender<Result<Method, Error>>),

    /// basic.consume awaiting consume-ok; the callback is registered under
    /// the returned tag before the caller is released
    Consume {
        callback: DeliveryCallback,
        responder: oneshot::Sender<Result<String, Error>>,
    },
}

impl Continuation {
    /// Whether the caller stopped waiting, e.g. its RPC timed out
    pub(crate) fn is_abandoned(&self) -> bool {
        match self {
            Continuation::Open(tx) => tx.is_closed(),
            Continuation::Close(tx) => tx.is_closed(),
            Continuation::Rpc(tx) => tx.is_closed(),
            Continuation::Consume { responder, .. } => responder.is_closed(),
        }
    }

    pub(crate) fn fail(self, error: Error) {
        match self {
            Continuation::Open(tx) => {
                let _ = tx.send(Err(error));
            }
            Continuation::Close(tx) => {
                let _ = tx.send(Err(error));
            }
            Continuation::Rpc(tx) => {
                let _ = tx.send(Err(error));
            }
            Continuation::Consume { responder, .. } => {
                let _ = responder.send(Err(error));
            }
        }
    }
}

/// A write the engine owes the peer after processing an inbound command
#[derive(Debug)]
pub(crate) enum Reply {
    None,

    /// Send channel.close-ok, then free the session
    CloseOk,

    /// Send basic.cancel-ok for a server-initiated cancel
    CancelOk(String),

    /// Our channel.close completed; free the session, nothing to send
    Freed,
}

/// A channel-scoped protocol violation detected while assembling commands
#[derive(Debug)]
pub(crate) enum Violation {
    UnexpectedHeader,
    UnexpectedBody,
    UnexpectedMethod((u16, u16)),
}

impl Violation {
    pub(crate) fn reply_text(&self) -> String {
        match self {
            Violation::UnexpectedHeader => "unexpected content header".to_string(),
            Violation::UnexpectedBody => "unexpected content body".to_string(),
            Violation::UnexpectedMethod((class_id, method_id)) => {
                format!("unexpected method {class_id}.{method_id}")
            }
        }
    }
}

struct PartialContent {
    method: Method,
    header: Option<ContentHeader>,
    body: BytesMut,
}

pub(crate) struct Session {
    number: u16,
    state: ChannelState,
    shutdown: Arc<ShutdownNotifier>,
    continuation: Option<Continuation>,
    pending_content: Option<PartialContent>,
    consumers: HashMap<String, DeliveryCallback>,
    worker: Option<ChannelWorker>,
}

impl Session {
    pub fn new(number: u16, shutdown: Arc<ShutdownNotifier>, worker: ChannelWorker) -> Self {
        Self {
            number,
            state: ChannelState::Opening,
            shutdown,
            continuation: None,
            pending_content: None,
            consumers: HashMap::new(),
            worker: Some(worker),
        }
    }

    /// A replacement session that only answers the close handshake
    pub fn quiescing(number: u16, shutdown: Arc<ShutdownNotifier>) -> Self {
        Self {
            number,
            state: ChannelState::Quiescing,
            shutdown,
            continuation: None,
            pending_content: None,
            consumers: HashMap::new(),
            worker: None,
        }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn shutdown(&self) -> &Arc<ShutdownNotifier> {
        &self.shutdown
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, ChannelState::Opening | ChannelState::Open)
    }

    /// Occupy the single continuation slot
    ///
    /// A slot holding a continuation nobody awaits anymore, e.g. after an
    /// RPC timeout, counts as free.
    pub fn try_set_continuation(&mut self, continuation: Continuation) -> Result<(), Continuation> {
        if let Some(pending) = &self.continuation {
            if !pending.is_abandoned() {
                return Err(continuation);
            }
            self.continuation = None;
        }
        self.continuation = Some(continuation);
        Ok(())
    }

    /// Fail whatever is waiting in the continuation slot
    pub fn fail_continuation(&mut self, reason: &Arc<ShutdownReason>) {
        if let Some(continuation) = self.continuation.take() {
            continuation.fail(Error::AlreadyClosed(reason.clone()));
        }
    }

    /// Enter Quiescing on a locally initiated close
    ///
    /// Latches the channel's shutdown reason, fails the pending
    /// continuation and drops the in-flight content assembly.
    pub fn begin_quiesce(&mut self, reason: ShutdownReason) {
        self.shutdown.latch_and_notify(reason);
        if let Some(reason) = self.shutdown.reason() {
            self.fail_continuation(&reason);
        }
        self.pending_content = None;
        self.consumers.clear();
        self.state = ChannelState::Quiescing;
    }

    /// Terminal transition used when the connection itself goes down
    pub fn shut_down(&mut self, reason: &Arc<ShutdownReason>) {
        self.shutdown.latch_and_notify(reason.replicate());
        self.fail_continuation(reason);
        self.pending_content = None;
        self.consumers.clear();
        self.worker = None;
        self.state = ChannelState::Closed;
    }

    /// React to an inbound method on this channel
    pub fn on_method(&mut self, method: Method) -> Result<Reply, Violation> {
        if self.state == ChannelState::Quiescing {
            return Ok(match method {
                Method::ChannelCloseOk => {
                    self.state = ChannelState::Closed;
                    if let Some(Continuation::Close(tx)) = self.continuation.take() {
                        let _ = tx.send(Ok(()));
                    }
                    Reply::Freed
                }
                // both sides raced their close; answer and be done
                Method::ChannelClose(_) => {
                    self.state = ChannelState::Closed;
                    Reply::CloseOk
                }
                _ => Reply::None,
            });
        }

        if method.has_content() {
            if self.pending_content.is_some() {
                return Err(Violation::UnexpectedMethod(method.class_method()));
            }
            self.pending_content = Some(PartialContent {
                method,
                header: None,
                body: BytesMut::new(),
            });
            return Ok(Reply::None);
        }

        match method {
            Method::ChannelOpenOk(_) => {
                self.state = ChannelState::Open;
                if let Some(Continuation::Open(tx)) = self.continuation.take() {
                    let _ = tx.send(Ok(OpenedChannel {
                        number: self.number,
                        shutdown: self.shutdown.clone(),
                    }));
                }
                Ok(Reply::None)
            }
            Method::ChannelClose(close) => {
                let reason = ShutdownReason::peer(close.reply_code, close.reply_text);
                self.shutdown.latch_and_notify(reason);
                if let Some(reason) = self.shutdown.reason() {
                    self.fail_continuation(&reason);
                }
                self.pending_content = None;
                self.consumers.clear();
                self.state = ChannelState::Closed;
                Ok(Reply::CloseOk)
            }
            Method::BasicConsumeOk(ok) => {
                match self.continuation.take() {
                    Some(Continuation::Consume {
                        callback,
                        responder,
                    }) => {
                        self.consumers.insert(ok.consumer_tag.clone(), callback);
                        let _ = responder.send(Ok(ok.consumer_tag));
                    }
                    Some(other) => {
                        other.fail(Error::AlreadyClosed(Arc::new(ShutdownReason::library(
                            0,
                            "consume-ok without a pending consume",
                        ))));
                    }
                    None => warn!(channel = self.number, "unsolicited basic.consume-ok"),
                }
                Ok(Reply::None)
            }
            Method::BasicCancelOk(ok) => {
                self.consumers.remove(&ok.consumer_tag);
                let method = Method::BasicCancelOk(ok);
                if let Some(Continuation::Rpc(tx)) = self.continuation.take() {
                    let _ = tx.send(Ok(method));
                }
                Ok(Reply::None)
            }
            // server-side consumer cancel, e.g. the queue was deleted
            Method::BasicCancel(cancel) => {
                self.consumers.remove(&cancel.consumer_tag);
                if cancel.no_wait {
                    Ok(Reply::None)
                } else {
                    Ok(Reply::CancelOk(cancel.consumer_tag))
                }
            }
            // publisher confirms are not negotiated; discard
            Method::BasicAck(_) | Method::BasicNack(_) => Ok(Reply::None),
            method @ (Method::ExchangeDeclareOk
            | Method::ExchangeDeleteOk
            | Method::ExchangeBindOk
            | Method::ExchangeUnbindOk
            | Method::QueueDeclareOk(_)
            | Method::QueueBindOk
            | Method::QueueUnbindOk
            | Method::QueueDeleteOk(_)
            | Method::BasicQosOk) => {
                if let Some(Continuation::Rpc(tx)) = self.continuation.take() {
                    let _ = tx.send(Ok(method));
                } else {
                    warn!(channel = self.number, ids = ?method.class_method(), "reply without a pending RPC");
                }
                Ok(Reply::None)
            }
            other => Err(Violation::UnexpectedMethod(other.class_method())),
        }
    }

    /// React to an inbound content header on this channel
    pub fn on_header(&mut self, header: ContentHeader) -> Result<Reply, Violation> {
        if self.state == ChannelState::Quiescing {
            return Ok(Reply::None);
        }
        match &mut self.pending_content {
            Some(partial) if partial.header.is_none() => {
                let body_size = header.body_size;
                partial.header = Some(header);
                if body_size == 0 {
                    self.complete_content();
                }
                Ok(Reply::None)
            }
            _ => Err(Violation::UnexpectedHeader),
        }
    }

    /// React to an inbound content body fragment on this channel
    pub fn on_body(&mut self, fragment: Payload) -> Result<Reply, Violation> {
        if self.state == ChannelState::Quiescing {
            return Ok(Reply::None);
        }
        match &mut self.pending_content {
            Some(partial) if partial.header.is_some() => {
                partial.body.extend_from_slice(&fragment);
                let expected = partial
                    .header
                    .as_ref()
                    .map(|header| header.body_size)
                    .unwrap_or_default();
                if partial.body.len() as u64 >= expected {
                    self.complete_content();
                }
                Ok(Reply::None)
            }
            _ => Err(Violation::UnexpectedBody),
        }
    }

    fn complete_content(&mut self) {
        let Some(partial) = self.pending_content.take() else {
            return;
        };
        let header = partial.header.unwrap_or_default();
        match partial.method {
            Method::BasicDeliver(deliver) => {
                let callback = match self.consumers.get(&deliver.consumer_tag) {
                    Some(callback) => callback.clone(),
                    None => {
                        warn!(
                            channel = self.number,
                            consumer_tag = %deliver.consumer_tag,
                            "delivery for an unknown consumer"
                        );
                        return;
                    }
                };
                let delivery = Delivery {
                    consumer_tag: deliver.consumer_tag,
                    delivery_tag: deliver.delivery_tag,
                    redelivered: deliver.redelivered,
                    exchange: deliver.exchange,
                    routing_key: deliver.routing_key,
                    properties: header.properties,
                    body: partial.body.freeze(),
                };
                if let Some(worker) = &self.worker {
                    worker.dispatch(callback, delivery);
                }
            }
            Method::BasicReturn(ret) => {
                warn!(
                    channel = self.number,
                    reply_code = ret.reply_code,
                    exchange = %ret.exchange,
                    routing_key = %ret.routing_key,
                    "message returned as unroutable"
                );
            }
            other => {
                warn!(channel = self.number, ids = ?other.class_method(), "unhandled content command");
            }
        }
    }
}

/// The table of live sessions, keyed by channel number
///
/// Channel numbers run from 1 to the negotiated channel-max; zero is
/// permanently reserved for the connection. The engine task is the only
/// accessor, which serialises the table without a lock of its own.
pub(crate) struct SessionTable {
    channel_max: u16,
    sessions: BTreeMap<u16, Session>,
}

impl SessionTable {
    pub fn new(channel_max: u16) -> Self {
        Self {
            channel_max,
            sessions: BTreeMap::new(),
        }
    }

    /// Allocate the lowest free channel number
    pub fn allocate(
        &mut self,
        make: impl FnOnce(u16) -> Session,
    ) -> Result<u16, Error> {
        let number = (1..=self.channel_max)
            .find(|number| !self.sessions.contains_key(number))
            .ok_or(Error::ChannelExhausted)?;
        self.sessions.insert(number, make(number));
        Ok(number)
    }

    /// Allocate a specific channel number
    pub fn allocate_with(
        &mut self,
        number: u16,
        make: impl FnOnce(u16) -> Session,
    ) -> Result<u16, Error> {
        if number == 0 || number > self.channel_max || self.sessions.contains_key(&number) {
            return Err(Error::ChannelExhausted);
        }
        self.sessions.insert(number, make(number));
        Ok(number)
    }

    pub fn get_mut(&mut self, number: u16) -> Option<&mut Session> {
        self.sessions.get_mut(&number)
    }

    /// Atomically replace the session of a channel, returning the old one
    pub fn swap(&mut self, number: u16, replacement: Session) -> Option<Session> {
        self.sessions.insert(number, replacement)
    }

    pub fn free(&mut self, number: u16) -> Option<Session> {
        self.sessions.remove(&number)
    }

    /// Remove and return every session, lowest channel first
    pub fn drain(&mut self) -> Vec<Session> {
        let sessions = std::mem::take(&mut self.sessions);
        sessions.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::dispatch::{CallbackExceptionSink, WorkService};

    use super::*;

    fn session(number: u16) -> Session {
        let service = WorkService::new(1, CallbackExceptionSink::new());
        Session::new(number, Arc::new(ShutdownNotifier::new()), service.start_worker())
    }

    #[tokio::test]
    async fn allocation_picks_the_lowest_free_number() {
        let mut table = SessionTable::new(4);
        assert_eq!(table.allocate(session).unwrap(), 1);
        assert_eq!(table.allocate(session).unwrap(), 2);
        let freed = table.free(1).unwrap();
        assert_eq!(freed.number(), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.allocate(session).unwrap(), 1);
        assert_eq!(table.allocate(session).unwrap(), 3);
    }

    #[tokio::test]
    async fn exhaustion_is_reported() {
        let mut table = SessionTable::new(2);
        table.allocate(session).unwrap();
        table.allocate(session).unwrap();
        assert!(matches!(
            table.allocate(session),
            Err(Error::ChannelExhausted)
        ));
    }

    #[tokio::test]
    async fn targeted_allocation_rejects_zero_and_taken_numbers() {
        let mut table = SessionTable::new(8);
        assert!(table.allocate_with(0, session).is_err());
        assert_eq!(table.allocate_with(5, session).unwrap(), 5);
        assert!(table.allocate_with(5, session).is_err());
        // the lowest-free scan skips the targeted number
        assert_eq!(table.allocate(session).unwrap(), 1);
    }

    #[tokio::test]
    async fn quiescing_session_ignores_everything_but_the_close_handshake() {
        let mut s = session(7);
        s.begin_quiesce(ShutdownReason::application(200, "Goodbye"));

        let declare_ok = Method::ExchangeDeclareOk;
        assert!(matches!(s.on_method(declare_ok), Ok(Reply::None)));
        assert!(matches!(s.on_method(Method::ChannelCloseOk), Ok(Reply::Freed)));
        assert_eq!(s.state(), ChannelState::Closed);
    }
}
