//! Typed method definitions for each AMQP 0-9-1 class
//!
//! A [`Method`] is the payload of a method frame. Encoding writes the class
//! and method ids followed by the arguments; decoding dispatches on those
//! ids. Methods this implementation does not know decode to
//! [`DecodeError::UnknownMethod`], which the connection treats as a hard
//! protocol error.

use bytes::{Buf, Bytes, BytesMut};

use crate::definitions::{CLASS_BASIC, CLASS_CHANNEL, CLASS_CONNECTION, CLASS_EXCHANGE, CLASS_QUEUE};
use crate::error::{DecodeError, EncodeError};
use crate::primitives::ensure;

pub mod basic;
pub mod channel;
pub mod connection;
pub mod exchange;
pub mod queue;

/// A decoded AMQP method
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    /// connection.start
    ConnectionStart(connection::Start),
    /// connection.start-ok
    ConnectionStartOk(connection::StartOk),
    /// connection.secure
    ConnectionSecure(connection::Secure),
    /// connection.secure-ok
    ConnectionSecureOk(connection::SecureOk),
    /// connection.tune
    ConnectionTune(connection::Tune),
    /// connection.tune-ok
    ConnectionTuneOk(connection::TuneOk),
    /// connection.open
    ConnectionOpen(connection::Open),
    /// connection.open-ok
    ConnectionOpenOk(connection::OpenOk),
    /// connection.close
    ConnectionClose(connection::Close),
    /// connection.close-ok
    ConnectionCloseOk,
    /// connection.blocked
    ConnectionBlocked(connection::Blocked),
    /// connection.unblocked
    ConnectionUnblocked,
    /// channel.open
    ChannelOpen(channel::Open),
    /// channel.open-ok
    ChannelOpenOk(channel::OpenOk),
    /// channel.close
    ChannelClose(channel::Close),
    /// channel.close-ok
    ChannelCloseOk,
    /// exchange.declare
    ExchangeDeclare(exchange::Declare),
    /// exchange.declare-ok
    ExchangeDeclareOk,
    /// exchange.delete
    ExchangeDelete(exchange::Delete),
    /// exchange.delete-ok
    ExchangeDeleteOk,
    /// exchange.bind
    ExchangeBind(exchange::Bind),
    /// exchange.bind-ok
    ExchangeBindOk,
    /// exchange.unbind
    ExchangeUnbind(exchange::Unbind),
    /// exchange.unbind-ok
    ExchangeUnbindOk,
    /// queue.declare
    QueueDeclare(queue::Declare),
    /// queue.declare-ok
    QueueDeclareOk(queue::DeclareOk),
    /// queue.bind
    QueueBind(queue::Bind),
    /// queue.bind-ok
    QueueBindOk,
    /// queue.unbind
    QueueUnbind(queue::Unbind),
    /// queue.unbind-ok
    QueueUnbindOk,
    /// queue.delete
    QueueDelete(queue::Delete),
    /// queue.delete-ok
    QueueDeleteOk(queue::DeleteOk),
    /// basic.qos
    BasicQos(basic::Qos),
    /// basic.qos-ok
    BasicQosOk,
    /// basic.consume
    BasicConsume(basic::Consume),
    /// basic.consume-ok
    BasicConsumeOk(basic::ConsumeOk),
    /// basic.cancel
    BasicCancel(basic::Cancel),
    /// basic.cancel-ok
    BasicCancelOk(basic::CancelOk),
    /// basic.publish
    BasicPublish(basic::Publish),
    /// basic.return
    BasicReturn(basic::Return),
    /// basic.deliver
    BasicDeliver(basic::Deliver),
    /// basic.ack
    BasicAck(basic::Ack),
    /// basic.reject
    BasicReject(basic::Reject),
    /// basic.nack
    BasicNack(basic::Nack),
}

impl Method {
    /// The `(class_id, method_id)` pair identifying this method on the wire
    pub fn class_method(&self) -> (u16, u16) {
        match self {
            Method::ConnectionStart(_) => (CLASS_CONNECTION, 10),
            Method::ConnectionStartOk(_) => (CLASS_CONNECTION, 11),
            Method::ConnectionSecure(_) => (CLASS_CONNECTION, 20),
            Method::ConnectionSecureOk(_) => (CLASS_CONNECTION, 21),
            Method::ConnectionTune(_) => (CLASS_CONNECTION, 30),
            Method::ConnectionTuneOk(_) => (CLASS_CONNECTION, 31),
            Method::ConnectionOpen(_) => (CLASS_CONNECTION, 40),
            Method::ConnectionOpenOk(_) => (CLASS_CONNECTION, 41),
            Method::ConnectionClose(_) => (CLASS_CONNECTION, 50),
            Method::ConnectionCloseOk => (CLASS_CONNECTION, 51),
            Method::ConnectionBlocked(_) => (CLASS_CONNECTION, 60),
            Method::ConnectionUnblocked => (CLASS_CONNECTION, 61),
            Method::ChannelOpen(_) => (CLASS_CHANNEL, 10),
            Method::ChannelOpenOk(_) => (CLASS_CHANNEL, 11),
            Method::ChannelClose(_) => (CLASS_CHANNEL, 40),
            Method::ChannelCloseOk => (CLASS_CHANNEL, 41),
            Method::ExchangeDeclare(_) => (CLASS_EXCHANGE, 10),
            Method::ExchangeDeclareOk => (CLASS_EXCHANGE, 11),
            Method::ExchangeDelete(_) => (CLASS_EXCHANGE, 20),
            Method::ExchangeDeleteOk => (CLASS_EXCHANGE, 21),
            Method::ExchangeBind(_) => (CLASS_EXCHANGE, 30),
            Method::ExchangeBindOk => (CLASS_EXCHANGE, 31),
            Method::ExchangeUnbind(_) => (CLASS_EXCHANGE, 40),
            // The unbind-ok id is 51 rather than 41, per the RabbitMQ errata
            Method::ExchangeUnbindOk => (CLASS_EXCHANGE, 51),
            Method::QueueDeclare(_) => (CLASS_QUEUE, 10),
            Method::QueueDeclareOk(_) => (CLASS_QUEUE, 11),
            Method::QueueBind(_) => (CLASS_QUEUE, 20),
            Method::QueueBindOk => (CLASS_QUEUE, 21),
            Method::QueueUnbind(_) => (CLASS_QUEUE, 50),
            Method::QueueUnbindOk => (CLASS_QUEUE, 51),
            Method::QueueDelete(_) => (CLASS_QUEUE, 40),
            Method::QueueDeleteOk(_) => (CLASS_QUEUE, 41),
            Method::BasicQos(_) => (CLASS_BASIC, 10),
            Method::BasicQosOk => (CLASS_BASIC, 11),
            Method::BasicConsume(_) => (CLASS_BASIC, 20),
            Method::BasicConsumeOk(_) => (CLASS_BASIC, 21),
            Method::BasicCancel(_) => (CLASS_BASIC, 30),
            Method::BasicCancelOk(_) => (CLASS_BASIC, 31),
            Method::BasicPublish(_) => (CLASS_BASIC, 40),
            Method::BasicReturn(_) => (CLASS_BASIC, 50),
            Method::BasicDeliver(_) => (CLASS_BASIC, 60),
            Method::BasicAck(_) => (CLASS_BASIC, 80),
            Method::BasicReject(_) => (CLASS_BASIC, 90),
            Method::BasicNack(_) => (CLASS_BASIC, 120),
        }
    }

    /// Whether this method is followed by a content header and body
    pub fn has_content(&self) -> bool {
        matches!(
            self,
            Method::BasicPublish(_) | Method::BasicReturn(_) | Method::BasicDeliver(_)
        )
    }

    /// Encode the class id, method id and arguments
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        use bytes::BufMut;

        let (class_id, method_id) = self.class_method();
        dst.put_u16(class_id);
        dst.put_u16(method_id);
        match self {
            Method::ConnectionStart(m) => m.encode(dst),
            Method::ConnectionStartOk(m) => m.encode(dst),
            Method::ConnectionSecure(m) => m.encode(dst),
            Method::ConnectionSecureOk(m) => m.encode(dst),
            Method::ConnectionTune(m) => m.encode(dst),
            Method::ConnectionTuneOk(m) => m.encode(dst),
            Method::ConnectionOpen(m) => m.encode(dst),
            Method::ConnectionOpenOk(m) => m.encode(dst),
            Method::ConnectionClose(m) => m.encode(dst),
            Method::ConnectionBlocked(m) => m.encode(dst),
            Method::ChannelOpen(m) => m.encode(dst),
            Method::ChannelOpenOk(m) => m.encode(dst),
            Method::ChannelClose(m) => m.encode(dst),
            Method::ExchangeDeclare(m) => m.encode(dst),
            Method::ExchangeDelete(m) => m.encode(dst),
            Method::ExchangeBind(m) => m.encode(dst),
            Method::ExchangeUnbind(m) => m.encode(dst),
            Method::QueueDeclare(m) => m.encode(dst),
            Method::QueueDeclareOk(m) => m.encode(dst),
            Method::QueueBind(m) => m.encode(dst),
            Method::QueueUnbind(m) => m.encode(dst),
            Method::QueueDelete(m) => m.encode(dst),
            Method::QueueDeleteOk(m) => m.encode(dst),
            Method::BasicQos(m) => m.encode(dst),
            Method::BasicConsume(m) => m.encode(dst),
            Method::BasicConsumeOk(m) => m.encode(dst),
            Method::BasicCancel(m) => m.encode(dst),
            Method::BasicCancelOk(m) => m.encode(dst),
            Method::BasicPublish(m) => m.encode(dst),
            Method::BasicReturn(m) => m.encode(dst),
            Method::BasicDeliver(m) => m.encode(dst),
            Method::BasicAck(m) => m.encode(dst),
            Method::BasicReject(m) => m.encode(dst),
            Method::BasicNack(m) => m.encode(dst),
            // No arguments
            Method::ConnectionCloseOk
            | Method::ConnectionUnblocked
            | Method::ChannelCloseOk
            | Method::ExchangeDeclareOk
            | Method::ExchangeDeleteOk
            | Method::ExchangeBindOk
            | Method::ExchangeUnbindOk
            | Method::QueueBindOk
            | Method::QueueUnbindOk
            | Method::BasicQosOk => Ok(()),
        }
    }

    /// Decode a method payload
    pub fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 4)?;
        let class_id = src.get_u16();
        let method_id = src.get_u16();
        let method = match (class_id, method_id) {
            (CLASS_CONNECTION, 10) => Method::ConnectionStart(connection::Start::decode(src)?),
            (CLASS_CONNECTION, 11) => Method::ConnectionStartOk(connection::StartOk::decode(src)?),
            (CLASS_CONNECTION, 20) => Method::ConnectionSecure(connection::Secure::decode(src)?),
            (CLASS_CONNECTION, 21) => {
                Method::ConnectionSecureOk(connection::SecureOk::decode(src)?)
            }
            (CLASS_CONNECTION, 30) => Method::ConnectionTune(connection::Tune::decode(src)?),
            (CLASS_CONNECTION, 31) => Method::ConnectionTuneOk(connection::TuneOk::decode(src)?),
            (CLASS_CONNECTION, 40) => Method::ConnectionOpen(connection::Open::decode(src)?),
            (CLASS_CONNECTION, 41) => Method::ConnectionOpenOk(connection::OpenOk::decode(src)?),
            (CLASS_CONNECTION, 50) => Method::ConnectionClose(connection::Close::decode(src)?),
            (CLASS_CONNECTION, 51) => Method::ConnectionCloseOk,
            (CLASS_CONNECTION, 60) => Method::ConnectionBlocked(connection::Blocked::decode(src)?),
            (CLASS_CONNECTION, 61) => Method::ConnectionUnblocked,
            (CLASS_CHANNEL, 10) => Method::ChannelOpen(channel::Open::decode(src)?),
            (CLASS_CHANNEL, 11) => Method::ChannelOpenOk(channel::OpenOk::decode(src)?),
            (CLASS_CHANNEL, 40) => Method::ChannelClose(channel::Close::decode(src)?),
            (CLASS_CHANNEL, 41) => Method::ChannelCloseOk,
            (CLASS_EXCHANGE, 10) => Method::ExchangeDeclare(exchange::Declare::decode(src)?),
            (CLASS_EXCHANGE, 11) => Method::ExchangeDeclareOk,
            (CLASS_EXCHANGE, 20) => Method::ExchangeDelete(exchange::Delete::decode(src)?),
            (CLASS_EXCHANGE, 21) => Method::ExchangeDeleteOk,
            (CLASS_EXCHANGE, 30) => Method::ExchangeBind(exchange::Bind::decode(src)?),
            (CLASS_EXCHANGE, 31) => Method::ExchangeBindOk,
            (CLASS_EXCHANGE, 40) => Method::ExchangeUnbind(exchange::Unbind::decode(src)?),
            (CLASS_EXCHANGE, 51) => Method::ExchangeUnbindOk,
            (CLASS_QUEUE, 10) => Method::QueueDeclare(queue::Declare::decode(src)?),
            (CLASS_QUEUE, 11) => Method::QueueDeclareOk(queue::DeclareOk::decode(src)?),
            (CLASS_QUEUE, 20) => Method::QueueBind(queue::Bind::decode(src)?),
            (CLASS_QUEUE, 21) => Method::QueueBindOk,
            (CLASS_QUEUE, 50) => Method::QueueUnbind(queue::Unbind::decode(src)?),
            (CLASS_QUEUE, 51) => Method::QueueUnbindOk,
            (CLASS_QUEUE, 40) => Method::QueueDelete(queue::Delete::decode(src)?),
            (CLASS_QUEUE, 41) => Method::QueueDeleteOk(queue::DeleteOk::decode(src)?),
            (CLASS_BASIC, 10) => Method::BasicQos(basic::Qos::decode(src)?),
            (CLASS_BASIC, 11) => Method::BasicQosOk,
            (CLASS_BASIC, 20) => Method::BasicConsume(basic::Consume::decode(src)?),
            (CLASS_BASIC, 21) => Method::BasicConsumeOk(basic::ConsumeOk::decode(src)?),
            (CLASS_BASIC, 30) => Method::BasicCancel(basic::Cancel::decode(src)?),
            (CLASS_BASIC, 31) => Method::BasicCancelOk(basic::CancelOk::decode(src)?),
            (CLASS_BASIC, 40) => Method::BasicPublish(basic::Publish::decode(src)?),
            (CLASS_BASIC, 50) => Method::BasicReturn(basic::Return::decode(src)?),
            (CLASS_BASIC, 60) => Method::BasicDeliver(basic::Deliver::decode(src)?),
            (CLASS_BASIC, 80) => Method::BasicAck(basic::Ack::decode(src)?),
            (CLASS_BASIC, 90) => Method::BasicReject(basic::Reject::decode(src)?),
            (CLASS_BASIC, 120) => Method::BasicNack(basic::Nack::decode(src)?),
            (class_id, method_id) => {
                return Err(DecodeError::UnknownMethod {
                    class_id,
                    method_id,
                })
            }
        };
        Ok(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::FieldTable;

    #[test]
    fn method_round_trip() {
        let mut arguments = FieldTable::new();
        arguments.insert("x-expires", 30_000i32);
        let declare = Method::QueueDeclare(queue::Declare {
            queue: "inbox".into(),
            passive: false,
            durable: true,
            exclusive: false,
            auto_delete: true,
            no_wait: false,
            arguments,
        });

        let mut buf = BytesMut::new();
        declare.encode(&mut buf).unwrap();
        let decoded = Method::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, declare);
    }

    #[test]
    fn unknown_method_is_reported_with_ids() {
        let mut buf = BytesMut::new();
        {
            use bytes::BufMut;
            buf.put_u16(90);
            buf.put_u16(10);
        }
        match Method::decode(&mut buf.freeze()) {
            Err(DecodeError::UnknownMethod {
                class_id,
                method_id,
            }) => {
                assert_eq!((class_id, method_id), (90, 10));
            }
            other => panic!("expected UnknownMethod, got {other:?}"),
        }
    }

    #[test]
    fn content_bearing_methods() {
        let deliver = Method::BasicDeliver(basic::Deliver {
            consumer_tag: "ctag-1".into(),
            delivery_tag: 7,
            redelivered: false,
            exchange: "amq.topic".into(),
            routing_key: "a.b".into(),
        });
        assert!(deliver.has_content());
        assert!(!Method::BasicQosOk.has_content());
    }
}
