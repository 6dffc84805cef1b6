//! Low level frame transport
//!
//! Binds an async byte stream to the AMQP frame codec and layers the read
//! timeout on top: once a heartbeat is negotiated, the timeout is armed at
//! twice the heartbeat interval and reset on every inbound frame. A silent
//! peer therefore surfaces as [`Error::IdleTimeoutElapsed`] on the read
//! side.

use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use futures_util::{Future, Sink, Stream};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use siderite_amqp_types::definitions::PROTOCOL_HEADER;

use crate::frames::{Frame, FrameCodec};
use crate::util::IdleTimeout;

mod error;
pub use error::Error;

pin_project! {
    /// Frame transport over an async byte stream
    #[derive(Debug)]
    pub struct Transport<Io> {
        #[pin]
        framed_write: FramedWrite<WriteHalf<Io>, FrameCodec>,

        #[pin]
        framed_read: FramedRead<ReadHalf<Io>, FrameCodec>,

        #[pin]
        idle_timeout: Option<IdleTimeout>,
    }
}

impl<Io> Transport<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Bind to an IO with the given initial frame-max
    pub fn bind(io: Io, max_frame_size: usize) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let framed_write = FramedWrite::new(writer, FrameCodec::new(max_frame_size));
        let framed_read = FramedRead::new(reader, FrameCodec::new(max_frame_size));
        Self {
            framed_write,
            framed_read,
            idle_timeout: None,
        }
    }

    /// Write the literal 8-byte protocol header
    ///
    /// This is the only raw write on the wire; everything after it is
    /// framed.
    pub async fn send_protocol_header(&mut self) -> Result<(), Error> {
        let writer = self.framed_write.get_mut();
        writer.write_all(&PROTOCOL_HEADER).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Change the frame-max after tune negotiation
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) -> &mut Self {
        self.framed_write
            .encoder_mut()
            .set_max_frame_size(max_frame_size);
        self.framed_read
            .decoder_mut()
            .set_max_frame_size(max_frame_size);
        self
    }

    /// Arm or disarm the read timeout
    pub fn set_read_timeout(&mut self, duration: Option<Duration>) -> &mut Self {
        self.idle_timeout = duration
            .filter(|duration| !duration.is_zero())
            .map(IdleTimeout::new);
        self
    }
}

impl<Io> Sink<Frame> for Transport<Io>
where
    Io: AsyncWrite + Unpin,
{
    type Error = Error;

    fn poll_ready(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed_write.poll_ready(cx).map_err(Into::into)
    }

    fn start_send(self: std::pin::Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        let this = self.project();
        this.framed_write.start_send(item).map_err(Into::into)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed_write.poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.framed_write.poll_close(cx).map_err(Into::into)
    }
}

impl<Io> Stream for Transport<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<Frame, Error>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.framed_read.poll_next(cx) {
            Poll::Ready(next) => {
                if let Some(delay) = this.idle_timeout.get_mut() {
                    delay.reset();
                }
                Poll::Ready(next.map(|item| item.map_err(Into::into)))
            }
            Poll::Pending => {
                // check whether the peer has been silent for too long
                if let Some(delay) = this.idle_timeout.get_mut() {
                    if Pin::new(delay).poll(cx).is_ready() {
                        return Poll::Ready(Some(Err(Error::IdleTimeoutElapsed)));
                    }
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use siderite_amqp_types::methods::connection;
    use siderite_amqp_types::Method;

    use crate::frames::FramePayload;

    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = Transport::bind(client, 4096);
        let mut server = Transport::bind(server, 4096);

        client
            .send(Frame::method(
                0,
                Method::ConnectionOpen(connection::Open {
                    virtual_host: "/".into(),
                    capabilities: String::new(),
                    insist: false,
                }),
            ))
            .await
            .unwrap();

        let frame = server.next().await.unwrap().unwrap();
        match frame.payload {
            FramePayload::Method(Method::ConnectionOpen(open)) => {
                assert_eq!(open.virtual_host, "/");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_trips_the_read_timeout() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut client = Transport::bind(client, 4096);
        client.set_read_timeout(Some(Duration::from_secs(2)));

        match client.next().await {
            Some(Err(Error::IdleTimeoutElapsed)) => {}
            other => panic!("expected idle timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_answering_with_its_own_header_surfaces_the_version() {
        let mock = tokio_test::io::Builder::new()
            .write(b"AMQP\x00\x00\x09\x01")
            .read(b"AMQP\x00\x00\x08\x00")
            .build();
        let mut transport = Transport::bind(mock, 4096);
        transport.send_protocol_header().await.unwrap();

        match transport.next().await {
            Some(Err(Error::Framing(crate::frames::Error::ProtocolHeader {
                major,
                minor,
                revision,
            }))) => assert_eq!((major, minor, revision), (0, 8, 0)),
            other => panic!("expected a protocol header error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn protocol_header_is_the_raw_preamble() {
        let (client, server) = tokio::io::duplex(64);
        let mut client = Transport::bind(client, 4096);
        client.send_protocol_header().await.unwrap();
        drop(client);

        use tokio::io::AsyncReadExt;
        let mut server = server;
        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"AMQP\x00\x00\x09\x01");
    }
}
