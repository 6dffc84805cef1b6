//! Connection-level integration tests against the in-process test broker

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use siderite_amqp::types::primitives::FieldTable;
use siderite_amqp::{Connection, Error};

use common::{eventually, TestBroker};

fn free_port() -> u16 {
    // bind and immediately drop so connecting gets refused quickly
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn open_negotiates_and_closes_gracefully() {
    let broker = TestBroker::start().await;
    let connection = Connection::builder()
        .endpoint("127.0.0.1", broker.port())
        .open()
        .await
        .unwrap();

    assert!(connection.is_open());
    assert_eq!(connection.channel_max(), 2047);
    assert_eq!(connection.frame_max(), 131_072);
    assert!(connection.server_properties().get("product").is_some());

    connection.close().await.unwrap();
    assert!(!connection.is_open());
    let reason = connection.shutdown_reason().unwrap();
    assert_eq!(reason.reply_code, 200);
}

#[tokio::test]
async fn second_close_reports_already_closed_but_abort_does_not() {
    let broker = TestBroker::start().await;
    let connection = Connection::builder()
        .endpoint("127.0.0.1", broker.port())
        .open()
        .await
        .unwrap();

    connection.close().await.unwrap();
    assert!(matches!(
        connection.close().await,
        Err(Error::AlreadyClosed(_))
    ));
    // abort suppresses the error entirely
    connection.abort().await;
}

#[tokio::test]
async fn unreachable_endpoints_are_skipped_in_order() {
    let broker = TestBroker::start().await;
    let connection = Connection::builder()
        .endpoint("127.0.0.1", free_port())
        .endpoint("127.0.0.1", free_port())
        .endpoint("127.0.0.1", broker.port())
        .open()
        .await
        .unwrap();

    assert_eq!(connection.endpoint().port, broker.port());
    connection.close().await.unwrap();
}

#[tokio::test]
async fn all_endpoints_unreachable_is_an_io_error() {
    let outcome = Connection::builder()
        .endpoint("127.0.0.1", free_port())
        .open()
        .await;
    assert!(matches!(
        outcome,
        Err(siderite_amqp::connection::OpenError::Io(_))
    ));
}

#[tokio::test]
async fn declare_consume_publish_delivers_in_order() {
    let broker = TestBroker::start().await;
    let connection = Connection::builder()
        .endpoint("127.0.0.1", broker.port())
        .open()
        .await
        .unwrap();
    let channel = connection.open_channel().await.unwrap();

    let ok = channel
        .queue_declare("inbox", Default::default(), FieldTable::new())
        .await
        .unwrap();
    assert_eq!(ok.queue, "inbox");

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let tag = channel
        .basic_consume(
            "inbox",
            "",
            Default::default(),
            FieldTable::new(),
            move |delivery| sink.lock().push(delivery.body.clone()),
        )
        .await
        .unwrap();
    assert!(!tag.is_empty());

    for n in 0..3u8 {
        channel
            .basic_publish("", "inbox", Default::default(), vec![n])
            .await
            .unwrap();
    }

    eventually(|| received.lock().len() == 3).await;
    let received = received.lock();
    assert_eq!(&*received, &[vec![0u8], vec![1], vec![2]]);

    connection.close().await.unwrap();
}

#[tokio::test]
async fn server_channel_close_is_scoped_to_that_channel() {
    let broker = TestBroker::start().await;
    let connection = Connection::builder()
        .endpoint("127.0.0.1", broker.port())
        .open()
        .await
        .unwrap();
    let channel = connection.open_channel().await.unwrap();

    // passive declare of a queue that does not exist: the broker closes
    // the channel with 404
    let options = siderite_amqp::channel::QueueDeclareOptions {
        passive: true,
        ..Default::default()
    };
    let outcome = channel
        .queue_declare("missing", options, FieldTable::new())
        .await;
    match outcome {
        Err(err @ Error::AlreadyClosed(_)) => assert_eq!(err.reply_code(), Some(404)),
        other => panic!("expected a 404 channel close, got {other:?}"),
    }
    eventually(|| !channel.is_open()).await;

    // the connection is untouched; a fresh channel works
    assert!(connection.is_open());
    let replacement = connection.open_channel().await.unwrap();
    replacement
        .queue_declare("present", Default::default(), FieldTable::new())
        .await
        .unwrap();

    connection.close().await.unwrap();
}

#[tokio::test]
async fn channel_close_makes_further_calls_fail() {
    let broker = TestBroker::start().await;
    let connection = Connection::builder()
        .endpoint("127.0.0.1", broker.port())
        .open()
        .await
        .unwrap();
    let channel = connection.open_channel().await.unwrap();

    channel.close().await.unwrap();
    assert!(!channel.is_open());
    assert!(matches!(
        channel
            .queue_declare("late", Default::default(), FieldTable::new())
            .await,
        Err(Error::AlreadyClosed(_))
    ));

    connection.close().await.unwrap();
}

#[tokio::test]
async fn connection_shutdown_observers_fire_exactly_once_and_cold() {
    let broker = TestBroker::start().await;
    let connection = Connection::builder()
        .endpoint("127.0.0.1", broker.port())
        .open()
        .await
        .unwrap();

    let observed = Arc::new(AtomicUsize::new(0));
    let counter = observed.clone();
    connection.on_shutdown(move |reason| {
        assert_eq!(reason.reply_code, 200);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    connection.close().await.unwrap();
    eventually(|| observed.load(Ordering::SeqCst) == 1).await;

    // cold subscription after the fact fires synchronously
    let cold = Arc::new(AtomicUsize::new(0));
    let counter = cold.clone();
    connection.on_shutdown(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(cold.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn killed_socket_surfaces_end_of_stream() {
    let broker = TestBroker::start().await;
    let connection = Connection::builder()
        .endpoint("127.0.0.1", broker.port())
        .open()
        .await
        .unwrap();

    broker.kill_connections();
    eventually(|| !connection.is_open()).await;

    let reason = connection.shutdown_reason().unwrap();
    assert_eq!(reason.reply_code, 0);
    assert_eq!(
        reason.initiator,
        siderite_amqp::ShutdownInitiator::Library
    );

    // user calls against the dead connection report the reason
    assert!(matches!(
        connection.open_channel().await,
        Err(Error::AlreadyClosed(_))
    ));
}

#[tokio::test]
async fn consume_survives_large_bodies_split_into_frames() {
    let broker = TestBroker::start().await;
    let connection = Connection::builder()
        .endpoint("127.0.0.1", broker.port())
        .open()
        .await
        .unwrap();
    let channel = connection.open_channel().await.unwrap();

    channel
        .queue_declare("bulk", Default::default(), FieldTable::new())
        .await
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    channel
        .basic_consume(
            "bulk",
            "",
            Default::default(),
            FieldTable::new(),
            move |delivery| sink.lock().push(delivery.body.len()),
        )
        .await
        .unwrap();

    // larger than one frame-max so the body crosses several body frames
    let body = vec![0xA5u8; 300_000];
    channel
        .basic_publish("", "bulk", Default::default(), body)
        .await
        .unwrap();

    eventually(|| received.lock().first() == Some(&300_000)).await;
    connection.close().await.unwrap();
}

#[tokio::test]
async fn channel_numbers_are_reused_after_close() {
    let broker = TestBroker::start().await;
    let connection = Connection::builder()
        .endpoint("127.0.0.1", broker.port())
        .open()
        .await
        .unwrap();

    let first = connection.open_channel().await.unwrap();
    let second = connection.open_channel().await.unwrap();
    assert_eq!(first.number(), 1);
    assert_eq!(second.number(), 2);

    first.close().await.unwrap();
    let third = connection.open_channel().await.unwrap();
    assert_eq!(third.number(), 1);

    let targeted = connection.open_channel_with(40).await.unwrap();
    assert_eq!(targeted.number(), 40);
    assert!(matches!(
        connection.open_channel_with(40).await,
        Err(Error::ChannelExhausted)
    ));

    connection.close().await.unwrap();
}

#[tokio::test]
async fn publish_after_close_is_rejected_with_timeout_config() {
    let broker = TestBroker::start().await;
    let connection = Connection::builder()
        .endpoint("127.0.0.1", broker.port())
        .continuation_timeout(Duration::from_secs(2))
        .open()
        .await
        .unwrap();
    let channel = connection.open_channel().await.unwrap();
    connection.close().await.unwrap();

    assert!(matches!(
        channel
            .basic_publish("", "inbox", Default::default(), b"late".as_slice())
            .await,
        Err(Error::AlreadyClosed(_))
    ));
}
