#![deny(missing_docs, missing_debug_implementations)]

//! An AMQP 0-9-1 client with automatic connection and topology recovery,
//! based on tokio.
//!
//! The crate maintains a logical connection to a message broker across
//! transient network and broker failures. User handles stay valid across
//! socket loss: internally the client recycles the transport, renegotiates
//! the protocol and replays the recorded topology (exchanges, queues,
//! bindings and consumers), honouring server-assigned identities such as
//! server-named queues and consumer tags.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use siderite_amqp::{Connection, types::FieldTable};
//!
//! #[tokio::main]
//! async fn main() {
//!     // A recovering connection reconnects and replays topology on its own.
//!     let connection = Connection::builder()
//!         .endpoint("localhost", 5672)
//!         .plain_auth("guest", "guest")
//!         .open_recovering()
//!         .await
//!         .unwrap();
//!
//!     let channel = connection.create_channel().await.unwrap();
//!
//!     channel
//!         .queue_declare("inbox", Default::default(), FieldTable::new())
//!         .await
//!         .unwrap();
//!
//!     channel
//!         .basic_consume(
//!             "inbox",
//!             "",
//!             Default::default(),
//!             FieldTable::new(),
//!             |delivery| println!("{} bytes", delivery.body.len()),
//!         )
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! A plain [`Connection`] without recovery is available through
//! [`Builder::open`](connection::Builder::open); it exposes the same channel
//! API but shuts down permanently on the first failure.

pub(crate) mod control;
pub(crate) mod dispatch;
pub(crate) mod util;

pub mod channel;
pub mod connection;
pub mod error;
pub mod frames;
pub mod recovery;
pub mod sasl_profile;
pub mod session;
pub mod topology;
pub mod transport;

pub mod types {
    //! Re-exporting `siderite-amqp-types`
    pub use siderite_amqp_types::*;
}

pub use channel::{Channel, Delivery};
pub use connection::{Connection, ShutdownInitiator, ShutdownReason};
pub use error::Error;
pub use recovery::{RecoveringChannel, RecoveringConnection};

type Payload = bytes::Bytes;
