#![deny(missing_docs, missing_debug_implementations)]

//! Wire-level types for the AMQP 0-9-1 protocol.
//!
//! This crate defines the data carried inside AMQP frames: the field-table
//! primitives, the typed method definitions for each protocol class, and the
//! content header with its basic properties. Encoding and decoding operate
//! directly on [`bytes`] buffers; frame layout itself (type, channel, size,
//! frame-end) lives in the protocol crate.

pub mod definitions;
pub mod error;
pub mod methods;
pub mod primitives;
pub mod properties;

pub use error::{DecodeError, EncodeError};
pub use methods::Method;
pub use primitives::{FieldArray, FieldTable, FieldValue};
pub use properties::{BasicProperties, ContentHeader};
