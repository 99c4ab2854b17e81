//! # relay-protocol
//!
//! Wire protocol definitions for the Relay broadcast server.
//!
//! This crate defines the record exchanged between clients and the relay and
//! the codecs that turn records into WebSocket payloads.
//!
//! ## Record Shape
//!
//! - `id` - Server-assigned identifier, absent before creation
//! - `action` - `ADD`, `UPDATE` or `REMOVE`
//! - `scope` - `PUBLIC` or `PRIVATE`
//! - any other key - caller-defined, passed through untouched
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Record, Scope, WireFormat};
//!
//! let record = Record::add(Scope::Public).with_field("text", "hi");
//!
//! let encoded = codec::encode(&record, WireFormat::Json).unwrap();
//! let decoded = codec::decode(&encoded, WireFormat::Json).unwrap();
//! assert_eq!(record, decoded);
//! ```

pub mod codec;
pub mod record;

pub use codec::{
    decode, encode, encoded_len, ProtocolError, RecordCodec, WireFormat, MAX_RECORD_SIZE,
};
pub use record::{Action, Record, RecordId, Scope};
