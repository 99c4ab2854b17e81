//! Codec for encoding and decoding Relay records.
//!
//! Records travel as one record per WebSocket message, so there is no length
//! prefix. Text frames carry JSON; binary frames carry MessagePack with named
//! fields so both encodings share the same map shape.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use thiserror::Error;

use crate::record::Record;

/// Maximum encoded record size (1 MiB).
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Record exceeds maximum size.
    #[error("Record size {0} exceeds maximum {1}")]
    RecordTooLarge(usize, usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encoding used for a record on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// UTF-8 JSON, sent as text frames.
    #[default]
    Json,
    /// MessagePack, sent as binary frames.
    Msgpack,
}

impl WireFormat {
    /// Name of the format as used in configuration and query strings.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::Msgpack => "msgpack",
        }
    }

    /// Whether records in this format are sent as text frames.
    #[must_use]
    pub const fn is_text(self) -> bool {
        matches!(self, WireFormat::Json)
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(WireFormat::Json),
            "msgpack" => Ok(WireFormat::Msgpack),
            other => Err(format!("Unknown wire format: {other}")),
        }
    }
}

/// Encode a record.
///
/// # Errors
///
/// Returns an error if the record is too large or encoding fails.
pub fn encode(record: &Record, format: WireFormat) -> Result<Bytes, ProtocolError> {
    let payload = match format {
        WireFormat::Json => serde_json::to_vec(record)?,
        WireFormat::Msgpack => rmp_serde::to_vec_named(record)?,
    };

    if payload.len() > MAX_RECORD_SIZE {
        return Err(ProtocolError::RecordTooLarge(payload.len(), MAX_RECORD_SIZE));
    }

    Ok(Bytes::from(payload))
}

/// Writer that only counts bytes.
#[derive(Default)]
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Size of a record once encoded, without allocating the payload.
///
/// # Errors
///
/// Returns an error if the record cannot be encoded.
pub fn encoded_len(record: &Record, format: WireFormat) -> Result<usize, ProtocolError> {
    let mut counter = ByteCounter::default();
    match format {
        WireFormat::Json => serde_json::to_writer(&mut counter, record)?,
        WireFormat::Msgpack => rmp_serde::encode::write_named(&mut counter, record)?,
    }
    Ok(counter.0)
}

/// Decode a record.
///
/// Fails only when the payload is not a structured map; unknown or missing
/// `id`, `action` and `scope` values decode as undefined.
///
/// # Errors
///
/// Returns an error if the data is too large or not a record.
pub fn decode(data: &[u8], format: WireFormat) -> Result<Record, ProtocolError> {
    if data.len() > MAX_RECORD_SIZE {
        return Err(ProtocolError::RecordTooLarge(data.len(), MAX_RECORD_SIZE));
    }

    let record = match format {
        WireFormat::Json => serde_json::from_slice(data)?,
        WireFormat::Msgpack => rmp_serde::from_slice(data)?,
    };
    Ok(record)
}

/// Record codec bound to a fixed outbound format and size limit.
#[derive(Debug, Clone, Copy)]
pub struct RecordCodec {
    format: WireFormat,
    max_size: usize,
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new(WireFormat::Json)
    }
}

impl RecordCodec {
    /// Create a codec for the given format.
    #[must_use]
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            max_size: MAX_RECORD_SIZE,
        }
    }

    /// Lower the size limit. Values above [`MAX_RECORD_SIZE`] are clamped.
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.min(MAX_RECORD_SIZE);
        self
    }

    /// Outbound format of this codec.
    #[must_use]
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode a record in this codec's format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the result exceeds the limit.
    pub fn encode(&self, record: &Record) -> Result<Bytes, ProtocolError> {
        let data = encode(record, self.format)?;
        if data.len() > self.max_size {
            return Err(ProtocolError::RecordTooLarge(data.len(), self.max_size));
        }
        Ok(data)
    }

    /// Encode a record as JSON text, whatever this codec's format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the result exceeds the limit.
    pub fn encode_text(&self, record: &Record) -> Result<String, ProtocolError> {
        let text = serde_json::to_string(record)?;
        if text.len() > self.max_size {
            return Err(ProtocolError::RecordTooLarge(text.len(), self.max_size));
        }
        Ok(text)
    }

    /// Decode a record received in the given format.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload exceeds the limit or is not a record.
    pub fn decode(&self, data: &[u8], format: WireFormat) -> Result<Record, ProtocolError> {
        if data.len() > self.max_size {
            return Err(ProtocolError::RecordTooLarge(data.len(), self.max_size));
        }
        decode(data, format)
    }
}
