//! Outbound delivery for Relay connections.
//!
//! The delivery engine never writes to sockets itself. Each connection hands
//! the engine an [`Outbound`] when it joins, and the engine pushes records
//! through it while holding the relay lock, so sends must never block.

use relay_protocol::Record;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Default number of records buffered per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Outbound delivery errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OutboundError {
    /// The connection is gone.
    #[error("Connection closed")]
    Closed,

    /// The connection is not draining its queue fast enough.
    #[error("Outbound queue full")]
    Full,
}

/// Capability to send a record to one connection.
pub trait Outbound: Send + Sync {
    /// Queue a record for delivery.
    ///
    /// Must not block. A failure evicts the connection.
    fn send(&self, record: &Record) -> Result<(), OutboundError>;
}

/// Outbound backed by a bounded tokio channel.
///
/// The connection's writer task owns the receiving half, encodes records and
/// writes them to the socket. Dropping the last `ChannelOutbound` closes the
/// channel, which tells the writer to shut the connection down.
#[derive(Debug, Clone)]
pub struct ChannelOutbound {
    sender: mpsc::Sender<Arc<Record>>,
}

impl ChannelOutbound {
    /// Create an outbound and the receiver its writer task drains.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Arc<Record>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl Outbound for ChannelOutbound {
    fn send(&self, record: &Record) -> Result<(), OutboundError> {
        self.sender
            .try_send(Arc::new(record.clone()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => OutboundError::Full,
                mpsc::error::TrySendError::Closed(_) => OutboundError::Closed,
            })
    }
}
