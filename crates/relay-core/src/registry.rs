//! Connection registry for Relay.
//!
//! Tracks the live connections and, for each one, the set of record ids it
//! has been sent an `ADD` for and not since been sent a `REMOVE` for.

use crate::outbound::{Outbound, OutboundError};
use relay_protocol::{Record, RecordId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Counter mixed into generated ids so two connections accepted within the
/// same nanosecond still differ.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A live connection: its sink and what it has been told.
struct ConnectionEntry {
    outbound: Arc<dyn Outbound>,
    known: HashSet<RecordId>,
}

/// Registry of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no live connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Check if a connection is live.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Register a connection with an empty knowledge set.
    ///
    /// Joining again under the same id replaces the sink and forgets
    /// everything the previous connection was told.
    pub fn join(&mut self, id: ConnectionId, outbound: Arc<dyn Outbound>) {
        debug!(connection = %id, "Connection joined registry");
        self.connections.insert(
            id,
            ConnectionEntry {
                outbound,
                known: HashSet::new(),
            },
        );
    }

    /// Remove a connection and its knowledge set.
    ///
    /// Returns `true` if the connection was live.
    pub fn leave(&mut self, id: &ConnectionId) -> bool {
        let removed = self.connections.remove(id).is_some();
        if removed {
            debug!(connection = %id, "Connection left registry");
        }
        removed
    }

    /// Whether the connection has been told about this record.
    #[must_use]
    pub fn knows(&self, id: &ConnectionId, record: RecordId) -> bool {
        self.connections
            .get(id)
            .is_some_and(|entry| entry.known.contains(&record))
    }

    /// Record that the connection has been sent an `ADD`.
    pub fn mark_known(&mut self, id: &ConnectionId, record: RecordId) {
        if let Some(entry) = self.connections.get_mut(id) {
            entry.known.insert(record);
        }
    }

    /// Record that the connection has been sent a `REMOVE`.
    pub fn mark_unknown(&mut self, id: &ConnectionId, record: RecordId) {
        if let Some(entry) = self.connections.get_mut(id) {
            entry.known.remove(&record);
        }
    }

    /// Total knowledge entries across all connections.
    #[must_use]
    pub fn total_known(&self) -> usize {
        self.connections.values().map(|entry| entry.known.len()).sum()
    }

    /// Send a record through the connection's sink.
    ///
    /// # Errors
    ///
    /// Returns [`OutboundError::Closed`] if the connection is not live, or
    /// whatever the sink reports.
    pub fn send(&self, id: &ConnectionId, record: &Record) -> Result<(), OutboundError> {
        match self.connections.get(id) {
            Some(entry) => entry.outbound.send(record),
            None => Err(OutboundError::Closed),
        }
    }

    /// Snapshot of all live connection ids.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().cloned().collect()
    }

    /// Snapshot of all live connection ids except `excluded`.
    #[must_use]
    pub fn ids_except(&self, excluded: &ConnectionId) -> Vec<ConnectionId> {
        self.connections
            .keys()
            .filter(|id| *id != excluded)
            .cloned()
            .collect()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .field("known", &self.total_known())
            .finish()
    }
}
