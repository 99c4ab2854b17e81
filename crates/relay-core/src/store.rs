//! Record store for Relay.
//!
//! The store is the authoritative, ordered collection of live records. It owns
//! the identifier counter and is mutated only by the delivery engine.

use relay_protocol::{Action, Record, RecordId};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::trace;

/// Default maximum number of live records.
pub const DEFAULT_MAX_RECORDS: usize = 100_000;

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store already holds its maximum number of records.
    #[error("Record store is full ({0} records)")]
    Full(usize),
}

/// Ordered collection of live records.
///
/// Identifiers are handed out in increasing order and records are only ever
/// appended, so iterating the map by key yields insertion order.
#[derive(Debug)]
pub struct RecordStore {
    records: BTreeMap<RecordId, Record>,
    next_id: u64,
    max_records: usize,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_RECORDS)
    }

    /// Create an empty store holding at most `max_records` records.
    #[must_use]
    pub fn with_capacity(max_records: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1,
            max_records,
        }
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Identifier the next created record will receive.
    #[must_use]
    pub fn next_id(&self) -> RecordId {
        RecordId(self.next_id)
    }

    /// Store a new record.
    ///
    /// Any identifier on `record` is discarded. The record gets the next
    /// identifier and is tagged `ADD`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Full`] if the store is at capacity.
    pub fn create(&mut self, mut record: Record) -> Result<&Record, StoreError> {
        if self.records.len() >= self.max_records {
            return Err(StoreError::Full(self.max_records));
        }

        let id = RecordId(self.next_id);
        self.next_id += 1;

        record.id = Some(id);
        record.action = Some(Action::Add);
        trace!(record = %id, "Created record");

        Ok(self.records.entry(id).or_insert(record))
    }

    /// Get a record by identifier.
    #[must_use]
    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.records.get(&id)
    }

    /// Merge `incoming` into the stored record and tag it `UPDATE`.
    ///
    /// Returns `None` if no record has this identifier.
    pub fn merge(&mut self, id: RecordId, incoming: &Record) -> Option<&Record> {
        let stored = self.records.get_mut(&id)?;
        stored.merge_from(incoming);
        stored.action = Some(Action::Update);
        trace!(record = %id, "Merged record");
        Some(stored)
    }

    /// Remove a record, returning its last content tagged `REMOVE`.
    pub fn remove(&mut self, id: RecordId) -> Option<Record> {
        let mut record = self.records.remove(&id)?;
        record.action = Some(Action::Remove);
        trace!(record = %id, "Removed record");
        Some(record)
    }

    /// Iterate over live records in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }
}
