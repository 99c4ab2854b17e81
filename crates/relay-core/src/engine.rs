//! Delivery engine for Relay.
//!
//! The engine applies `ADD`, `UPDATE` and `REMOVE` actions to the record store
//! and decides, per connection, what to deliver. Every entry point runs under
//! a single lock covering the store mutation, the scope-transition check and
//! the whole fan-out, so operations are totally ordered.

use crate::outbound::Outbound;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::store::{RecordStore, DEFAULT_MAX_RECORDS};
use parking_lot::Mutex;
use relay_protocol::{encoded_len, Action, Record, RecordId, Scope, WireFormat, MAX_RECORD_SIZE};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Default maximum number of live connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Errors returned when registering a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    /// The relay already holds the maximum number of connections.
    #[error("Connection limit reached ({0})")]
    Full(usize),
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum number of live records.
    pub max_records: usize,
    /// Maximum number of live connections.
    pub max_connections: usize,
    /// Largest encoded size, in either wire format, a stored record may reach.
    /// Clamped to [`MAX_RECORD_SIZE`].
    pub max_record_size: usize,
    /// Whether an `UPDATE` to a record that stays public is also sent to
    /// every other connection that knows it. When `false`, only the origin
    /// sees the update unless the scope flips.
    pub broadcast_public_updates: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_record_size: MAX_RECORD_SIZE,
            broadcast_public_updates: false,
        }
    }
}

/// Scope change caused by an `UPDATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeTransition {
    /// Scope did not flip between public and private.
    Unchanged,
    /// `PUBLIC` to `PRIVATE`: other connections receive a `REMOVE`.
    BecamePrivate,
    /// `PRIVATE` to `PUBLIC`: other connections receive an `ADD`.
    BecamePublic,
}

impl ScopeTransition {
    /// Classify the change from the stored scope to the incoming one.
    #[must_use]
    pub fn between(stored: Option<Scope>, incoming: Option<Scope>) -> Self {
        match (stored, incoming) {
            (Some(Scope::Public), Some(Scope::Private)) => ScopeTransition::BecamePrivate,
            (Some(Scope::Private), Some(Scope::Public)) => ScopeTransition::BecamePublic,
            _ => ScopeTransition::Unchanged,
        }
    }
}

/// Why an action had no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The record carried no recognised action.
    UndefinedAction,
    /// `UPDATE` or `REMOVE` without an identifier.
    MissingId,
    /// `UPDATE` or `REMOVE` for an identifier not in the store.
    UnknownRecord,
    /// `ADD` while the store is at capacity.
    StoreFull,
    /// The resulting record would be too large to send.
    RecordTooLarge,
}

/// What an applied action did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A record was created.
    Created(RecordId),
    /// A record was merged.
    Updated {
        /// Updated record.
        id: RecordId,
        /// Scope change caused by the update.
        transition: ScopeTransition,
    },
    /// A record was removed.
    Removed(RecordId),
    /// Nothing happened.
    Ignored(IgnoreReason),
}

/// Messages sent during one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Number of records handed to outbound sinks.
    pub delivered: usize,
    /// Connections evicted because their sink failed.
    pub evicted: Vec<ConnectionId>,
}

/// Result of [`Relay::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// Effect on the store.
    pub outcome: Outcome,
    /// Messages sent.
    pub delivery: Delivery,
}

impl ApplyReport {
    fn ignored(reason: IgnoreReason) -> Self {
        Self {
            outcome: Outcome::Ignored(reason),
            delivery: Delivery::default(),
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Number of live records.
    pub records: usize,
    /// Number of live connections.
    pub connections: usize,
    /// Total knowledge entries across connections.
    pub known: usize,
}

/// How a successful send changes the connection's knowledge set.
enum Knowledge {
    Gain,
    Keep,
    Lose,
}

/// Whether a record can be encoded within `limit` bytes in every wire format.
fn fits(record: &Record, limit: usize) -> bool {
    [WireFormat::Json, WireFormat::Msgpack]
        .into_iter()
        .all(|format| encoded_len(record, format).is_ok_and(|len| len <= limit))
}

/// Store and registry, always locked together.
#[derive(Debug)]
struct RelayState {
    store: RecordStore,
    registry: ConnectionRegistry,
    max_record_size: usize,
}

impl RelayState {
    /// Apply the per-connection send rule for one record.
    fn deliver(&mut self, connection: &ConnectionId, record: &Record, delivery: &mut Delivery) {
        let (Some(id), Some(action)) = (record.id, record.action) else {
            return;
        };
        if !self.registry.contains(connection) {
            return;
        }

        let knowledge = match (self.registry.knows(connection, id), action) {
            (false, Action::Add) => Knowledge::Gain,
            (true, Action::Update) => Knowledge::Keep,
            (true, Action::Remove) => Knowledge::Lose,
            (true, Action::Add) => {
                trace!(connection = %connection, record = %id, "Already delivered");
                return;
            }
            (false, Action::Update | Action::Remove) => {
                trace!(
                    connection = %connection,
                    record = %id,
                    action = %action,
                    "Suppressed mutation for unknown record"
                );
                return;
            }
        };

        match self.registry.send(connection, record) {
            Ok(()) => {
                delivery.delivered += 1;
                match knowledge {
                    Knowledge::Gain => self.registry.mark_known(connection, id),
                    Knowledge::Lose => self.registry.mark_unknown(connection, id),
                    Knowledge::Keep => {}
                }
            }
            Err(e) => {
                warn!(
                    connection = %connection,
                    record = %id,
                    error = %e,
                    "Send failed, evicting connection"
                );
                self.registry.leave(connection);
                delivery.evicted.push(connection.clone());
            }
        }
    }

    fn fan_out(&mut self, targets: &[ConnectionId], record: &Record, delivery: &mut Delivery) {
        for connection in targets {
            self.deliver(connection, record, delivery);
        }
    }

    fn add(&mut self, origin: &ConnectionId, mut incoming: Record) -> ApplyReport {
        incoming.id = Some(self.store.next_id());
        incoming.action = Some(Action::Add);
        if !fits(&incoming, self.max_record_size) {
            warn!(
                connection = %origin,
                limit = self.max_record_size,
                "Rejected oversized record"
            );
            return ApplyReport::ignored(IgnoreReason::RecordTooLarge);
        }

        let record = match self.store.create(incoming) {
            Ok(record) => record.clone(),
            Err(e) => {
                warn!(connection = %origin, error = %e, "Rejected record");
                return ApplyReport::ignored(IgnoreReason::StoreFull);
            }
        };
        let Some(id) = record.id else {
            return ApplyReport::ignored(IgnoreReason::MissingId);
        };

        let targets = if record.is_public() {
            self.registry.ids()
        } else {
            vec![origin.clone()]
        };

        let mut delivery = Delivery::default();
        self.fan_out(&targets, &record, &mut delivery);

        ApplyReport {
            outcome: Outcome::Created(id),
            delivery,
        }
    }

    fn update(
        &mut self,
        origin: &ConnectionId,
        incoming: &Record,
        broadcast_public_updates: bool,
    ) -> ApplyReport {
        let Some(id) = incoming.id else {
            return ApplyReport::ignored(IgnoreReason::MissingId);
        };
        let Some(stored) = self.store.get(id) else {
            return ApplyReport::ignored(IgnoreReason::UnknownRecord);
        };

        let transition = ScopeTransition::between(stored.scope, incoming.scope);
        let stays_public = stored.is_public() && transition == ScopeTransition::Unchanged;

        let mut candidate = stored.tagged(Action::Update);
        candidate.merge_from(incoming);
        if !fits(&candidate, self.max_record_size) {
            warn!(
                connection = %origin,
                record = %id,
                limit = self.max_record_size,
                "Rejected update, merged record too large"
            );
            return ApplyReport::ignored(IgnoreReason::RecordTooLarge);
        }

        if self.store.merge(id, incoming).is_none() {
            return ApplyReport::ignored(IgnoreReason::UnknownRecord);
        }
        let merged = candidate;

        let mut delivery = Delivery::default();
        self.deliver(origin, &merged, &mut delivery);

        let others = self.registry.ids_except(origin);
        match transition {
            ScopeTransition::BecamePrivate => {
                self.fan_out(&others, &merged.tagged(Action::Remove), &mut delivery);
            }
            ScopeTransition::BecamePublic => {
                self.fan_out(&others, &merged.tagged(Action::Add), &mut delivery);
            }
            ScopeTransition::Unchanged if stays_public && broadcast_public_updates => {
                self.fan_out(&others, &merged, &mut delivery);
            }
            ScopeTransition::Unchanged => {}
        }

        ApplyReport {
            outcome: Outcome::Updated { id, transition },
            delivery,
        }
    }

    fn remove(&mut self, incoming: &Record) -> ApplyReport {
        let Some(id) = incoming.id else {
            return ApplyReport::ignored(IgnoreReason::MissingId);
        };
        let Some(removed) = self.store.remove(id) else {
            return ApplyReport::ignored(IgnoreReason::UnknownRecord);
        };

        let targets = self.registry.ids();
        let mut delivery = Delivery::default();
        self.fan_out(&targets, &removed, &mut delivery);

        ApplyReport {
            outcome: Outcome::Removed(id),
            delivery,
        }
    }
}

/// The record relay.
///
/// Owns the record store and the connection registry. Construct one per
/// server and share it behind an `Arc`.
pub struct Relay {
    state: Mutex<RelayState>,
    config: RelayConfig,
}

impl Relay {
    /// Create a new relay with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RelayConfig::default())
    }

    /// Create a new relay with custom configuration.
    #[must_use]
    pub fn with_config(config: RelayConfig) -> Self {
        info!("Creating relay with config: {:?}", config);
        Self {
            state: Mutex::new(RelayState {
                store: RecordStore::with_capacity(config.max_records),
                registry: ConnectionRegistry::new(),
                max_record_size: config.max_record_size.min(MAX_RECORD_SIZE),
            }),
            config,
        }
    }

    /// Get the relay configuration.
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Register a connection and replay the current records to it.
    ///
    /// Every live record is offered as an `ADD`, in insertion order and
    /// regardless of scope. A bounded outbound smaller than the store evicts
    /// the joiner part-way through the replay; see [`Relay::join_with`].
    ///
    /// # Errors
    ///
    /// Returns [`JoinError::Full`] if the connection limit is reached.
    pub fn join(
        &self,
        connection: ConnectionId,
        outbound: Arc<dyn Outbound>,
    ) -> Result<Delivery, JoinError> {
        self.join_with(connection, |_| (outbound, ()))
            .map(|(delivery, ())| delivery)
    }

    /// Register a connection whose outbound is built for the replay size.
    ///
    /// `make_outbound` runs under the relay lock with the number of records
    /// about to be replayed, so a queue sized from it cannot overflow during
    /// the replay. Whatever else it returns is handed back to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`JoinError::Full`] if the connection limit is reached;
    /// `make_outbound` is not called.
    pub fn join_with<T, F>(
        &self,
        connection: ConnectionId,
        make_outbound: F,
    ) -> Result<(Delivery, T), JoinError>
    where
        F: FnOnce(usize) -> (Arc<dyn Outbound>, T),
    {
        let mut state = self.state.lock();
        if !state.registry.contains(&connection)
            && state.registry.len() >= self.config.max_connections
        {
            return Err(JoinError::Full(self.config.max_connections));
        }

        let (outbound, extra) = make_outbound(state.store.len());
        state.registry.join(connection.clone(), outbound);

        let replay: Vec<Record> = state
            .store
            .values()
            .map(|record| record.tagged(Action::Add))
            .collect();

        let mut delivery = Delivery::default();
        for record in &replay {
            state.deliver(&connection, record, &mut delivery);
            if !delivery.evicted.is_empty() {
                break;
            }
        }

        debug!(
            connection = %connection,
            replayed = delivery.delivered,
            connections = state.registry.len(),
            "Connection joined"
        );
        Ok((delivery, extra))
    }

    /// Remove a connection. Idempotent.
    ///
    /// Returns `true` if the connection was live.
    pub fn leave(&self, connection: &ConnectionId) -> bool {
        let mut state = self.state.lock();
        let removed = state.registry.leave(connection);
        if removed {
            debug!(
                connection = %connection,
                connections = state.registry.len(),
                "Connection left"
            );
        }
        removed
    }

    /// Apply an incoming record from `origin`.
    ///
    /// Never fails: unknown identifiers, undefined actions and failed sends
    /// all degrade to a smaller fan-out, reported in the result.
    pub fn apply(&self, origin: &ConnectionId, incoming: Record) -> ApplyReport {
        let mut state = self.state.lock();

        let report = match incoming.action {
            Some(Action::Add) => state.add(origin, incoming),
            Some(Action::Update) => {
                state.update(origin, &incoming, self.config.broadcast_public_updates)
            }
            Some(Action::Remove) => state.remove(&incoming),
            None => ApplyReport::ignored(IgnoreReason::UndefinedAction),
        };

        debug!(
            connection = %origin,
            outcome = ?report.outcome,
            delivered = report.delivery.delivered,
            evicted = report.delivery.evicted.len(),
            "Applied record"
        );
        report
    }

    /// Copy of the live records in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Record> {
        self.state.lock().store.values().cloned().collect()
    }

    /// Copy of a live record.
    #[must_use]
    pub fn get(&self, id: RecordId) -> Option<Record> {
        self.state.lock().store.get(id).cloned()
    }

    /// Whether the connection currently knows the record.
    #[must_use]
    pub fn knows(&self, connection: &ConnectionId, id: RecordId) -> bool {
        self.state.lock().registry.knows(connection, id)
    }

    /// Whether the connection is live.
    #[must_use]
    pub fn is_connected(&self, connection: &ConnectionId) -> bool {
        self.state.lock().registry.contains(connection)
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    /// Number of live records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.state.lock().store.len()
    }

    /// Get relay statistics.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        let state = self.state.lock();
        RelayStats {
            records: state.store.len(),
            connections: state.registry.len(),
            known: state.registry.total_known(),
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::{ChannelOutbound, OutboundError};
    use serde_json::json;

    #[derive(Default)]
    struct RecordingOutbound {
        sent: parking_lot::Mutex<Vec<Record>>,
    }

    impl RecordingOutbound {
        fn take(&self) -> Vec<Record> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl Outbound for RecordingOutbound {
        fn send(&self, record: &Record) -> Result<(), OutboundError> {
            self.sent.lock().push(record.clone());
            Ok(())
        }
    }

    struct FailingOutbound;

    impl Outbound for FailingOutbound {
        fn send(&self, _record: &Record) -> Result<(), OutboundError> {
            Err(OutboundError::Full)
        }
    }

    fn connect(relay: &Relay, name: &str) -> (ConnectionId, Arc<RecordingOutbound>) {
        let id = ConnectionId::from(name);
        let outbound = Arc::new(RecordingOutbound::default());
        relay.join(id.clone(), outbound.clone()).unwrap();
        (id, outbound)
    }

    fn actions(records: &[Record]) -> Vec<(Option<u64>, Option<Action>)> {
        records
            .iter()
            .map(|r| (r.id.map(RecordId::get), r.action))
            .collect()
    }

    #[test]
    fn test_public_add_reaches_everyone() {
        let relay = Relay::new();
        let (a, out_a) = connect(&relay, "a");
        let (b, out_b) = connect(&relay, "b");

        let report = relay.apply(&a, Record::add(Scope::Public).with_field("text", "hi"));

        assert_eq!(report.outcome, Outcome::Created(RecordId(1)));
        assert_eq!(report.delivery.delivered, 2);

        let expected = Record::add(Scope::Public).with_id(1).with_field("text", "hi");
        assert_eq!(out_a.take(), vec![expected.clone()]);
        assert_eq!(out_b.take(), vec![expected]);
        assert!(relay.knows(&a, RecordId(1)));
        assert!(relay.knows(&b, RecordId(1)));
    }

    #[test]
    fn test_private_add_reaches_origin_only() {
        let relay = Relay::new();
        let (a, out_a) = connect(&relay, "a");
        let (b, out_b) = connect(&relay, "b");

        relay.apply(&a, Record::add(Scope::Private));

        assert_eq!(out_a.take().len(), 1);
        assert!(out_b.take().is_empty());
        assert!(!relay.knows(&b, RecordId(1)));
    }

    #[test]
    fn test_undefined_scope_add_reaches_origin_only() {
        let relay = Relay::new();
        let (a, out_a) = connect(&relay, "a");
        let (_b, out_b) = connect(&relay, "b");

        relay.apply(&a, Record::new().with_action(Action::Add));

        assert_eq!(out_a.take().len(), 1);
        assert!(out_b.take().is_empty());
    }

    #[test]
    fn test_incoming_id_discarded_on_add() {
        let relay = Relay::new();
        let (a, out_a) = connect(&relay, "a");

        let report = relay.apply(&a, Record::add(Scope::Public).with_id(500));

        assert_eq!(report.outcome, Outcome::Created(RecordId(1)));
        assert_eq!(out_a.take()[0].id, Some(RecordId(1)));
    }

    #[test]
    fn test_public_to_private_transition() {
        let relay = Relay::new();
        let (a, out_a) = connect(&relay, "a");
        let (b, out_b) = connect(&relay, "b");
        relay.apply(&a, Record::add(Scope::Public).with_field("text", "hi"));
        out_a.take();
        out_b.take();

        let report = relay.apply(
            &b,
            Record::update(1)
                .with_scope(Scope::Private)
                .with_field("text", "hi"),
        );

        assert_eq!(
            report.outcome,
            Outcome::Updated {
                id: RecordId(1),
                transition: ScopeTransition::BecamePrivate,
            }
        );

        let to_b = out_b.take();
        assert_eq!(actions(&to_b), vec![(Some(1), Some(Action::Update))]);
        assert_eq!(to_b[0].scope, Some(Scope::Private));

        let to_a = out_a.take();
        assert_eq!(actions(&to_a), vec![(Some(1), Some(Action::Remove))]);
        assert_eq!(to_a[0].field("text"), Some(&json!("hi")));

        assert!(!relay.knows(&a, RecordId(1)));
        assert!(relay.knows(&b, RecordId(1)));
    }

    #[test]
    fn test_private_to_public_transition() {
        let relay = Relay::new();
        let (a, out_a) = connect(&relay, "a");
        let (b, out_b) = connect(&relay, "b");
        let (c, out_c) = connect(&relay, "c");
        relay.apply(&a, Record::add(Scope::Private));
        out_a.take();

        relay.apply(&a, Record::update(1).with_scope(Scope::Public));

        assert_eq!(actions(&out_a.take()), vec![(Some(1), Some(Action::Update))]);
        assert_eq!(actions(&out_b.take()), vec![(Some(1), Some(Action::Add))]);
        assert_eq!(actions(&out_c.take()), vec![(Some(1), Some(Action::Add))]);
        assert!(relay.knows(&b, RecordId(1)));
        assert!(relay.knows(&c, RecordId(1)));
    }

    #[test]
    fn test_transition_only_reaches_knowing_connections() {
        let relay = Relay::new();
        let (a, out_a) = connect(&relay, "a");
        relay.apply(&a, Record::add(Scope::Public));
        relay.apply(&a, Record::add(Scope::Private));
        out_a.take();

        // b joined after both adds and was replayed both records
        let (b, out_b) = connect(&relay, "b");
        assert_eq!(out_b.take().len(), 2);

        relay.apply(&b, Record::update(1).with_scope(Scope::Private));

        assert_eq!(actions(&out_a.take()), vec![(Some(1), Some(Action::Remove))]);
        assert!(relay.knows(&b, RecordId(1)));
    }

    #[test]
    fn test_plain_update_origin_only() {
        let relay = Relay::new();
        let (a, out_a) = connect(&relay, "a");
        let (_b, out_b) = connect(&relay, "b");
        relay.apply(&a, Record::add(Scope::Public).with_field("n", 1));
        out_a.take();
        out_b.take();

        let report = relay.apply(&a, Record::update(1).with_field("n", 2));

        assert_eq!(report.delivery.delivered, 1);
        let to_a = out_a.take();
        assert_eq!(to_a[0].field("n"), Some(&json!(2)));
        assert!(out_b.take().is_empty());
    }

    #[test]
    fn test_broadcast_public_updates() {
        let relay = Relay::with_config(RelayConfig {
            broadcast_public_updates: true,
            ..RelayConfig::default()
        });
        let (a, out_a) = connect(&relay, "a");
        let (_b, out_b) = connect(&relay, "b");
        relay.apply(&a, Record::add(Scope::Public).with_field("n", 1));
        relay.apply(&a, Record::add(Scope::Private));
        out_a.take();
        out_b.take();

        relay.apply(&a, Record::update(1).with_field("n", 2));
        relay.apply(&a, Record::update(2).with_field("n", 2));

        assert_eq!(out_a.take().len(), 2);
        let to_b = out_b.take();
        assert_eq!(actions(&to_b), vec![(Some(1), Some(Action::Update))]);
        assert_eq!(to_b[0].field("n"), Some(&json!(2)));
    }

    #[test]
    fn test_update_from_unknowing_origin_is_suppressed() {
        let relay = Relay::new();
        let (a, _out_a) = connect(&relay, "a");
        let (b, out_b) = connect(&relay, "b");
        relay.apply(&a, Record::add(Scope::Private).with_field("n", 1));

        let report = relay.apply(&b, Record::update(1).with_field("n", 2));

        // The store is still updated even though b is told nothing.
        assert_eq!(report.delivery.delivered, 0);
        assert!(out_b.take().is_empty());
        assert_eq!(
            relay.get(RecordId(1)).unwrap().field("n"),
            Some(&json!(2))
        );
    }

    #[test]
    fn test_update_unknown_record() {
        let relay = Relay::new();
        let (a, out_a) = connect(&relay, "a");

        let report = relay.apply(&a, Record::update(42).with_field("x", 1));

        assert_eq!(report.outcome, Outcome::Ignored(IgnoreReason::UnknownRecord));
        assert!(out_a.take().is_empty());
        assert_eq!(relay.record_count(), 0);
    }

    #[test]
    fn test_remove_reaches_knowing_connections() {
        let relay = Relay::new();
        let (a, out_a) = connect(&relay, "a");
        let (b, out_b) = connect(&relay, "b");
        relay.apply(&a, Record::add(Scope::Public).with_field("text", "hi"));
        relay.apply(&b, Record::update(1).with_scope(Scope::Private));
        out_a.take();
        out_b.take();

        // a no longer knows record 1 but may still remove it
        let report = relay.apply(&a, Record::remove(1));

        assert_eq!(report.outcome, Outcome::Removed(RecordId(1)));
        assert!(out_a.take().is_empty());
        assert_eq!(actions(&out_b.take()), vec![(Some(1), Some(Action::Remove))]);
        assert!(!relay.knows(&b, RecordId(1)));
        assert_eq!(relay.record_count(), 0);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let relay = Relay::new();
        let (a, out_a) = connect(&relay, "a");

        let report = relay.apply(&a, Record::remove(3));
        assert_eq!(report.outcome, Outcome::Ignored(IgnoreReason::UnknownRecord));
        assert_eq!(report.delivery, Delivery::default());

        let report = relay.apply(&a, Record::new().with_action(Action::Remove));
        assert_eq!(report.outcome, Outcome::Ignored(IgnoreReason::MissingId));
        assert!(out_a.take().is_empty());
    }

    #[test]
    fn test_undefined_action() {
        let relay = Relay::new();
        let (a, out_a) = connect(&relay, "a");

        let report = relay.apply(&a, Record::new().with_scope(Scope::Public));

        assert_eq!(
            report.outcome,
            Outcome::Ignored(IgnoreReason::UndefinedAction)
        );
        assert!(out_a.take().is_empty());
        assert_eq!(relay.record_count(), 0);
    }

    #[test]
    fn test_join_replays_in_order() {
        let relay = Relay::new();
        let (a, _out_a) = connect(&relay, "a");
        relay.apply(&a, Record::add(Scope::Public).with_field("n", 1));
        relay.apply(&a, Record::add(Scope::Private).with_field("n", 2));
        relay.apply(&a, Record::add(Scope::Public).with_field("n", 3));
        relay.apply(&a, Record::update(3).with_field("n", 4));
        relay.apply(&a, Record::remove(1));

        let (c, out_c) = connect(&relay, "c");

        let replayed = out_c.take();
        assert_eq!(
            actions(&replayed),
            vec![(Some(2), Some(Action::Add)), (Some(3), Some(Action::Add))]
        );
        assert_eq!(replayed[1].field("n"), Some(&json!(4)));
        assert!(relay.knows(&c, RecordId(2)));
        assert!(relay.knows(&c, RecordId(3)));
    }

    #[test]
    fn test_replay_precedes_live_updates() {
        let relay = Relay::new();
        let (a, _out_a) = connect(&relay, "a");
        relay.apply(&a, Record::add(Scope::Public));

        let (_c, out_c) = connect(&relay, "c");
        relay.apply(&a, Record::add(Scope::Public));

        assert_eq!(
            actions(&out_c.take()),
            vec![(Some(1), Some(Action::Add)), (Some(2), Some(Action::Add))]
        );
    }

    #[test]
    fn test_failed_send_evicts_without_stopping_fan_out() {
        let relay = Relay::new();
        let (a, out_a) = connect(&relay, "a");
        let broken = ConnectionId::from("broken");
        relay.join(broken.clone(), Arc::new(FailingOutbound)).unwrap();
        let (_c, out_c) = connect(&relay, "c");

        let report = relay.apply(&a, Record::add(Scope::Public));

        assert_eq!(report.delivery.evicted, vec![broken.clone()]);
        assert_eq!(report.delivery.delivered, 2);
        assert_eq!(out_a.take().len(), 1);
        assert_eq!(out_c.take().len(), 1);
        assert!(!relay.is_connected(&broken));
        assert_eq!(relay.connection_count(), 2);
    }

    #[test]
    fn test_failed_replay_evicts_joiner() {
        let relay = Relay::new();
        let (a, _out_a) = connect(&relay, "a");
        relay.apply(&a, Record::add(Scope::Public));
        relay.apply(&a, Record::add(Scope::Public));

        let broken = ConnectionId::from("broken");
        let delivery = relay
            .join(broken.clone(), Arc::new(FailingOutbound))
            .unwrap();

        assert_eq!(delivery.evicted, vec![broken.clone()]);
        assert!(!relay.is_connected(&broken));
    }

    fn seed(relay: &Relay, count: usize) {
        let writer = ConnectionId::from("writer");
        for n in 0..count {
            relay.apply(&writer, Record::add(Scope::Public).with_field("n", n));
        }
    }

    #[test]
    fn test_replay_overflows_small_channel() {
        let relay = Relay::new();
        seed(&relay, 10);

        let joiner = ConnectionId::from("joiner");
        let (outbound, _rx) = ChannelOutbound::new(4);
        let delivery = relay.join(joiner.clone(), Arc::new(outbound)).unwrap();

        assert_eq!(delivery.delivered, 4);
        assert_eq!(delivery.evicted, vec![joiner.clone()]);
        assert!(!relay.is_connected(&joiner));
    }

    #[test]
    fn test_join_with_sizes_channel_for_replay() {
        let relay = Relay::new();
        seed(&relay, 10);

        let joiner = ConnectionId::from("joiner");
        let (delivery, mut rx) = relay
            .join_with(joiner.clone(), |pending| {
                assert_eq!(pending, 10);
                let (outbound, rx) = ChannelOutbound::new(pending + 2);
                (Arc::new(outbound) as Arc<dyn Outbound>, rx)
            })
            .unwrap();

        assert_eq!(delivery.delivered, 10);
        assert!(delivery.evicted.is_empty());
        assert!(relay.is_connected(&joiner));

        let mut replayed = Vec::new();
        while let Ok(record) = rx.try_recv() {
            replayed.push(record.id.map(RecordId::get));
        }
        assert_eq!(replayed, (1..=10).map(Some).collect::<Vec<_>>());

        // Headroom left for live traffic
        relay.apply(&joiner, Record::add(Scope::Private));
        assert!(relay.is_connected(&joiner));
    }

    #[test]
    fn test_connection_limit() {
        let relay = Relay::with_config(RelayConfig {
            max_connections: 1,
            ..RelayConfig::default()
        });
        let (a, _out_a) = connect(&relay, "a");

        let b = ConnectionId::from("b");
        let result = relay.join(b.clone(), Arc::new(RecordingOutbound::default()));
        assert_eq!(result, Err(JoinError::Full(1)));
        assert!(!relay.is_connected(&b));

        // Rejoining an existing id does not count twice
        assert!(relay
            .join(a.clone(), Arc::new(RecordingOutbound::default()))
            .is_ok());

        relay.leave(&a);
        assert!(relay.join(b, Arc::new(RecordingOutbound::default())).is_ok());
    }

    #[test]
    fn test_oversized_add_rejected() {
        let relay = Relay::with_config(RelayConfig {
            max_record_size: 200,
            ..RelayConfig::default()
        });
        let (a, out_a) = connect(&relay, "a");

        let report = relay.apply(
            &a,
            Record::add(Scope::Public).with_field("text", "x".repeat(300)),
        );

        assert_eq!(report.outcome, Outcome::Ignored(IgnoreReason::RecordTooLarge));
        assert!(out_a.take().is_empty());
        assert_eq!(relay.record_count(), 0);

        let report = relay.apply(&a, Record::add(Scope::Public));
        assert_eq!(report.outcome, Outcome::Created(RecordId(1)));
    }

    #[test]
    fn test_oversized_merge_rejected() {
        let relay = Relay::with_config(RelayConfig {
            max_record_size: 200,
            ..RelayConfig::default()
        });
        let (a, out_a) = connect(&relay, "a");
        let (_b, out_b) = connect(&relay, "b");
        relay.apply(
            &a,
            Record::add(Scope::Public).with_field("text", "x".repeat(100)),
        );
        out_a.take();
        out_b.take();

        let report = relay.apply(&a, Record::update(1).with_field("more", "y".repeat(100)));

        assert_eq!(report.outcome, Outcome::Ignored(IgnoreReason::RecordTooLarge));
        assert!(out_a.take().is_empty());
        assert_eq!(relay.get(RecordId(1)).unwrap().field("more"), None);

        // The stored record still replays to new connections
        let (_c, out_c) = connect(&relay, "c");
        assert_eq!(actions(&out_c.take()), vec![(Some(1), Some(Action::Add))]);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let relay = Relay::new();
        let (a, _out_a) = connect(&relay, "a");

        assert!(relay.leave(&a));
        assert!(!relay.leave(&a));
        assert_eq!(relay.connection_count(), 0);
    }

    #[test]
    fn test_store_full() {
        let relay = Relay::with_config(RelayConfig {
            max_records: 1,
            ..RelayConfig::default()
        });
        let (a, out_a) = connect(&relay, "a");
        relay.apply(&a, Record::add(Scope::Public));

        let report = relay.apply(&a, Record::add(Scope::Public));

        assert_eq!(report.outcome, Outcome::Ignored(IgnoreReason::StoreFull));
        assert_eq!(out_a.take().len(), 1);
    }

    #[test]
    fn test_stats() {
        let relay = Relay::new();
        let (a, _out_a) = connect(&relay, "a");
        let (_b, _out_b) = connect(&relay, "b");
        relay.apply(&a, Record::add(Scope::Public));
        relay.apply(&a, Record::add(Scope::Private));

        let stats = relay.stats();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.known, 3);
        assert_eq!(relay.snapshot().len(), 2);
    }

    #[test]
    fn test_scope_transition_between() {
        use ScopeTransition::*;
        let public = Some(Scope::Public);
        let private = Some(Scope::Private);

        assert_eq!(ScopeTransition::between(public, private), BecamePrivate);
        assert_eq!(ScopeTransition::between(private, public), BecamePublic);
        assert_eq!(ScopeTransition::between(public, public), Unchanged);
        assert_eq!(ScopeTransition::between(public, None), Unchanged);
        assert_eq!(ScopeTransition::between(None, public), Unchanged);
    }
}
