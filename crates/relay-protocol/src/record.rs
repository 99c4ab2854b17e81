//! Record types for the Relay protocol.
//!
//! A record is the unit of shared state: an identified, scoped bag of fields
//! that every connection may add, update or remove. On the wire a record is a
//! flat map where `id`, `action` and `scope` are reserved keys and every other
//! key is an opaque caller-defined field.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Wire key for the record identifier.
pub const ID_KEY: &str = "id";
/// Wire key for the action tag.
pub const ACTION_KEY: &str = "action";
/// Wire key for the visibility scope.
pub const SCOPE_KEY: &str = "scope";

/// Keys that are never stored in [`Record::fields`].
pub const RESERVED_KEYS: [&str; 3] = [ID_KEY, ACTION_KEY, SCOPE_KEY];

/// Server-assigned record identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl RecordId {
    /// Get the raw identifier value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// What is being done to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    /// Create a record.
    Add,
    /// Merge fields into an existing record.
    Update,
    /// Delete a record.
    Remove,
}

impl Action {
    /// Wire name of the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::Add => "ADD",
            Action::Update => "UPDATE",
            Action::Remove => "REMOVE",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visibility class of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    /// Broadcast to every connection.
    Public,
    /// Visible only to the connection that owns it.
    Private,
}

impl Scope {
    /// Wire name of the scope.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Scope::Public => "PUBLIC",
            Scope::Private => "PRIVATE",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record as exchanged between clients and the relay.
///
/// `None` in `id`, `action` or `scope` is the undefined value: the key was
/// absent, null, or held something that could not be interpreted. Decoding
/// never fails because of these three keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record identifier, undefined until the store assigns one.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient"
    )]
    pub id: Option<RecordId>,

    /// Action tag.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient"
    )]
    pub action: Option<Action>,

    /// Visibility scope.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient"
    )]
    pub scope: Option<Scope>,

    /// Caller-defined fields, passed through untouched.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an `ADD` record with the given scope.
    #[must_use]
    pub fn add(scope: Scope) -> Self {
        Self::new().with_action(Action::Add).with_scope(scope)
    }

    /// Create an `UPDATE` record targeting `id`.
    #[must_use]
    pub fn update(id: impl Into<RecordId>) -> Self {
        Self::new().with_id(id).with_action(Action::Update)
    }

    /// Create a `REMOVE` record targeting `id`.
    #[must_use]
    pub fn remove(id: impl Into<RecordId>) -> Self {
        Self::new().with_id(id).with_action(Action::Remove)
    }

    /// Set the identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<RecordId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the action tag.
    #[must_use]
    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    /// Set the scope.
    #[must_use]
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Set a caller-defined field. Reserved keys are ignored.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_field(key, value);
        self
    }

    /// Set a caller-defined field.
    ///
    /// Returns `false` without touching the record if `key` is reserved.
    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            return false;
        }
        self.fields.insert(key, value.into());
        true
    }

    /// Get a caller-defined field.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Copy of this record carrying a different action tag.
    #[must_use]
    pub fn tagged(&self, action: Action) -> Self {
        let mut record = self.clone();
        record.action = Some(action);
        record
    }

    /// Merge another record's content into this one.
    ///
    /// Every field present in `other` overwrites the field here; fields not
    /// mentioned are kept. A defined scope overwrites, an undefined one does
    /// not. Identifier and action are left alone.
    pub fn merge_from(&mut self, other: &Record) {
        for (key, value) in &other.fields {
            self.fields.insert(key.clone(), value.clone());
        }
        if let Some(scope) = other.scope {
            self.scope = Some(scope);
        }
    }

    /// Whether the record is public.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.scope == Some(Scope::Public)
    }
}

/// Deserialize an optional value, mapping anything unparseable to `None`.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}
