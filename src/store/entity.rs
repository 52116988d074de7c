//! Entity trait and shared field plumbing.
//!
//! Every entity mutates through explicit setters. A setter compares the old
//! and new value, assigns, and records the wire field name in the entity's
//! pending [`ChangeSet`]. The store drains that set after each edit and turns
//! it into exactly one change event.

use super::{Client, Filter, Link, Plot};
use crate::core::error::{SyncError, SyncResult};
use crate::storage::schema::Column;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;

/// Entity identifier. Ids are positive; [`NO_ID`] marks an unset reference.
pub type EntityId = i64;

/// Placeholder for an unset entity reference.
pub const NO_ID: EntityId = -1;

/// Id of the client that caused a mutation, or `None` for internal changes.
pub type Origin = Option<EntityId>;

/// The entity types held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Plot,
    Link,
    Filter,
    Client,
}

impl EntityKind {
    /// Lowercase name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plot => "plot",
            Self::Link => "link",
            Self::Filter => "filter",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered set of changed wire field names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    fields: Vec<&'static str>,
}

impl ChangeSet {
    /// Record a changed field, keeping first-change order.
    pub fn insert(&mut self, field: &'static str) {
        if !self.fields.contains(&field) {
            self.fields.push(field);
        }
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether the given field changed.
    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|f| *f == field)
    }

    /// Drain the recorded fields.
    pub fn take(&mut self) -> Vec<&'static str> {
        std::mem::take(&mut self.fields)
    }
}

/// Assign `value` to `slot` if it differs, recording `field` as changed.
pub fn assign<T: PartialEq>(
    slot: &mut T,
    value: T,
    field: &'static str,
    changes: &mut ChangeSet,
) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    changes.insert(field);
    true
}

/// Decode a wire value for a field setter.
pub fn decode<T: DeserializeOwned>(kind: EntityKind, field: &str, value: &Value) -> SyncResult<T> {
    serde_json::from_value(value.clone()).map_err(|e| SyncError::InvalidField {
        kind: kind.as_str(),
        field: field.to_string(),
        message: e.to_string(),
    })
}

/// Error for a field that clients cannot write.
pub fn read_only(kind: EntityKind, field: &str) -> SyncError {
    SyncError::InvalidField {
        kind: kind.as_str(),
        field: field.to_string(),
        message: "field is read-only".into(),
    }
}

/// Error for a field the entity does not have.
pub fn unknown_field(kind: EntityKind, field: &str) -> SyncError {
    SyncError::InvalidField {
        kind: kind.as_str(),
        field: field.to_string(),
        message: "unknown field".into(),
    }
}

/// A typed record managed by an [`EntityStore`](super::EntityStore).
pub trait Entity: Clone + Send + fmt::Debug + 'static {
    /// Entity kind tag.
    const KIND: EntityKind;

    /// Backing table name.
    const TABLE: &'static str;

    /// Persisted columns, excluding `id`.
    fn columns() -> &'static [Column];

    /// Create an entity with default fields.
    fn new_with_id(id: EntityId) -> Self;

    /// The entity id.
    fn id(&self) -> EntityId;

    /// Full wire representation, including `id`.
    fn to_fields(&self) -> Map<String, Value>;

    /// Write one wire field through its setter. Returns whether it changed.
    fn set_field(&mut self, name: &str, value: &Value) -> SyncResult<bool>;

    /// Drain the fields changed since the last call.
    fn take_changes(&mut self) -> Vec<&'static str>;

    /// Wrap into the kind-erased enum.
    fn wrap(self) -> AnyEntity;

    /// Build an entity from a persisted row. Columns that fail to decode keep
    /// their defaults.
    fn hydrate(row: &Map<String, Value>) -> Option<Self> {
        let id = row.get("id")?.as_i64()?;
        let mut entity = Self::new_with_id(id);
        for column in Self::columns() {
            match row.get(column.name) {
                None | Some(Value::Null) => {}
                Some(value) => {
                    if let Err(e) = entity.set_field(column.name, value) {
                        tracing::warn!(
                            kind = %Self::KIND,
                            id,
                            error = %e,
                            "ignoring persisted column"
                        );
                    }
                }
            }
        }
        entity.take_changes();
        Some(entity)
    }
}

/// Kind-erased entity, carried by deletion events.
#[derive(Debug, Clone)]
pub enum AnyEntity {
    Plot(Plot),
    Link(Link),
    Filter(Filter),
    Client(Client),
}

impl AnyEntity {
    /// The entity id.
    pub fn id(&self) -> EntityId {
        match self {
            Self::Plot(e) => e.id(),
            Self::Link(e) => e.id(),
            Self::Filter(e) => e.id(),
            Self::Client(e) => e.id(),
        }
    }

    /// The entity kind.
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Plot(_) => EntityKind::Plot,
            Self::Link(_) => EntityKind::Link,
            Self::Filter(_) => EntityKind::Filter,
            Self::Client(_) => EntityKind::Client,
        }
    }

    /// Full wire representation.
    pub fn to_fields(&self) -> Map<String, Value> {
        match self {
            Self::Plot(e) => e.to_fields(),
            Self::Link(e) => e.to_fields(),
            Self::Filter(e) => e.to_fields(),
            Self::Client(e) => e.to_fields(),
        }
    }
}

/// A lookup key: every `(field, value)` pair must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lookup {
    pairs: Vec<(String, Value)>,
}

impl Lookup {
    /// Empty lookup, matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookup by id.
    pub fn by_id(id: EntityId) -> Self {
        Self::new().with("id", id)
    }

    /// Add an equality.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.pairs.push((field.into(), value.into()));
        self
    }

    /// The id this lookup pins, if any.
    pub fn id(&self) -> Option<EntityId> {
        self.pairs
            .iter()
            .find(|(field, _)| field == "id")
            .and_then(|(_, value)| value.as_i64())
    }

    /// Whether the entity matches every pair.
    pub fn matches<T: Entity>(&self, entity: &T) -> bool {
        let fields = entity.to_fields();
        self.pairs
            .iter()
            .all(|(field, value)| fields.get(field) == Some(value))
    }

    /// The lookup pairs.
    pub fn pairs(&self) -> &[(String, Value)] {
        &self.pairs
    }

    /// The lookup as a field map for creation.
    pub fn to_fields(&self) -> Map<String, Value> {
        self.pairs
            .iter()
            .filter(|(field, _)| field != "id")
            .cloned()
            .collect()
    }
}
