//! Link entity.

use super::entity::{assign, decode, read_only, unknown_field, AnyEntity, ChangeSet, Entity, EntityId, EntityKind, NO_ID};
use crate::core::error::SyncResult;
use crate::storage::schema::{Column, ColumnType};
use serde_json::{json, Map, Value};

const COLUMNS: &[Column] = &[
    Column::new("upstream", ColumnType::Integer),
    Column::new("downstream", ColumnType::Integer),
    Column::new("useColor", ColumnType::Bool),
    Column::new("useSort", ColumnType::Bool),
    Column::new("createdBy", ColumnType::Integer),
];

/// Directed data-flow edge between two plots.
///
/// While a client is still dragging a link out, `createdBy` holds that
/// client's id, either endpoint may be [`NO_ID`] and `placement` carries the
/// in-flight pose. A link is finalized once `createdBy` is back to `NO_ID`.
#[derive(Debug, Clone)]
pub struct Link {
    id: EntityId,
    upstream: EntityId,
    downstream: EntityId,
    use_color: bool,
    use_sort: bool,
    created_by: EntityId,
    placement: Value,
    changes: ChangeSet,
}

impl Link {
    pub fn upstream(&self) -> EntityId {
        self.upstream
    }

    pub fn downstream(&self) -> EntityId {
        self.downstream
    }

    pub fn use_color(&self) -> bool {
        self.use_color
    }

    pub fn use_sort(&self) -> bool {
        self.use_sort
    }

    pub fn created_by(&self) -> EntityId {
        self.created_by
    }

    /// Whether no client is still creating the link.
    pub fn is_finalized(&self) -> bool {
        self.created_by == NO_ID
    }

    /// Whether the link touches the given plot.
    pub fn touches(&self, plot: EntityId) -> bool {
        self.upstream == plot || self.downstream == plot
    }

    pub fn set_upstream(&mut self, id: EntityId) -> bool {
        assign(&mut self.upstream, id, "upstream", &mut self.changes)
    }

    pub fn set_downstream(&mut self, id: EntityId) -> bool {
        assign(&mut self.downstream, id, "downstream", &mut self.changes)
    }

    pub fn set_use_color(&mut self, value: bool) -> bool {
        assign(&mut self.use_color, value, "useColor", &mut self.changes)
    }

    pub fn set_use_sort(&mut self, value: bool) -> bool {
        assign(&mut self.use_sort, value, "useSort", &mut self.changes)
    }

    pub fn set_created_by(&mut self, client: EntityId) -> bool {
        assign(&mut self.created_by, client, "createdBy", &mut self.changes)
    }

    pub fn set_placement(&mut self, placement: Value) -> bool {
        assign(&mut self.placement, placement, "placement", &mut self.changes)
    }
}

impl Entity for Link {
    const KIND: EntityKind = EntityKind::Link;
    const TABLE: &'static str = "links";

    fn columns() -> &'static [Column] {
        COLUMNS
    }

    fn new_with_id(id: EntityId) -> Self {
        Self {
            id,
            upstream: NO_ID,
            downstream: NO_ID,
            use_color: false,
            use_sort: false,
            created_by: NO_ID,
            placement: Value::Null,
            changes: ChangeSet::default(),
        }
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn to_fields(&self) -> Map<String, Value> {
        let fields = json!({
            "id": self.id,
            "upstream": self.upstream,
            "downstream": self.downstream,
            "useColor": self.use_color,
            "useSort": self.use_sort,
            "createdBy": self.created_by,
            "placement": self.placement,
        });
        match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn set_field(&mut self, name: &str, value: &Value) -> SyncResult<bool> {
        let kind = Self::KIND;
        Ok(match name {
            "upstream" => self.set_upstream(decode(kind, name, value)?),
            "downstream" => self.set_downstream(decode(kind, name, value)?),
            "useColor" => self.set_use_color(decode(kind, name, value)?),
            "useSort" => self.set_use_sort(decode(kind, name, value)?),
            "createdBy" => self.set_created_by(decode(kind, name, value)?),
            "placement" => self.set_placement(value.clone()),
            "id" => return Err(read_only(kind, name)),
            _ => return Err(unknown_field(kind, name)),
        })
    }

    fn take_changes(&mut self) -> Vec<&'static str> {
        self.changes.take()
    }

    fn wrap(self) -> AnyEntity {
        AnyEntity::Link(self)
    }
}
