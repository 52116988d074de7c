//! Plot entity.

use super::entity::{assign, decode, read_only, unknown_field, AnyEntity, ChangeSet, Entity, EntityId, EntityKind};
use crate::core::error::SyncResult;
use crate::storage::schema::{Column, ColumnType};
use serde::ser::{Serialize, Serializer};
use serde_json::{json, Map, Value};

const COLUMNS: &[Column] = &[
    Column::new("color", ColumnType::Text),
    Column::new("position", ColumnType::Json),
    Column::new("rotation", ColumnType::Json),
    Column::new("dimX", ColumnType::Text),
    Column::new("dimY", ColumnType::Text),
    Column::new("aggregationLevel", ColumnType::Integer),
    Column::new("useFilter", ColumnType::Bool),
    Column::new("useColor", ColumnType::Bool),
    Column::new("useSort", ColumnType::Bool),
];

/// Fields whose change invalidates the derived dataset.
pub const RECOMPUTE_FIELDS: &[&str] = &["dimX", "dimY", "aggregationLevel", "useFilter", "useSort"];

/// One derived row: source row id, normalized coordinates and whether the
/// row is filtered out. Serialized as `[rowId, x, y, 0|1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotRow {
    pub row_id: i64,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub filtered: bool,
}

impl Serialize for PlotRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.row_id, self.x, self.y, u8::from(self.filtered)).serialize(serializer)
    }
}

/// A 2D visualization bound to two data dimensions.
#[derive(Debug, Clone)]
pub struct Plot {
    id: EntityId,
    color: String,
    position: [f64; 3],
    rotation: [f64; 4],
    dim_x: String,
    dim_y: String,
    aggregation_level: u32,
    use_filter: bool,
    use_color: bool,
    use_sort: bool,
    data: Vec<PlotRow>,
    changes: ChangeSet,
}

impl Plot {
    pub fn color(&self) -> &str {
        &self.color
    }

    pub fn dim_x(&self) -> &str {
        &self.dim_x
    }

    pub fn dim_y(&self) -> &str {
        &self.dim_y
    }

    pub fn aggregation_level(&self) -> u32 {
        self.aggregation_level
    }

    pub fn use_filter(&self) -> bool {
        self.use_filter
    }

    pub fn use_color(&self) -> bool {
        self.use_color
    }

    pub fn use_sort(&self) -> bool {
        self.use_sort
    }

    /// Derived dataset, ordered by source row id.
    pub fn data(&self) -> &[PlotRow] {
        &self.data
    }

    pub fn set_color(&mut self, color: String) -> bool {
        assign(&mut self.color, color, "color", &mut self.changes)
    }

    pub fn set_position(&mut self, position: [f64; 3]) -> bool {
        assign(&mut self.position, position, "position", &mut self.changes)
    }

    pub fn set_rotation(&mut self, rotation: [f64; 4]) -> bool {
        assign(&mut self.rotation, rotation, "rotation", &mut self.changes)
    }

    pub fn set_dim_x(&mut self, dim: String) -> bool {
        assign(&mut self.dim_x, dim, "dimX", &mut self.changes)
    }

    pub fn set_dim_y(&mut self, dim: String) -> bool {
        assign(&mut self.dim_y, dim, "dimY", &mut self.changes)
    }

    pub fn set_aggregation_level(&mut self, level: u32) -> bool {
        assign(&mut self.aggregation_level, level, "aggregationLevel", &mut self.changes)
    }

    pub fn set_use_filter(&mut self, value: bool) -> bool {
        assign(&mut self.use_filter, value, "useFilter", &mut self.changes)
    }

    pub fn set_use_color(&mut self, value: bool) -> bool {
        assign(&mut self.use_color, value, "useColor", &mut self.changes)
    }

    pub fn set_use_sort(&mut self, value: bool) -> bool {
        assign(&mut self.use_sort, value, "useSort", &mut self.changes)
    }

    /// Replace the derived dataset. Only the dataflow engine calls this.
    pub fn set_data(&mut self, data: Vec<PlotRow>) -> bool {
        assign(&mut self.data, data, "data", &mut self.changes)
    }
}

impl Entity for Plot {
    const KIND: EntityKind = EntityKind::Plot;
    const TABLE: &'static str = "plots";

    fn columns() -> &'static [Column] {
        COLUMNS
    }

    fn new_with_id(id: EntityId) -> Self {
        Self {
            id,
            color: "#ffffff".to_string(),
            position: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
            dim_x: String::new(),
            dim_y: String::new(),
            aggregation_level: 0,
            use_filter: true,
            use_color: false,
            use_sort: false,
            data: Vec::new(),
            changes: ChangeSet::default(),
        }
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn to_fields(&self) -> Map<String, Value> {
        let fields = json!({
            "id": self.id,
            "color": self.color,
            "position": self.position,
            "rotation": self.rotation,
            "dimX": self.dim_x,
            "dimY": self.dim_y,
            "aggregationLevel": self.aggregation_level,
            "useFilter": self.use_filter,
            "useColor": self.use_color,
            "useSort": self.use_sort,
            "data": self.data,
        });
        match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn set_field(&mut self, name: &str, value: &Value) -> SyncResult<bool> {
        let kind = Self::KIND;
        Ok(match name {
            "color" => self.set_color(decode(kind, name, value)?),
            "position" => self.set_position(decode(kind, name, value)?),
            "rotation" => self.set_rotation(decode(kind, name, value)?),
            "dimX" => self.set_dim_x(decode(kind, name, value)?),
            "dimY" => self.set_dim_y(decode(kind, name, value)?),
            "aggregationLevel" => self.set_aggregation_level(decode(kind, name, value)?),
            "useFilter" => self.set_use_filter(decode(kind, name, value)?),
            "useColor" => self.set_use_color(decode(kind, name, value)?),
            "useSort" => self.set_use_sort(decode(kind, name, value)?),
            "id" | "data" => return Err(read_only(kind, name)),
            _ => return Err(unknown_field(kind, name)),
        })
    }

    fn take_changes(&mut self) -> Vec<&'static str> {
        self.changes.take()
    }

    fn wrap(self) -> AnyEntity {
        AnyEntity::Plot(self)
    }
}
