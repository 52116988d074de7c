//! Filter entity.

use super::entity::{assign, decode, read_only, unknown_field, AnyEntity, ChangeSet, Entity, EntityId, EntityKind, NO_ID};
use crate::core::error::SyncResult;
use crate::storage::schema::{Column, ColumnType};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};

const COLUMNS: &[Column] = &[
    Column::new("uuid", ColumnType::Text),
    Column::new("origin", ColumnType::Integer),
    Column::new("color", ColumnType::Json),
    Column::new("axisX", ColumnType::Text),
    Column::new("axisY", ColumnType::Text),
    Column::new("boundAxis", ColumnType::Text),
    Column::new("path", ColumnType::Json),
];

bitflags::bitflags! {
    /// Which polygon axes a filter tests against.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AxisBinding: u8 {
        /// Test the x extent.
        const X = 0b01;
        /// Test the y extent.
        const Y = 0b10;
    }
}

impl Default for AxisBinding {
    fn default() -> Self {
        Self::all()
    }
}

impl AxisBinding {
    /// Wire name: `"x"`, `"y"` or `"xy"`.
    pub fn as_str(self) -> &'static str {
        if self == Self::X {
            "x"
        } else if self == Self::Y {
            "y"
        } else {
            "xy"
        }
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "x" => Some(Self::X),
            "y" => Some(Self::Y),
            "xy" => Some(Self::all()),
            _ => None,
        }
    }
}

impl Serialize for AxisBinding {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AxisBinding {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| de::Error::custom(format!("invalid axis binding '{s}'")))
    }
}

/// Filter color: a single hex color or a gradient across normalized y.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColorSpec {
    Solid(String),
    Gradient { from: String, to: String },
}

impl Default for ColorSpec {
    fn default() -> Self {
        Self::Solid("#ff0000".to_string())
    }
}

/// A user-drawn polygonal region in a plot's normalized coordinate space.
#[derive(Debug, Clone)]
pub struct Filter {
    id: EntityId,
    uuid: String,
    origin: EntityId,
    color: ColorSpec,
    axis_x: String,
    axis_y: String,
    bound_axis: AxisBinding,
    path: Vec<[f64; 2]>,
    includes: Vec<i64>,
    changes: ChangeSet,
}

impl Filter {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Plot the filter is drawn on.
    pub fn origin(&self) -> EntityId {
        self.origin
    }

    pub fn color(&self) -> &ColorSpec {
        &self.color
    }

    pub fn bound_axis(&self) -> AxisBinding {
        self.bound_axis
    }

    pub fn path(&self) -> &[[f64; 2]] {
        &self.path
    }

    /// Row ids inside the polygon, ascending.
    pub fn includes(&self) -> &[i64] {
        &self.includes
    }

    pub fn set_uuid(&mut self, uuid: String) -> bool {
        assign(&mut self.uuid, uuid, "uuid", &mut self.changes)
    }

    pub fn set_origin(&mut self, origin: EntityId) -> bool {
        assign(&mut self.origin, origin, "origin", &mut self.changes)
    }

    pub fn set_color(&mut self, color: ColorSpec) -> bool {
        assign(&mut self.color, color, "color", &mut self.changes)
    }

    pub fn set_axis_x(&mut self, axis: String) -> bool {
        assign(&mut self.axis_x, axis, "axisX", &mut self.changes)
    }

    pub fn set_axis_y(&mut self, axis: String) -> bool {
        assign(&mut self.axis_y, axis, "axisY", &mut self.changes)
    }

    pub fn set_bound_axis(&mut self, binding: AxisBinding) -> bool {
        assign(&mut self.bound_axis, binding, "boundAxis", &mut self.changes)
    }

    pub fn set_path(&mut self, path: Vec<[f64; 2]>) -> bool {
        assign(&mut self.path, path, "path", &mut self.changes)
    }

    /// Replace the inclusion set. Only the filter engine calls this.
    pub fn set_includes(&mut self, includes: Vec<i64>) -> bool {
        assign(&mut self.includes, includes, "includes", &mut self.changes)
    }
}

impl Entity for Filter {
    const KIND: EntityKind = EntityKind::Filter;
    const TABLE: &'static str = "filters";

    fn columns() -> &'static [Column] {
        COLUMNS
    }

    fn new_with_id(id: EntityId) -> Self {
        Self {
            id,
            uuid: String::new(),
            origin: NO_ID,
            color: ColorSpec::default(),
            axis_x: String::new(),
            axis_y: String::new(),
            bound_axis: AxisBinding::default(),
            path: Vec::new(),
            includes: Vec::new(),
            changes: ChangeSet::default(),
        }
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn to_fields(&self) -> Map<String, Value> {
        let fields = json!({
            "id": self.id,
            "uuid": self.uuid,
            "origin": self.origin,
            "color": self.color,
            "axisX": self.axis_x,
            "axisY": self.axis_y,
            "boundAxis": self.bound_axis,
            "path": self.path,
            "includes": self.includes,
        });
        match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn set_field(&mut self, name: &str, value: &Value) -> SyncResult<bool> {
        let kind = Self::KIND;
        Ok(match name {
            "uuid" => self.set_uuid(decode(kind, name, value)?),
            "origin" => self.set_origin(decode(kind, name, value)?),
            "color" => self.set_color(decode(kind, name, value)?),
            "axisX" => self.set_axis_x(decode(kind, name, value)?),
            "axisY" => self.set_axis_y(decode(kind, name, value)?),
            "boundAxis" => self.set_bound_axis(decode(kind, name, value)?),
            "path" => self.set_path(decode(kind, name, value)?),
            "id" | "includes" => return Err(read_only(kind, name)),
            _ => return Err(unknown_field(kind, name)),
        })
    }

    fn take_changes(&mut self) -> Vec<&'static str> {
        self.changes.take()
    }

    fn wrap(self) -> AnyEntity {
        AnyEntity::Filter(self)
    }
}
