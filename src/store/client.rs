//! Client entity.
//!
//! A connected AR viewer, tracking service or web tablet. The row is keyed by
//! `(name, kind)` and survives disconnects so a reconnecting client gets its
//! previous state back.

use super::entity::{assign, decode, read_only, unknown_field, AnyEntity, ChangeSet, Entity, EntityId, EntityKind, NO_ID};
use crate::core::error::SyncResult;
use crate::storage::schema::{Column, ColumnType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

const COLUMNS: &[Column] = &[
    Column::new("name", ColumnType::Text),
    Column::new("kind", ColumnType::Text),
    Column::new("owner", ColumnType::Integer),
    Column::new("orientation", ColumnType::Text),
    Column::new("isVoiceActive", ColumnType::Bool),
    Column::new("screenMenu", ColumnType::Json),
    Column::new("selectedPlot", ColumnType::Integer),
    Column::new("isCalibrated", ColumnType::Bool),
    Column::new("isDebug", ColumnType::Bool),
];

/// Transport family of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    /// Native head-mounted viewer on the framed TCP protocol.
    #[default]
    Ar,
    /// Tracking service on the framed TCP protocol.
    Tracker,
    /// Web/tablet client on the message bus.
    Web,
}

impl ClientKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ar => "ar",
            Self::Tracker => "tracker",
            Self::Web => "web",
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mirrored state of a connected client.
#[derive(Debug, Clone)]
pub struct Client {
    id: EntityId,
    name: String,
    kind: ClientKind,
    owner: EntityId,
    orientation: String,
    is_voice_active: bool,
    screen_menu: Value,
    selected_plot: EntityId,
    is_calibrated: bool,
    is_debug: bool,
    look_target: Value,
    changes: ChangeSet,
}

impl Client {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    /// AR client a web tablet is paired with.
    pub fn owner(&self) -> EntityId {
        self.owner
    }

    pub fn is_voice_active(&self) -> bool {
        self.is_voice_active
    }

    pub fn selected_plot(&self) -> EntityId {
        self.selected_plot
    }

    pub fn is_calibrated(&self) -> bool {
        self.is_calibrated
    }

    pub fn is_debug(&self) -> bool {
        self.is_debug
    }

    pub fn set_name(&mut self, name: String) -> bool {
        assign(&mut self.name, name, "name", &mut self.changes)
    }

    pub fn set_kind(&mut self, kind: ClientKind) -> bool {
        assign(&mut self.kind, kind, "kind", &mut self.changes)
    }

    pub fn set_owner(&mut self, owner: EntityId) -> bool {
        assign(&mut self.owner, owner, "owner", &mut self.changes)
    }

    pub fn set_orientation(&mut self, orientation: String) -> bool {
        assign(&mut self.orientation, orientation, "orientation", &mut self.changes)
    }

    pub fn set_voice_active(&mut self, value: bool) -> bool {
        assign(&mut self.is_voice_active, value, "isVoiceActive", &mut self.changes)
    }

    pub fn set_screen_menu(&mut self, menu: Value) -> bool {
        assign(&mut self.screen_menu, menu, "screenMenu", &mut self.changes)
    }

    pub fn set_selected_plot(&mut self, plot: EntityId) -> bool {
        assign(&mut self.selected_plot, plot, "selectedPlot", &mut self.changes)
    }

    pub fn set_calibrated(&mut self, value: bool) -> bool {
        assign(&mut self.is_calibrated, value, "isCalibrated", &mut self.changes)
    }

    pub fn set_debug(&mut self, value: bool) -> bool {
        assign(&mut self.is_debug, value, "isDebug", &mut self.changes)
    }

    pub fn set_look_target(&mut self, target: Value) -> bool {
        assign(&mut self.look_target, target, "lookTarget", &mut self.changes)
    }
}

impl Entity for Client {
    const KIND: EntityKind = EntityKind::Client;
    const TABLE: &'static str = "clients";

    fn columns() -> &'static [Column] {
        COLUMNS
    }

    fn new_with_id(id: EntityId) -> Self {
        Self {
            id,
            name: String::new(),
            kind: ClientKind::default(),
            owner: NO_ID,
            orientation: String::new(),
            is_voice_active: false,
            screen_menu: Value::Null,
            selected_plot: NO_ID,
            is_calibrated: false,
            is_debug: false,
            look_target: Value::Null,
            changes: ChangeSet::default(),
        }
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn to_fields(&self) -> Map<String, Value> {
        let fields = json!({
            "id": self.id,
            "name": self.name,
            "kind": self.kind,
            "owner": self.owner,
            "orientation": self.orientation,
            "isVoiceActive": self.is_voice_active,
            "screenMenu": self.screen_menu,
            "selectedPlot": self.selected_plot,
            "isCalibrated": self.is_calibrated,
            "isDebug": self.is_debug,
            "lookTarget": self.look_target,
        });
        match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn set_field(&mut self, name: &str, value: &Value) -> SyncResult<bool> {
        let kind = Self::KIND;
        Ok(match name {
            "name" => self.set_name(decode(kind, name, value)?),
            "kind" => self.set_kind(decode(kind, name, value)?),
            "owner" => self.set_owner(decode(kind, name, value)?),
            "orientation" => self.set_orientation(decode(kind, name, value)?),
            "isVoiceActive" => self.set_voice_active(decode(kind, name, value)?),
            "screenMenu" => self.set_screen_menu(value.clone()),
            "selectedPlot" => self.set_selected_plot(decode(kind, name, value)?),
            "isCalibrated" => self.set_calibrated(decode(kind, name, value)?),
            "isDebug" => self.set_debug(decode(kind, name, value)?),
            "lookTarget" => self.set_look_target(value.clone()),
            "id" => return Err(read_only(kind, name)),
            _ => return Err(unknown_field(kind, name)),
        })
    }

    fn take_changes(&mut self) -> Vec<&'static str> {
        self.changes.take()
    }

    fn wrap(self) -> AnyEntity {
        AnyEntity::Client(self)
    }
}
