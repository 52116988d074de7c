//! Column schema shared by the entity store and the SQLite backend.
//!
//! Persisted entity fields are described by a static column list. JSON-valued
//! columns (poses, paths, menu structures) are stored as text and parsed back
//! on load; booleans are stored as integers.

use crate::core::error::{SyncError, SyncResult};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Map, Number, Value};

/// Name of the raw source table.
pub const DATASET_TABLE: &str = "dataset";

/// Name of the row id column in every table.
pub const ID_COLUMN: &str = "id";

/// Storage type of a persisted column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Bool,
    Json,
}

impl ColumnType {
    /// SQL type affinity for the column declaration.
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer | Self::Bool => "INTEGER",
            Self::Real => "REAL",
            Self::Text | Self::Json => "TEXT",
        }
    }
}

/// A persisted column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    /// Column name, identical to the wire field name.
    pub name: &'static str,
    /// Storage type.
    pub ty: ColumnType,
}

impl Column {
    /// Declare a column.
    pub const fn new(name: &'static str, ty: ColumnType) -> Self {
        Self { name, ty }
    }
}

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Name of the derived view for a plot.
pub fn view_name(plot_id: i64) -> String {
    format!("view_plot_{plot_id}")
}

/// Convert a JSON field value into an SQL value for the given column type.
pub fn to_sql(column: &Column, value: &Value) -> SyncResult<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    let converted = match column.ty {
        ColumnType::Integer => value.as_i64().map(SqlValue::Integer),
        ColumnType::Real => value.as_f64().map(SqlValue::Real),
        ColumnType::Text => value.as_str().map(|s| SqlValue::Text(s.to_string())),
        ColumnType::Bool => value.as_bool().map(|b| SqlValue::Integer(i64::from(b))),
        ColumnType::Json => Some(SqlValue::Text(serde_json::to_string(value)?)),
    };
    converted.ok_or_else(|| {
        SyncError::storage(format!(
            "column '{}' expects {:?}, got {}",
            column.name, column.ty, value
        ))
    })
}

/// Convert an SQL value read from a column of the given type back to JSON.
pub fn from_sql(ty: ColumnType, value: ValueRef<'_>) -> Value {
    match (ty, value) {
        (_, ValueRef::Null) => Value::Null,
        (ColumnType::Bool, ValueRef::Integer(i)) => Value::Bool(i != 0),
        (ColumnType::Json, ValueRef::Text(text)) => std::str::from_utf8(text)
            .ok()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(Value::Null),
        (_, other) => dynamic_from_sql(other),
    }
}

/// Convert an SQL value of unknown column type to JSON.
pub fn dynamic_from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
    }
}

/// Convert a dataset cell to an SQL value, keeping its dynamic type.
pub fn dynamic_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Select the persisted columns out of a field map, in schema order.
pub fn persisted_fields<'a>(
    columns: &'a [Column],
    fields: &'a Map<String, Value>,
) -> impl Iterator<Item = (&'a Column, &'a Value)> {
    columns
        .iter()
        .filter_map(move |column| fields.get(column.name).map(|value| (column, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("dimX"), "\"dimX\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_json_column_round_trip() {
        let column = Column::new("path", ColumnType::Json);
        let sql = to_sql(&column, &json!([[0.0, 0.0], [1.0, 1.0]])).unwrap();
        let SqlValue::Text(text) = sql else {
            panic!("expected text");
        };
        let back = from_sql(ColumnType::Json, ValueRef::Text(text.as_bytes()));
        assert_eq!(back, json!([[0.0, 0.0], [1.0, 1.0]]));
    }

    #[test]
    fn test_bool_column() {
        let column = Column::new("useColor", ColumnType::Bool);
        assert_eq!(to_sql(&column, &json!(true)).unwrap(), SqlValue::Integer(1));
        assert_eq!(from_sql(ColumnType::Bool, ValueRef::Integer(0)), json!(false));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let column = Column::new("dimX", ColumnType::Text);
        assert!(to_sql(&column, &json!(5)).is_err());
    }
}
