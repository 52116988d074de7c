//! SQLite backend.
//!
//! Executes storage requests against a single connection. Only the storage
//! worker thread owns an instance; everything else talks to it through
//! [`super::StorageHandle`].

use super::schema::{
    dynamic_from_sql, dynamic_to_sql, from_sql, quote_ident, to_sql, view_name, Column,
    DATASET_TABLE, ID_COLUMN,
};
use super::{SourceRow, StorageRequest, StorageResponse};
use crate::core::error::{SyncError, SyncResult};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{Map, Value};

/// A live SQLite connection.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open the database at `path` (`:memory:` for a private in-memory database).
    pub fn open(path: &str) -> SyncResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Connection::open(path)?
        };
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS dataset (id INTEGER PRIMARY KEY);
            "#,
        )?;
        Ok(Self { conn })
    }

    /// Execute one request.
    pub fn execute(&mut self, request: StorageRequest) -> SyncResult<StorageResponse> {
        match request {
            StorageRequest::EnsureTable { table, columns } => {
                self.ensure_table(table, columns)?;
                Ok(StorageResponse::Done)
            }
            StorageRequest::MaxId { table } => self.max_id(table).map(StorageResponse::Id),
            StorageRequest::LoadWhere {
                table,
                columns,
                filters,
            } => self
                .load_where(table, columns, &filters)
                .map(StorageResponse::Rows),
            StorageRequest::Insert {
                table,
                columns,
                id,
                fields,
            } => {
                self.insert(table, columns, id, &fields)?;
                Ok(StorageResponse::Done)
            }
            StorageRequest::Update {
                table,
                columns,
                id,
                fields,
            } => {
                self.update(table, columns, id, &fields)?;
                Ok(StorageResponse::Done)
            }
            StorageRequest::Delete { table, id } => {
                self.conn.execute(
                    &format!("DELETE FROM {} WHERE id = ?1", quote_ident(table)),
                    [id],
                )?;
                Ok(StorageResponse::Done)
            }
            StorageRequest::ReplaceDataset { columns, rows } => {
                self.replace_dataset(&columns, &rows)?;
                Ok(StorageResponse::Done)
            }
            StorageRequest::DatasetColumns => {
                self.dataset_columns().map(StorageResponse::Columns)
            }
            StorageRequest::SourceRows {
                upstreams,
                dim_x,
                dim_y,
            } => self
                .source_rows(&upstreams, &dim_x, &dim_y)
                .map(StorageResponse::Source),
            StorageRequest::ReplaceView {
                plot_id,
                upstreams,
                kept,
            } => {
                self.replace_view(plot_id, &upstreams, kept.as_deref())?;
                Ok(StorageResponse::Done)
            }
            StorageRequest::DropView { plot_id } => {
                self.conn.execute_batch(&format!(
                    "DROP VIEW IF EXISTS {};",
                    quote_ident(&view_name(plot_id))
                ))?;
                Ok(StorageResponse::Done)
            }
        }
    }

    fn ensure_table(&self, table: &str, columns: &[Column]) -> SyncResult<()> {
        let mut decl = vec![format!("{ID_COLUMN} INTEGER PRIMARY KEY")];
        decl.extend(
            columns
                .iter()
                .map(|c| format!("{} {}", quote_ident(c.name), c.ty.sql_type())),
        );
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({});",
            quote_ident(table),
            decl.join(", ")
        ))?;

        // Older databases may predate a column; add what is missing.
        let existing = self.table_columns(table)?;
        for column in columns {
            if !existing.iter().any(|name| name == column.name) {
                self.conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {};",
                    quote_ident(table),
                    quote_ident(column.name),
                    column.ty.sql_type()
                ))?;
            }
        }
        Ok(())
    }

    fn table_columns(&self, table: &str) -> SyncResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn max_id(&self, table: &str) -> SyncResult<i64> {
        let max: Option<i64> = self.conn.query_row(
            &format!("SELECT MAX(id) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    fn load_where(
        &self,
        table: &str,
        columns: &[Column],
        filters: &[(String, Value)],
    ) -> SyncResult<Vec<Map<String, Value>>> {
        let mut select = vec![ID_COLUMN.to_string()];
        select.extend(columns.iter().map(|c| quote_ident(c.name)));

        let mut sql = format!("SELECT {} FROM {}", select.join(", "), quote_ident(table));
        let mut params = Vec::with_capacity(filters.len());
        let mut clauses = Vec::with_capacity(filters.len());
        for (name, value) in filters {
            if name == ID_COLUMN {
                clauses.push(format!("id = ?{}", params.len() + 1));
                params.push(value.as_i64().map(SqlValue::Integer).unwrap_or(SqlValue::Null));
                continue;
            }
            let column = columns
                .iter()
                .find(|c| c.name == name)
                .ok_or_else(|| SyncError::storage(format!("unknown column '{name}'")))?;
            clauses.push(format!("{} = ?{}", quote_ident(column.name), params.len() + 1));
            params.push(to_sql(column, value)?);
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                let mut fields = Map::new();
                fields.insert(ID_COLUMN.to_string(), Value::from(row.get::<_, i64>(0)?));
                for (index, column) in columns.iter().enumerate() {
                    let value = from_sql(column.ty, row.get_ref(index + 1)?);
                    fields.insert(column.name.to_string(), value);
                }
                Ok(fields)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert(
        &self,
        table: &str,
        columns: &[Column],
        id: i64,
        fields: &Map<String, Value>,
    ) -> SyncResult<()> {
        let mut names = vec![ID_COLUMN.to_string()];
        let mut params = vec![SqlValue::Integer(id)];
        for column in columns {
            if let Some(value) = fields.get(column.name) {
                names.push(quote_ident(column.name));
                params.push(to_sql(column, value)?);
            }
        }
        let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("?{i}")).collect();
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
                quote_ident(table),
                names.join(", "),
                placeholders.join(", ")
            ),
            params_from_iter(params),
        )?;
        Ok(())
    }

    fn update(
        &self,
        table: &str,
        columns: &[Column],
        id: i64,
        fields: &Map<String, Value>,
    ) -> SyncResult<()> {
        let mut assignments = Vec::new();
        let mut params = Vec::new();
        for column in columns {
            if let Some(value) = fields.get(column.name) {
                params.push(to_sql(column, value)?);
                assignments.push(format!("{} = ?{}", quote_ident(column.name), params.len()));
            }
        }
        if assignments.is_empty() {
            return Ok(());
        }
        params.push(SqlValue::Integer(id));
        self.conn.execute(
            &format!(
                "UPDATE {} SET {} WHERE id = ?{}",
                quote_ident(table),
                assignments.join(", "),
                params.len()
            ),
            params_from_iter(params),
        )?;
        Ok(())
    }

    fn replace_dataset(&mut self, columns: &[String], rows: &[(i64, Vec<Value>)]) -> SyncResult<()> {
        if columns.iter().any(|c| c == ID_COLUMN || c.trim().is_empty()) {
            return Err(SyncError::invalid_request(
                "dataset columns must be non-empty and must not be 'id'",
            ));
        }
        let tx = self.conn.transaction()?;
        {
            let mut decl = vec![format!("{ID_COLUMN} INTEGER PRIMARY KEY")];
            decl.extend(columns.iter().map(|c| quote_ident(c)));
            tx.execute_batch(&format!(
                "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({decl});",
                table = DATASET_TABLE,
                decl = decl.join(", ")
            ))?;

            let mut names = vec![ID_COLUMN.to_string()];
            names.extend(columns.iter().map(|c| quote_ident(c)));
            let placeholders: Vec<String> =
                (1..=names.len()).map(|i| format!("?{i}")).collect();
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {DATASET_TABLE} ({}) VALUES ({})",
                names.join(", "),
                placeholders.join(", ")
            ))?;
            for (row_id, cells) in rows {
                let mut params = vec![SqlValue::Integer(*row_id)];
                params.extend(
                    (0..columns.len()).map(|i| cells.get(i).map(dynamic_to_sql).unwrap_or(SqlValue::Null)),
                );
                stmt.execute(params_from_iter(params))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn dataset_columns(&self) -> SyncResult<Vec<String>> {
        Ok(self
            .table_columns(DATASET_TABLE)?
            .into_iter()
            .filter(|name| name != ID_COLUMN)
            .collect())
    }

    /// SQL source expression for a plot: the raw table, or the union of its
    /// upstream views.
    fn source_expr(upstreams: &[i64]) -> String {
        if upstreams.is_empty() {
            DATASET_TABLE.to_string()
        } else {
            let parts: Vec<String> = upstreams
                .iter()
                .map(|id| format!("SELECT * FROM {}", quote_ident(&view_name(*id))))
                .collect();
            format!("({})", parts.join(" UNION "))
        }
    }

    fn source_rows(&self, upstreams: &[i64], dim_x: &str, dim_y: &str) -> SyncResult<Vec<SourceRow>> {
        let known = self.dataset_columns()?;
        let select_dim = |dim: &str| {
            if known.iter().any(|c| c == dim) {
                quote_ident(dim)
            } else {
                "NULL".to_string()
            }
        };
        let sql = format!(
            "SELECT DISTINCT id, {}, {} FROM {} ORDER BY id",
            select_dim(dim_x),
            select_dim(dim_y),
            Self::source_expr(upstreams)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SourceRow {
                    row_id: row.get(0)?,
                    x: dynamic_from_sql(row.get_ref(1)?),
                    y: dynamic_from_sql(row.get_ref(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn replace_view(&self, plot_id: i64, upstreams: &[i64], kept: Option<&[i64]>) -> SyncResult<()> {
        let view = quote_ident(&view_name(plot_id));
        let mut sql = format!(
            "DROP VIEW IF EXISTS {view}; CREATE VIEW {view} AS SELECT * FROM {}",
            Self::source_expr(upstreams)
        );
        if let Some(kept) = kept {
            let ids: Vec<String> = kept.iter().map(|id| id.to_string()).collect();
            sql.push_str(&format!(" WHERE id IN ({})", ids.join(", ")));
        }
        sql.push(';');
        self.conn.execute_batch(&sql)?;
        Ok(())
    }
}
