//! Relational backing store.
//!
//! The SQLite connection lives on its own worker thread. The engine talks to
//! it only through [`StorageHandle`], which sends typed requests over a
//! channel and awaits a one-shot reply per call, so backing-store latency
//! never blocks the engine loop.
//!
//! # Modules
//!
//! - [`schema`] - Column schema and value conversion
//! - [`sqlite`] - SQLite backend executing requests
//! - [`worker`] - Worker thread with reconnect backoff

pub mod schema;
pub mod sqlite;
pub mod worker;

use crate::core::config::StorageConfig;
use crate::core::error::{SyncError, SyncResult};
use schema::Column;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub use schema::{ColumnType, DATASET_TABLE};

/// A raw source row for a plot recompute: the row id and the values of the
/// two selected dimensions, untransformed.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    /// Source row id.
    pub row_id: i64,
    /// Raw value of the x dimension.
    pub x: Value,
    /// Raw value of the y dimension.
    pub y: Value,
}

/// Requests understood by the storage worker.
#[derive(Debug)]
pub enum StorageRequest {
    EnsureTable {
        table: &'static str,
        columns: &'static [Column],
    },
    MaxId {
        table: &'static str,
    },
    LoadWhere {
        table: &'static str,
        columns: &'static [Column],
        filters: Vec<(String, Value)>,
    },
    Insert {
        table: &'static str,
        columns: &'static [Column],
        id: i64,
        fields: Map<String, Value>,
    },
    Update {
        table: &'static str,
        columns: &'static [Column],
        id: i64,
        fields: Map<String, Value>,
    },
    Delete {
        table: &'static str,
        id: i64,
    },
    ReplaceDataset {
        columns: Vec<String>,
        rows: Vec<(i64, Vec<Value>)>,
    },
    DatasetColumns,
    SourceRows {
        upstreams: Vec<i64>,
        dim_x: String,
        dim_y: String,
    },
    ReplaceView {
        plot_id: i64,
        upstreams: Vec<i64>,
        kept: Option<Vec<i64>>,
    },
    DropView {
        plot_id: i64,
    },
}

/// Replies from the storage worker.
#[derive(Debug)]
pub enum StorageResponse {
    Done,
    Id(i64),
    Rows(Vec<Map<String, Value>>),
    Columns(Vec<String>),
    Source(Vec<SourceRow>),
}

/// A request paired with its reply channel.
pub(crate) struct StorageCommand {
    pub request: StorageRequest,
    pub reply: oneshot::Sender<SyncResult<StorageResponse>>,
}

/// Cloneable handle to the storage worker.
#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::UnboundedSender<StorageCommand>,
}

impl StorageHandle {
    /// Start a storage worker for the configured database.
    pub fn open(config: &StorageConfig) -> Self {
        Self::spawn(
            config.database.clone(),
            Duration::from_millis(config.reconnect_backoff_ms),
        )
    }

    /// Start a storage worker on a private in-memory database.
    pub fn in_memory() -> Self {
        Self::spawn(":memory:".to_string(), Duration::from_secs(5))
    }

    fn spawn(database: String, backoff: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        worker::spawn(database, backoff, rx);
        Self { tx }
    }

    async fn call(&self, request: StorageRequest) -> SyncResult<StorageResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StorageCommand { request, reply })
            .map_err(|_| SyncError::ChannelClosed { name: "storage" })?;
        rx.await
            .map_err(|_| SyncError::ChannelClosed { name: "storage" })?
    }

    async fn call_done(&self, request: StorageRequest) -> SyncResult<()> {
        match self.call(request).await? {
            StorageResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Create an entity table if it does not exist, adding missing columns.
    pub async fn ensure_table(
        &self,
        table: &'static str,
        columns: &'static [Column],
    ) -> SyncResult<()> {
        self.call_done(StorageRequest::EnsureTable { table, columns })
            .await
    }

    /// Largest id in a table, or 0 when empty.
    pub async fn max_id(&self, table: &'static str) -> SyncResult<i64> {
        match self.call(StorageRequest::MaxId { table }).await? {
            StorageResponse::Id(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    /// Load every row of a table.
    pub async fn load_all(
        &self,
        table: &'static str,
        columns: &'static [Column],
    ) -> SyncResult<Vec<Map<String, Value>>> {
        self.load_where(table, columns, Vec::new()).await
    }

    /// Load the rows matching every `(column, value)` equality.
    pub async fn load_where(
        &self,
        table: &'static str,
        columns: &'static [Column],
        filters: Vec<(String, Value)>,
    ) -> SyncResult<Vec<Map<String, Value>>> {
        let request = StorageRequest::LoadWhere {
            table,
            columns,
            filters,
        };
        match self.call(request).await? {
            StorageResponse::Rows(rows) => Ok(rows),
            other => Err(unexpected(other)),
        }
    }

    /// Insert (or replace) a row with the given id.
    pub async fn insert(
        &self,
        table: &'static str,
        columns: &'static [Column],
        id: i64,
        fields: Map<String, Value>,
    ) -> SyncResult<()> {
        self.call_done(StorageRequest::Insert {
            table,
            columns,
            id,
            fields,
        })
        .await
    }

    /// Update the persisted columns present in `fields`.
    pub async fn update(
        &self,
        table: &'static str,
        columns: &'static [Column],
        id: i64,
        fields: Map<String, Value>,
    ) -> SyncResult<()> {
        self.call_done(StorageRequest::Update {
            table,
            columns,
            id,
            fields,
        })
        .await
    }

    /// Delete a row.
    pub async fn delete(&self, table: &'static str, id: i64) -> SyncResult<()> {
        self.call_done(StorageRequest::Delete { table, id }).await
    }

    /// Replace the raw source table.
    pub async fn replace_dataset(
        &self,
        columns: Vec<String>,
        rows: Vec<(i64, Vec<Value>)>,
    ) -> SyncResult<()> {
        self.call_done(StorageRequest::ReplaceDataset { columns, rows })
            .await
    }

    /// Data dimensions available in the raw source table.
    pub async fn dataset_columns(&self) -> SyncResult<Vec<String>> {
        match self.call(StorageRequest::DatasetColumns).await? {
            StorageResponse::Columns(columns) => Ok(columns),
            other => Err(unexpected(other)),
        }
    }

    /// Raw `(row id, x, y)` values from the union of the upstream views, or
    /// from the raw source table when there is no upstream.
    pub async fn source_rows(
        &self,
        upstreams: Vec<i64>,
        dim_x: String,
        dim_y: String,
    ) -> SyncResult<Vec<SourceRow>> {
        let request = StorageRequest::SourceRows {
            upstreams,
            dim_x,
            dim_y,
        };
        match self.call(request).await? {
            StorageResponse::Source(rows) => Ok(rows),
            other => Err(unexpected(other)),
        }
    }

    /// Recreate a plot's exposed view. `kept` restricts the view to the given
    /// row ids; `None` exposes every source row.
    pub async fn replace_view(
        &self,
        plot_id: i64,
        upstreams: Vec<i64>,
        kept: Option<Vec<i64>>,
    ) -> SyncResult<()> {
        self.call_done(StorageRequest::ReplaceView {
            plot_id,
            upstreams,
            kept,
        })
        .await
    }

    /// Drop a plot's exposed view.
    pub async fn drop_view(&self, plot_id: i64) -> SyncResult<()> {
        self.call_done(StorageRequest::DropView { plot_id }).await
    }
}

fn unexpected(response: StorageResponse) -> SyncError {
    SyncError::storage(format!("unexpected storage response: {response:?}"))
}
