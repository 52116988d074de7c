//! Storage worker thread.
//!
//! Owns the SQLite connection and serves requests one at a time. When the
//! database cannot be opened, requests fail with `StorageUnavailable` until
//! the reconnect backoff has elapsed and a new open attempt succeeds.

use super::sqlite::SqliteBackend;
use super::StorageCommand;
use crate::core::error::SyncError;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Connection state tracked by the worker.
struct Worker {
    database: String,
    backoff: Duration,
    backend: Option<SqliteBackend>,
    retry_at: Option<Instant>,
}

impl Worker {
    fn new(database: String, backoff: Duration) -> Self {
        let mut worker = Self {
            database,
            backoff,
            backend: None,
            retry_at: None,
        };
        worker.connect();
        worker
    }

    fn connect(&mut self) {
        match SqliteBackend::open(&self.database) {
            Ok(backend) => {
                tracing::info!(database = %self.database, "storage connected");
                self.backend = Some(backend);
                self.retry_at = None;
            }
            Err(e) => {
                tracing::warn!(
                    database = %self.database,
                    error = %e,
                    backoff_ms = self.backoff.as_millis() as u64,
                    "storage unavailable, will retry"
                );
                self.backend = None;
                self.retry_at = Some(Instant::now() + self.backoff);
            }
        }
    }

    fn backend(&mut self) -> Option<&mut SqliteBackend> {
        if self.backend.is_none() && self.retry_at.is_some_and(|at| Instant::now() >= at) {
            self.connect();
        }
        self.backend.as_mut()
    }

    fn serve(&mut self, command: StorageCommand) {
        let StorageCommand { request, reply } = command;
        let result = match self.backend() {
            Some(backend) => backend.execute(request),
            None => Err(SyncError::StorageUnavailable {
                message: format!("cannot open {}", self.database),
            }),
        };
        if let Err(ref e) = result {
            tracing::debug!(error = %e, "storage request failed");
        }
        // The caller may have gone away; nothing to do then.
        let _ = reply.send(result);
    }
}

/// Spawn the worker thread. It exits when every handle has been dropped.
pub(crate) fn spawn(
    database: String,
    backoff: Duration,
    mut rx: mpsc::UnboundedReceiver<StorageCommand>,
) {
    let spawned = std::thread::Builder::new()
        .name("plotsync-storage".into())
        .spawn(move || {
            let mut worker = Worker::new(database, backoff);
            while let Some(command) = rx.blocking_recv() {
                worker.serve(command);
            }
            tracing::debug!("storage worker stopped");
        });
    if let Err(e) = spawned {
        // Dropping the receiver makes every call fail with ChannelClosed.
        tracing::error!(error = %e, "failed to spawn storage worker");
    }
}
