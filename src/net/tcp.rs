//! TCP listener abstraction.
//!
//! Shared by the framed-TCP gateway (native and tracker listeners) and the
//! WebSocket gateway, which upgrades accepted streams.

use crate::core::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::watch;

/// TCP listener configuration.
#[derive(Debug, Clone)]
pub struct TcpListenerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// TCP nodelay (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl TcpListenerConfig {
    /// Configuration for the given bind address with default limits.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }
}

impl Default for TcpListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_connections: 1_024,
            nodelay: true,
        }
    }
}

/// TCP listener state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpListenerState {
    /// Not yet started.
    Created,
    /// Binding to address.
    Binding,
    /// Accepting connections.
    Listening,
    /// Shutting down.
    ShuttingDown,
    /// Stopped.
    Stopped,
}

/// Connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Process-wide connection id source, shared by every listener so ids never
/// collide across transports.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// TCP connection wrapper with metadata.
pub struct TcpConnection {
    /// Connection ID.
    pub id: ConnectionId,

    /// Remote address.
    pub remote_addr: SocketAddr,

    /// Underlying TCP stream.
    stream: TcpStream,
}

impl TcpConnection {
    /// Create a new TCP connection.
    pub fn new(id: ConnectionId, stream: TcpStream, remote_addr: SocketAddr) -> Self {
        Self {
            id,
            remote_addr,
            stream,
        }
    }

    /// Take the underlying stream.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    /// Split into read and write halves.
    pub fn into_split(
        self,
    ) -> (
        tokio::net::tcp::OwnedReadHalf,
        tokio::net::tcp::OwnedWriteHalf,
    ) {
        self.stream.into_split()
    }
}

/// TCP listener metrics.
#[derive(Debug, Default)]
pub struct TcpListenerMetrics {
    /// Total connections accepted.
    pub connections_total: AtomicU64,

    /// Currently active connections.
    pub connections_active: AtomicU64,

    /// Connections rejected (at capacity).
    pub connections_rejected: AtomicU64,
}

impl TcpListenerMetrics {
    /// Record a new connection.
    pub fn connection_accepted(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed.
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a rejected connection.
    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get active connection count.
    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }
}

/// TCP listener for accepting connections.
pub struct TcpListener {
    /// Configuration.
    config: TcpListenerConfig,

    /// Current state.
    state: RwLock<TcpListenerState>,

    /// Shutdown flag.
    shutting_down: AtomicBool,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,

    /// Metrics.
    metrics: Arc<TcpListenerMetrics>,
}

impl TcpListener {
    /// Create a new TCP listener.
    pub fn new(config: TcpListenerConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            config,
            state: RwLock::new(TcpListenerState::Created),
            shutting_down: AtomicBool::new(false),
            shutdown_rx,
            metrics: Arc::new(TcpListenerMetrics::default()),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &TcpListenerConfig {
        &self.config
    }

    /// Get the current state.
    pub fn state(&self) -> TcpListenerState {
        *self.state.read()
    }

    /// Get metrics.
    pub fn metrics(&self) -> &Arc<TcpListenerMetrics> {
        &self.metrics
    }

    /// Check if at connection capacity.
    pub fn at_capacity(&self) -> bool {
        self.metrics.active_connections() >= self.config.max_connections as u64
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Bind and start listening.
    pub async fn bind(&self) -> SyncResult<TokioTcpListener> {
        *self.state.write() = TcpListenerState::Binding;

        let listener = TokioTcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                *self.state.write() = TcpListenerState::Stopped;
                SyncError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to bind to {}: {}", self.config.bind_addr, e),
                ))
            })?;

        *self.state.write() = TcpListenerState::Listening;

        Ok(listener)
    }

    /// Accept a connection. Returns `None` once shutdown is signalled.
    pub async fn accept(&self, listener: &TokioTcpListener) -> SyncResult<Option<TcpConnection>> {
        if self.shutting_down.load(Ordering::Relaxed) || *self.shutdown_rx.borrow() {
            return Ok(None);
        }

        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::select! {
            result = listener.accept() => {
                let (stream, addr) = result?;
                if self.at_capacity() {
                    self.metrics.connection_rejected();
                    tracing::warn!(remote = %addr, "connection limit reached, rejecting");
                    return Err(SyncError::invalid_request("connection limit reached"));
                }
                if self.config.nodelay {
                    let _ = stream.set_nodelay(true);
                }

                let id = self.next_connection_id();
                self.metrics.connection_accepted();

                Ok(Some(TcpConnection::new(id, stream, addr)))
            }
            _ = shutdown_rx.changed() => {
                Ok(None)
            }
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        *self.state.write() = TcpListenerState::ShuttingDown;
    }

    /// Mark as stopped.
    pub fn stopped(&self) {
        *self.state.write() = TcpListenerState::Stopped;
    }

    /// Record connection closed.
    pub fn connection_closed(&self) {
        self.metrics.connection_closed();
    }
}
