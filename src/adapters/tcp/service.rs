//! Framed TCP gateway service.
//!
//! Accepts sockets and spawns one [`FramedConnection`] task per socket. The
//! native listener waits for each client to register; the tracker listener
//! registers every connection under the fixed tracker identity.

use super::connection::{FramedConnection, Registration};
use super::ConnectionSettings;
use crate::adapters::{ClientKey, EventSender, ListenerHandle};
use crate::core::error::SyncResult;
use crate::net::tcp::{TcpListener, TcpListenerConfig};
use crate::store::ClientKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Which framed listener this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpRole {
    /// Native AR clients.
    Native,
    /// The tracking service.
    Tracker,
}

impl TcpRole {
    fn registration(self) -> Registration {
        match self {
            Self::Native => Registration::OnMessage(ClientKind::Ar),
            Self::Tracker => Registration::Fixed(ClientKey::tracker()),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Tracker => "tracker",
        }
    }
}

/// Framed TCP gateway.
pub struct TcpGateway {
    role: TcpRole,
    listener: Arc<TcpListener>,
    settings: ConnectionSettings,
    events: EventSender,
    shutdown: watch::Receiver<bool>,
}

impl TcpGateway {
    /// Create a gateway for the given bind address.
    pub fn new(
        role: TcpRole,
        bind_addr: SocketAddr,
        settings: ConnectionSettings,
        events: EventSender,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            role,
            listener: Arc::new(TcpListener::new(
                TcpListenerConfig::new(bind_addr),
                shutdown.clone(),
            )),
            settings,
            events,
            shutdown,
        }
    }

    /// Bind and spawn the accept loop.
    pub async fn start(self) -> SyncResult<ListenerHandle> {
        let socket = self.listener.bind().await?;
        let local_addr = socket.local_addr()?;
        tracing::info!(listener = self.role.name(), addr = %local_addr, "framed TCP listener started");

        let task = tokio::spawn(async move {
            loop {
                match self.listener.accept(&socket).await {
                    Ok(Some(connection)) => self.spawn_connection(connection),
                    Ok(None) => break,
                    Err(e) => tracing::warn!(listener = self.role.name(), error = %e, "accept failed"),
                }
            }
            self.listener.shutdown();
            self.listener.stopped();
            tracing::info!(listener = self.role.name(), "framed TCP listener stopped");
        });

        Ok(ListenerHandle { local_addr, task })
    }

    fn spawn_connection(&self, connection: crate::net::tcp::TcpConnection) {
        let conn = connection.id;
        tracing::debug!(conn = %conn, remote = %connection.remote_addr, "accepted");
        let state = FramedConnection::new(
            conn,
            self.settings,
            self.role.registration(),
            self.events.clone(),
        );
        let listener = Arc::clone(&self.listener);
        let shutdown = self.shutdown.clone();
        let (reader, writer) = connection.into_split();
        tokio::spawn(async move {
            let reason = state.run(reader, writer, shutdown).await;
            tracing::debug!(conn = %conn, ?reason, "connection closed");
            listener.connection_closed();
        });
    }
}
