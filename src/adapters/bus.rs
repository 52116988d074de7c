//! WebSocket message bus for web/tablet clients.
//!
//! Each connection carries JSON envelopes in text frames. The first envelope
//! must be a `register` naming the client; a later connection registering the
//! same name evicts the earlier one.

use super::{AdapterEvent, ClientKey, Envelope, EventSender, ListenerHandle};
use crate::core::error::SyncResult;
use crate::net::tcp::{ConnectionId, TcpConnection, TcpListener, TcpListenerConfig};
use crate::store::ClientKind;
use futures_util::{SinkExt, StreamExt};
use std::future::pending;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// WebSocket gateway.
pub struct BusGateway {
    listener: Arc<TcpListener>,
    events: EventSender,
    shutdown: watch::Receiver<bool>,
}

impl BusGateway {
    /// Create a gateway for the given bind address.
    pub fn new(bind_addr: SocketAddr, events: EventSender, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            listener: Arc::new(TcpListener::new(
                TcpListenerConfig::new(bind_addr),
                shutdown.clone(),
            )),
            events,
            shutdown,
        }
    }

    /// Bind and spawn the accept loop.
    pub async fn start(self) -> SyncResult<ListenerHandle> {
        let socket = self.listener.bind().await?;
        let local_addr = socket.local_addr()?;
        tracing::info!(addr = %local_addr, "message bus listener started");

        let task = tokio::spawn(async move {
            loop {
                match self.listener.accept(&socket).await {
                    Ok(Some(connection)) => self.spawn_connection(connection),
                    Ok(None) => break,
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
            self.listener.shutdown();
            self.listener.stopped();
            tracing::info!("message bus listener stopped");
        });

        Ok(ListenerHandle { local_addr, task })
    }

    fn spawn_connection(&self, connection: TcpConnection) {
        let conn = connection.id;
        let listener = Arc::clone(&self.listener);
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            serve(conn, connection, events, shutdown).await;
            listener.connection_closed();
        });
    }
}

async fn next_outbound(outbound: &mut Option<mpsc::UnboundedReceiver<Envelope>>) -> Option<Envelope> {
    match outbound {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn serve(
    conn: ConnectionId,
    connection: TcpConnection,
    events: EventSender,
    mut shutdown: watch::Receiver<bool>,
) {
    let remote = connection.remote_addr;
    let ws = match accept_async(connection.into_stream()).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(conn = %conn, remote = %remote, error = %e, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    let mut key: Option<ClientKey> = None;
    let mut outbound: Option<mpsc::UnboundedReceiver<Envelope>> = None;

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!(conn = %conn, "dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(conn = %conn, error = %e, "websocket read failed");
                        break;
                    }
                };
                let envelope: Envelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!(conn = %conn, error = %e, "dropping malformed envelope");
                        continue;
                    }
                };
                match &key {
                    Some(key) => {
                        if events.send(AdapterEvent::Message { key: key.clone(), conn, envelope }).is_err() {
                            break;
                        }
                    }
                    None => {
                        let Some(name) = envelope.registration_name() else {
                            tracing::warn!(conn = %conn, command = %envelope.command, "dropping message from unregistered connection");
                            continue;
                        };
                        let registered = ClientKey::new(name, ClientKind::Web);
                        let (tx, rx) = mpsc::unbounded_channel();
                        if events.send(AdapterEvent::Connected { key: registered.clone(), conn, outbound: tx }).is_err() {
                            break;
                        }
                        tracing::info!(conn = %conn, client = %registered, "web client registered");
                        key = Some(registered);
                        outbound = Some(rx);
                    }
                }
            }

            message = next_outbound(&mut outbound) => match message {
                Some(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(conn = %conn, error = %e, "failed to encode envelope");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::warn!(conn = %conn, error = %e, "send failed");
                        break;
                    }
                }
                None => {
                    tracing::info!(conn = %conn, "connection evicted");
                    break;
                }
            },

            _ = shutdown.changed() => break,
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    if let Some(key) = key {
        tracing::info!(conn = %conn, client = %key, "web client disconnected");
        let _ = events.send(AdapterEvent::Disconnected { key, conn });
    }
}
