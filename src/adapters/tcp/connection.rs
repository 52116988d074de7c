//! Framed TCP connection task.
//!
//! One task per socket. It reads and decodes frames, sends a heartbeat every
//! interval, drops the peer after a silent heartbeat timeout and writes
//! outbound envelopes queued by the engine. A connection is addressable only
//! after registering; from then on it reports exactly one `Disconnected`.

use super::codec::{Frame, FrameCodec, ProtocolCodec, HEARTBEAT};
use super::{ConnectionSettings, DecodeResult, EncodeResult, ReadBuffer};
use crate::adapters::{AdapterEvent, ClientKey, Envelope, EventSender};
use crate::core::error::{SyncError, SyncResult};
use crate::net::tcp::ConnectionId;
use crate::store::ClientKind;
use std::future::pending;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};

/// How a connection identifies itself.
#[derive(Debug, Clone)]
pub enum Registration {
    /// Waits for a `register` message and registers as this kind.
    OnMessage(ClientKind),
    /// Registers immediately under a fixed identity.
    Fixed(ClientKey),
}

/// Why a connection loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    HeartbeatTimeout,
    Evicted,
    Shutdown,
    Error,
}

/// State of one framed connection.
pub struct FramedConnection {
    conn: ConnectionId,
    settings: ConnectionSettings,
    codec: FrameCodec,
    read_buffer: ReadBuffer,
    registration: Registration,
    key: Option<ClientKey>,
    outbound: Option<mpsc::UnboundedReceiver<Envelope>>,
    events: EventSender,
    last_heard: Instant,
}

impl FramedConnection {
    /// Create the connection state.
    pub fn new(
        conn: ConnectionId,
        settings: ConnectionSettings,
        registration: Registration,
        events: EventSender,
    ) -> Self {
        Self {
            conn,
            settings,
            codec: FrameCodec::new(settings.max_frame_bytes),
            read_buffer: ReadBuffer::new(64 * 1024, settings.read_buffer_limit),
            registration,
            key: None,
            outbound: None,
            events,
            last_heard: Instant::now(),
        }
    }

    /// Registered identity, if any.
    pub fn key(&self) -> Option<&ClientKey> {
        self.key.as_ref()
    }

    fn register(&mut self, key: ClientKey) -> SyncResult<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        tracing::info!(conn = %self.conn, client = %key, "client registered");
        self.events
            .send(AdapterEvent::Connected {
                key: key.clone(),
                conn: self.conn,
                outbound: tx,
            })
            .map_err(|_| SyncError::ChannelClosed { name: "adapter events" })?;
        self.key = Some(key);
        self.outbound = Some(rx);
        Ok(())
    }

    /// Handle one decoded message frame.
    fn on_message(&mut self, value: serde_json::Value) -> SyncResult<()> {
        let envelope: Envelope = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(conn = %self.conn, error = %e, "dropping malformed envelope");
                return Ok(());
            }
        };

        let Some(key) = self.key.clone() else {
            let kind = match &self.registration {
                Registration::OnMessage(kind) => *kind,
                Registration::Fixed(_) => return Ok(()),
            };
            match envelope.registration_name() {
                Some(name) => self.register(ClientKey::new(name, kind))?,
                None => tracing::warn!(
                    conn = %self.conn,
                    command = %envelope.command,
                    "dropping message from unregistered connection"
                ),
            }
            return Ok(());
        };

        if envelope.registration_name().is_some() {
            tracing::debug!(conn = %self.conn, client = %key, "ignoring repeated registration");
            return Ok(());
        }
        self.events
            .send(AdapterEvent::Message {
                key,
                conn: self.conn,
                envelope,
            })
            .map_err(|_| SyncError::ChannelClosed { name: "adapter events" })
    }

    /// Append read bytes and process every complete frame.
    pub fn on_bytes(&mut self, data: &[u8]) -> SyncResult<()> {
        self.read_buffer.extend(data)?;
        loop {
            match self.codec.decode(self.read_buffer.buffer_mut()) {
                DecodeResult::Complete(Frame::Heartbeat) => self.last_heard = Instant::now(),
                DecodeResult::Complete(Frame::Message(value)) => {
                    self.last_heard = Instant::now();
                    self.on_message(value)?;
                }
                DecodeResult::Incomplete => return Ok(()),
                DecodeResult::Invalid(reason) => {
                    tracing::warn!(conn = %self.conn, reason = %reason, "framing error");
                }
            }
        }
    }

    fn encode(&self, envelope: &Envelope) -> Option<bytes::Bytes> {
        let value = match serde_json::to_value(envelope) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(conn = %self.conn, error = %e, "failed to encode envelope");
                return None;
            }
        };
        match self.codec.encode(&Frame::Message(value)) {
            EncodeResult::Ok(bytes) => Some(bytes),
            EncodeResult::Error(e) => {
                tracing::warn!(conn = %self.conn, error = %e, "failed to encode frame");
                None
            }
        }
    }

    /// Drive the connection until it closes, then report the disconnect.
    pub async fn run<R, W>(
        mut self,
        mut reader: R,
        mut writer: W,
        mut shutdown: watch::Receiver<bool>,
    ) -> CloseReason
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if let Registration::Fixed(key) = self.registration.clone() {
            if self.register(key).is_err() {
                return CloseReason::Shutdown;
            }
        }

        let mut heartbeat = interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut chunk = vec![0u8; 16 * 1024];

        let reason = loop {
            tokio::select! {
                result = reader.read(&mut chunk) => match result {
                    Ok(0) => break CloseReason::PeerClosed,
                    Ok(n) => {
                        if let Err(e) = self.on_bytes(&chunk[..n]) {
                            tracing::warn!(conn = %self.conn, error = %e, "closing connection");
                            break CloseReason::Error;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(conn = %self.conn, error = %e, "read failed");
                        break CloseReason::Error;
                    }
                },

                _ = heartbeat.tick() => {
                    if self.last_heard.elapsed() > self.settings.heartbeat_timeout {
                        tracing::warn!(conn = %self.conn, "heartbeat timeout");
                        break CloseReason::HeartbeatTimeout;
                    }
                    if let Err(e) = writer.write_all(HEARTBEAT).await {
                        tracing::warn!(conn = %self.conn, error = %e, "heartbeat send failed");
                        break CloseReason::Error;
                    }
                }

                outbound = next_outbound(&mut self.outbound) => match outbound {
                    Some(envelope) => {
                        let Some(bytes) = self.encode(&envelope) else { continue };
                        if let Err(e) = writer.write_all(&bytes).await {
                            tracing::warn!(conn = %self.conn, error = %e, "send failed");
                            break CloseReason::Error;
                        }
                    }
                    None => break CloseReason::Evicted,
                },

                _ = shutdown.changed() => break CloseReason::Shutdown,
            }
        };

        let _ = writer.shutdown().await;
        if let Some(key) = self.key.take() {
            tracing::info!(conn = %self.conn, client = %key, ?reason, "client disconnected");
            let _ = self.events.send(AdapterEvent::Disconnected {
                key,
                conn: self.conn,
            });
        }
        reason
    }
}

/// Next queued envelope. Pends forever before registration; `None` once the
/// engine dropped the queue.
async fn next_outbound(outbound: &mut Option<mpsc::UnboundedReceiver<Envelope>>) -> Option<Envelope> {
    match outbound {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}
