//! Framed TCP transport.
//!
//! Native AR clients and the tracking service speak a null-delimited,
//! length-prefixed JSON framing over raw TCP with a 100ms heartbeat in both
//! directions.

pub mod codec;
pub mod connection;
pub mod service;

pub use service::{TcpGateway, TcpRole};

use crate::core::config::ProtocolConfig;
use crate::core::error::{SyncError, SyncResult};
use bytes::{Bytes, BytesMut};
use std::time::Duration;

/// Result of decoding a frame from the wire.
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// A complete frame was decoded.
    Complete(T),
    /// More data is needed to complete the frame.
    Incomplete,
    /// The input is invalid. The offending bytes have been skipped.
    Invalid(String),
}

/// Result of encoding a frame to the wire.
#[derive(Debug)]
pub enum EncodeResult {
    /// Successfully encoded.
    Ok(Bytes),
    /// Encoding failed.
    Error(String),
}

/// Per-connection protocol settings.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Interval between outbound heartbeats.
    pub heartbeat_interval: Duration,
    /// Silence after which the peer is considered gone.
    pub heartbeat_timeout: Duration,
    /// Largest accepted frame payload.
    pub max_frame_bytes: usize,
    /// Largest amount of unparsed bytes kept.
    pub read_buffer_limit: usize,
}

impl From<&ProtocolConfig> for ConnectionSettings {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            max_frame_bytes: config.max_frame_bytes,
            read_buffer_limit: config.read_buffer_limit,
        }
    }
}

/// Read buffer for streaming frame parsing.
#[derive(Debug)]
pub struct ReadBuffer {
    /// Internal buffer.
    buffer: BytesMut,

    /// Maximum buffer size.
    max_size: usize,
}

impl ReadBuffer {
    /// Create a new read buffer.
    pub fn new(capacity: usize, max_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity.min(max_size)),
            max_size,
        }
    }

    /// Append data to the buffer.
    pub fn extend(&mut self, data: &[u8]) -> SyncResult<()> {
        if self.buffer.len() + data.len() > self.max_size {
            return Err(SyncError::BufferOverflow {
                buffered: self.buffer.len(),
                incoming: data.len(),
                limit: self.max_size,
            });
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Get a reference to buffered data.
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Mutable access for codecs that consume from the front.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Check if buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Get buffer length.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Get remaining capacity before max_size.
    pub fn remaining_capacity(&self) -> usize {
        self.max_size.saturating_sub(self.buffer.len())
    }
}
