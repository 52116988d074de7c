//! Frame codec.
//!
//! Wire format:
//!
//! ```text
//! message:   \0 \0 \0 <ascii decimal payload length> \0 <payload: UTF-8 JSON>
//! heartbeat: \0 \0 \0 h \0
//! ```
//!
//! The decoder scans for the three-null sentinel, so bytes in front of it are
//! skipped and reported, and a frame split across reads stays buffered until
//! its payload is complete.

use super::{DecodeResult, EncodeResult};
use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;

/// Frame sentinel.
const SENTINEL: &[u8; 3] = b"\0\0\0";

/// Encoded heartbeat frame.
pub const HEARTBEAT: &[u8; 5] = b"\0\0\0h\0";

/// Longest accepted length field.
const MAX_LENGTH_DIGITS: usize = 20;

/// Trait for protocol codecs.
pub trait ProtocolCodec: Send + Sync {
    /// The frame type decoded from the wire.
    type Request;

    /// The frame type encoded to the wire.
    type Response;

    /// Attempt to decode one frame, consuming its bytes on `Complete`.
    /// `Invalid` also consumes the bytes it rejects.
    fn decode(&self, buffer: &mut BytesMut) -> DecodeResult<Self::Request>;

    /// Encode a frame to bytes.
    fn encode(&self, response: &Self::Response) -> EncodeResult;

    /// Get the protocol name.
    fn protocol_name(&self) -> &'static str;
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Heartbeat,
    Message(Value),
}

/// Codec for the null-delimited framing.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    /// Create a codec rejecting payloads larger than `max_frame_bytes`.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

fn find_sentinel(data: &[u8]) -> Option<usize> {
    data.windows(SENTINEL.len()).position(|w| w == SENTINEL)
}

/// Number of trailing null bytes, which may be the start of a split sentinel.
fn trailing_nulls(data: &[u8]) -> usize {
    data.iter().rev().take_while(|b| **b == 0).count()
}

impl ProtocolCodec for FrameCodec {
    type Request = Frame;
    type Response = Frame;

    fn decode(&self, buffer: &mut BytesMut) -> DecodeResult<Frame> {
        let Some(start) = find_sentinel(&buffer[..]) else {
            let keep = trailing_nulls(&buffer[..]).min(SENTINEL.len() - 1);
            let junk = buffer.len() - keep;
            if junk == 0 {
                return DecodeResult::Incomplete;
            }
            buffer.advance(junk);
            return DecodeResult::Invalid(format!("skipped {junk} bytes outside a frame"));
        };
        if start > 0 {
            buffer.advance(start);
            return DecodeResult::Invalid(format!("skipped {start} bytes before frame header"));
        }

        let rest = &buffer[SENTINEL.len()..];
        let Some(&first) = rest.first() else {
            return DecodeResult::Incomplete;
        };

        if first == b'h' {
            return match rest.get(1).copied() {
                None => DecodeResult::Incomplete,
                Some(0) => {
                    buffer.advance(HEARTBEAT.len());
                    DecodeResult::Complete(Frame::Heartbeat)
                }
                Some(_) => {
                    buffer.advance(1);
                    DecodeResult::Invalid("malformed heartbeat".into())
                }
            };
        }

        let Some(end) = rest.iter().position(|b| *b == 0) else {
            if rest.len() > MAX_LENGTH_DIGITS || !rest.iter().all(u8::is_ascii_digit) {
                buffer.advance(1);
                return DecodeResult::Invalid("malformed length field".into());
            }
            return DecodeResult::Incomplete;
        };
        let digits = &rest[..end];
        let length = if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            None
        } else {
            std::str::from_utf8(digits)
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
        };
        let Some(length) = length else {
            buffer.advance(1);
            return DecodeResult::Invalid("malformed length field".into());
        };

        let header_len = SENTINEL.len() + end + 1;
        if length > self.max_frame_bytes {
            buffer.advance(header_len);
            return DecodeResult::Invalid(format!(
                "frame of {length} bytes exceeds limit of {}",
                self.max_frame_bytes
            ));
        }
        if buffer.len() < header_len + length {
            return DecodeResult::Incomplete;
        }

        buffer.advance(header_len);
        let payload = buffer.split_to(length);
        match serde_json::from_slice(&payload) {
            Ok(value) => DecodeResult::Complete(Frame::Message(value)),
            Err(e) => DecodeResult::Invalid(format!("payload is not JSON: {e}")),
        }
    }

    fn encode(&self, frame: &Frame) -> EncodeResult {
        match frame {
            Frame::Heartbeat => EncodeResult::Ok(bytes::Bytes::from_static(HEARTBEAT)),
            Frame::Message(value) => match serde_json::to_vec(value) {
                Ok(payload) => {
                    let header = format!("\0\0\0{}\0", payload.len());
                    let mut out = BytesMut::with_capacity(header.len() + payload.len());
                    out.put_slice(header.as_bytes());
                    out.put_slice(&payload);
                    EncodeResult::Ok(out.freeze())
                }
                Err(e) => EncodeResult::Error(e.to_string()),
            },
        }
    }

    fn protocol_name(&self) -> &'static str {
        "framed-json"
    }
}
