//! Decoder for the AWS event-stream binary framing used by `converse-stream`.
//!
//! Frame layout (big endian):
//!
//! ```text
//! | total_len u32 | headers_len u32 | prelude_crc u32 | headers | payload | message_crc u32 |
//! ```
//!
//! Both CRCs are CRC-32 (IEEE). The prelude CRC covers the two length
//! fields; the message CRC covers every byte before it.

use crate::core::error::Result;
use crate::core::AppError;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;

const PRELUDE_LEN: usize = 12;
const TRAILER_LEN: usize = 4;
const MIN_FRAME_LEN: usize = PRELUDE_LEN + TRAILER_LEN;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A decoded frame. Only string-valued headers are retained.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub headers: HashMap<String, String>,
    pub payload: Bytes,
}

impl Frame {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// `:message-type`, normally `event`, `exception` or `error`.
    pub fn message_type(&self) -> &str {
        self.header(":message-type").unwrap_or("event")
    }
}

/// Incremental frame decoder. Feed bytes as they arrive, pull complete frames.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: BytesMut,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }

        let total_len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        let headers_len = u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]) as usize;

        let prelude_crc = read_u32(&self.buffer[8..PRELUDE_LEN]);
        if crc32fast::hash(&self.buffer[..8]) != prelude_crc {
            return Err(AppError::BackendUnavailable(
                "Event-stream prelude checksum mismatch".to_string(),
            ));
        }

        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total_len)
            || headers_len > total_len - MIN_FRAME_LEN
        {
            return Err(AppError::BackendUnavailable(format!(
                "Invalid event-stream frame (total {} bytes, headers {} bytes)",
                total_len, headers_len
            )));
        }
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(total_len).freeze();
        let message_crc = read_u32(&frame[total_len - TRAILER_LEN..]);
        if crc32fast::hash(&frame[..total_len - TRAILER_LEN]) != message_crc {
            return Err(AppError::BackendUnavailable(
                "Event-stream message checksum mismatch".to_string(),
            ));
        }
        frame.advance(PRELUDE_LEN);
        let headers = parse_headers(frame.split_to(headers_len))?;
        let payload_len = total_len - MIN_FRAME_LEN - headers_len;
        let payload = frame.split_to(payload_len);

        Ok(Some(Frame { headers, payload }))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn truncated() -> AppError {
    AppError::BackendUnavailable("Truncated event-stream header".to_string())
}

fn parse_headers(mut raw: Bytes) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();

    while raw.has_remaining() {
        let name_len = raw.get_u8() as usize;
        if raw.remaining() < name_len + 1 {
            return Err(truncated());
        }
        let name = String::from_utf8_lossy(&raw.split_to(name_len)).into_owned();
        let value_type = raw.get_u8();

        let skip = match value_type {
            // bool true / false
            0 | 1 => 0,
            2 => 1,
            3 => 2,
            4 => 4,
            5 | 8 => 8,
            9 => 16,
            // byte array / string: u16 length prefix
            6 | 7 => {
                if raw.remaining() < 2 {
                    return Err(truncated());
                }
                let len = raw.get_u16() as usize;
                if raw.remaining() < len {
                    return Err(truncated());
                }
                let value = raw.split_to(len);
                if value_type == 7 {
                    headers.insert(name, String::from_utf8_lossy(&value).into_owned());
                }
                0
            }
            other => {
                return Err(AppError::BackendUnavailable(format!(
                    "Unknown event-stream header type {}",
                    other
                )))
            }
        };

        if raw.remaining() < skip {
            return Err(truncated());
        }
        raw.advance(skip);
    }

    Ok(headers)
}

/// Encode a frame with string headers; used to script backend streams in tests.
pub fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for (name, value) in headers {
        header_bytes.push(name.len() as u8);
        header_bytes.extend_from_slice(name.as_bytes());
        header_bytes.push(7);
        header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header_bytes.extend_from_slice(value.as_bytes());
    }

    let total = MIN_FRAME_LEN + header_bytes.len() + payload.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(total as u32).to_be_bytes());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    let prelude_crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&prelude_crc.to_be_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(payload);
    let message_crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&message_crc.to_be_bytes());
    frame
}
