//! Frame encoding/decoding.
//!
//! Two shapes travel over a connection:
//!
//! - **Text**: one JSON object.
//! - **Framed binary**: `u32` big-endian header length, that many UTF-8 bytes
//!   of JSON header object, then the remaining bytes as an opaque payload.
//!
//! ```text
//! +----------------+----------------------+------------------+
//! | len: u32 (BE)  | header: len bytes    | payload: rest    |
//! +----------------+----------------------+------------------+
//! ```

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{DecodeError, EncodeError, Result};

/// Size of the header length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// A decoded frame: JSON header plus optional binary payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Map<String, Value>,
    pub payload: Option<Bytes>,
}

impl Frame {
    /// Returns the `type` field of the header, if present.
    pub fn message_type(&self) -> Option<&str> {
        self.header.get("type").and_then(Value::as_str)
    }
}

/// Decode a text message.
pub fn decode_text(text: &str) -> Result<Frame> {
    let value: Value = serde_json::from_str(text)?;
    Ok(Frame {
        header: into_object(value)?,
        payload: None,
    })
}

/// Decode a framed binary message.
///
/// An empty remainder after the header means the frame carries no payload.
pub fn decode_binary(data: &[u8]) -> Result<Frame> {
    if data.len() < LENGTH_PREFIX {
        return Err(DecodeError::Truncated { len: data.len() });
    }

    let declared = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let available = data.len() - LENGTH_PREFIX;
    if declared > available {
        return Err(DecodeError::HeaderOverrun {
            declared,
            available,
        });
    }

    let body_start = LENGTH_PREFIX + declared;
    let header = std::str::from_utf8(&data[LENGTH_PREFIX..body_start])?;
    let value: Value = serde_json::from_str(header)?;

    let payload = if body_start < data.len() {
        Some(Bytes::copy_from_slice(&data[body_start..]))
    } else {
        None
    };

    Ok(Frame {
        header: into_object(value)?,
        payload,
    })
}

/// Encode a header as a text message.
pub fn encode<T: Serialize + ?Sized>(header: &T) -> std::result::Result<String, EncodeError> {
    Ok(serde_json::to_string(header)?)
}

/// Encode a header and payload as a framed binary message.
///
/// The gateway only receives this shape; capture clients produce it.
pub fn encode_framed<T: Serialize + ?Sized>(
    header: &T,
    payload: &[u8],
) -> std::result::Result<Vec<u8>, EncodeError> {
    let header = serde_json::to_vec(header)?;
    let len = u32::try_from(header.len()).map_err(|_| EncodeError::HeaderTooLarge(header.len()))?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX + header.len() + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn into_object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(DecodeError::NotAnObject),
    }
}
