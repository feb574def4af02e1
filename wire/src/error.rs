//! Error types for the wire codec.

/// Result type alias for decoding.
pub type Result<T> = std::result::Result<T, DecodeError>;

/// Failure to turn raw connection bytes into a message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Binary frame shorter than the 4-byte length prefix.
    #[error("frame too short: {len} bytes, need at least 4")]
    Truncated { len: usize },

    /// Header length prefix points past the end of the frame.
    #[error("header length {declared} exceeds available {available} bytes")]
    HeaderOverrun { declared: usize, available: usize },

    /// Header bytes are not valid UTF-8.
    #[error("header is not utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Header is not valid JSON or does not match the message shape.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// Header parsed but is not a JSON object.
    #[error("header is not a json object")]
    NotAnObject,

    /// Header has no string `type` field.
    #[error("missing message type")]
    MissingType,

    /// Header `type` is not part of the protocol.
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// Failure to serialize an outbound message.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("serialize: {0}")]
    Json(#[from] serde_json::Error),

    #[error("header too large: {0} bytes")]
    HeaderTooLarge(usize),
}
