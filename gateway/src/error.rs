//! Error types for the gateway.

use std::io;

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Inbound frame could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] zapdos_wire::DecodeError),

    /// Outbound message could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] zapdos_wire::EncodeError),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Token could not be issued or verified.
    #[error("auth error: {0}")]
    Auth(String),

    /// Storage collaborator failed.
    #[error("store error: {0}")]
    Store(String),

    /// Object storage collaborator failed.
    #[error("blob error: {0}")]
    Blob(String),

    /// Requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A job was dropped before its result arrived (no worker, timeout,
    /// or the worker disconnected).
    #[error("job abandoned: {category}")]
    JobAbandoned { category: String },

    /// Worker output is missing an expected field.
    #[error("unexpected job output: {0}")]
    UnexpectedOutput(String),

    /// The gateway event loop is no longer running.
    #[error("gateway shut down")]
    ShuttingDown,
}
