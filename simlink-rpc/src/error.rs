//! Error types for the RPC transport

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Remote error from {method}: {error}")]
    Remote { method: String, error: Value },

    #[error("Connection closed")]
    Disconnected,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl TransportError {
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;
