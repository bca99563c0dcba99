use thiserror::Error;

use crate::token::StreamId;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Already subscribed to stream {0}")]
    AlreadySubscribed(StreamId),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Unsupported protocol for stream {0}: only TCP tokens are supported")]
    UnsupportedProtocol(StreamId),
}

pub type StreamResult<T> = Result<T, StreamError>;
