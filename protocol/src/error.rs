use std::io;
use std::string::FromUtf8Error;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("string payload is not UTF-8: {0}")]
    Utf8(#[from] FromUtf8Error),

    #[error("unknown daemon action {0}")]
    UnknownAction(u8),

    #[error("unknown mount namespace kind {0}")]
    UnknownNamespace(u8),

    #[error("peer sent no file descriptor")]
    MissingDescriptor,

    #[error("length {0} exceeds the frame limit")]
    Oversized(usize),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
