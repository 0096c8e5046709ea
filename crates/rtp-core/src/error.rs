//! Error types for RTP operations

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    #[error("Unsupported RTP version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
