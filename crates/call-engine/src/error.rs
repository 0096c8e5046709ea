//! Error types for the orchestration layer

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Dialog(#[from] dialcast_dialog_core::Error),

    /// The external transcode process failed or produced no audio
    #[error("audio transcode failed: {0}")]
    Transcode(String),

    #[error("configuration error: {0}")]
    Config(String),
}
