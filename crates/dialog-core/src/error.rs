//! Error types for the dialog layer

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Signaling socket failure; fatal at bind time, logged mid-call
    #[error("SIP transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sip(#[from] dialcast_sip_core::Error),

    #[error(transparent)]
    Rtp(#[from] dialcast_rtp_core::Error),

    /// The server challenged a request that already carried credentials
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    /// An operation referenced a call the engine is not tracking
    #[error("unknown call {0}")]
    UnknownCall(String),

    /// The engine's receive loop has stopped
    #[error("engine stopped")]
    EngineStopped,
}
