//! Error types for SIP parsing and construction

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The datagram is not a well-formed SIP message
    #[error("malformed SIP message: {0}")]
    Parse(String),

    /// A header the caller requires is absent
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    /// The WWW-Authenticate/Proxy-Authenticate challenge is unusable
    #[error("malformed digest challenge: {0}")]
    Challenge(String),

    /// The SDP body cannot be interpreted
    #[error("malformed SDP: {0}")]
    Sdp(String),
}
