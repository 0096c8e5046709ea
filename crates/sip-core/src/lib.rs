//! SIP message handling for dialcast
//!
//! Text framing and parsing for SIP over UDP, request builders with the
//! fixed header ordering the PBX integrations expect, MD5 digest
//! authentication, and the minimal SDP offer/answer handling an
//! audio-only outbound call needs.
//!
//! This is deliberately not a general RFC 3261 stack. It implements the
//! subset of SIP needed to register against one PBX and drive outbound
//! announcement calls over it.

pub mod auth;
pub mod builder;
pub mod error;
pub mod message;
pub mod sdp;

pub use error::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

pub use auth::{DigestChallenge, DigestCredentials};
pub use builder::SipIdentity;
pub use message::{Headers, Method, Request, Response, SipMessage};
pub use sdp::{SdpAnswer, SdpOffer};
