//! # dialcast-rtp-core
//!
//! RTP media support for the dialcast broadcast dialer: binary packet
//! encoding/decoding, G.711 companding, RFC 2833/4733 telephone-event
//! payloads, a process-wide RTP port allocator and the paced per-call
//! media session.
//!
//! The crate deliberately implements only what an outbound announcement
//! dialer needs: fixed 20 ms ptime, G.711 A-law/μ-law payloads and inline
//! DTMF detection. There is no SRTP, no RTCP reporting and no jitter
//! buffering for inbound audio.

pub mod dtmf;
pub mod error;
pub mod g711;
pub mod packet;
pub mod port;
pub mod session;

pub use error::Error;

/// Result type for RTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// RTP sequence number (16 bits, wraps)
pub type RtpSequenceNumber = u16;

/// RTP timestamp (32 bits, wraps)
pub type RtpTimestamp = u32;

/// RTP synchronization source identifier
pub type RtpSsrc = u32;

/// Packetization time used throughout the dialer (RTP ptime)
pub const PTIME_MS: u64 = 20;

/// Samples per packet at 8 kHz with 20 ms ptime
pub const SAMPLES_PER_PACKET: u32 = 160;

/// Payload bytes per G.711 packet (one byte per sample)
pub const FRAME_SIZE: usize = 160;
