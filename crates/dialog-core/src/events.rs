//! Typed event surface of the engine
//!
//! Every cross-cutting notification goes out on one `mpsc` channel per
//! engine as a [`SipEvent`], so each event has a statically known
//! consumer instead of ad hoc listener registration.

use std::time::Duration;

use dialcast_rtp_core::session::SessionStats;

/// Which detector produced a DTMF observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtmfMethod {
    /// In-band RFC 2833/4733 telephone-event packet
    Rfc2833,
    /// SIP INFO request body
    SipInfo,
    /// Call lasted long enough to count as an implicit confirmation
    DurationHeuristic,
    /// Operator override
    Manual,
}

impl std::fmt::Display for DtmfMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DtmfMethod::Rfc2833 => "rfc2833",
            DtmfMethod::SipInfo => "sip-info",
            DtmfMethod::DurationHeuristic => "duration-heuristic",
            DtmfMethod::Manual => "manual",
        })
    }
}

/// Engine notifications, keyed by Call-ID where call-scoped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipEvent {
    /// 100 received for an outbound INVITE
    Trying { call_id: String },
    /// 180 received
    Ringing { call_id: String },
    /// 183 with early media received
    EarlyMedia { call_id: String },
    /// 200 received and ACKed; media is starting
    Answered {
        call_id: String,
        /// Time from INVITE to answer
        answered_after: Duration,
    },
    /// A de-duplicated digit observation from any detector
    Dtmf {
        call_id: String,
        digit: char,
        method: DtmfMethod,
    },
    /// Terminal failure response before answer
    CallFailed {
        call_id: String,
        code: u16,
        reason: String,
    },
    /// The far end hung up first
    RemoteHangup { call_id: String },
    /// The dialog is gone and its media released
    CallEnded {
        call_id: String,
        stats: Option<SessionStats>,
    },
    /// A re-registration attempt failed; in-flight calls continue
    RegistrationFailed { reason: String },
    /// Registration accepted for `expires` seconds
    Registered { expires: u32 },
}
