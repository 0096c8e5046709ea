//! SIP dialog management and the outbound transaction engine
//!
//! One [`engine::SipEngine`] per SIP identity: it owns the UDP signaling
//! socket, the Call-ID keyed response dispatch, the registration
//! lifecycle and the minimal UAS behavior (answering keepalive probes,
//! acknowledging BYEs, rejecting inbound calls). Each outbound call is
//! driven through an explicit per-dialog state machine in [`dialog`].

pub mod dialog;
pub mod engine;
pub mod error;
pub mod events;

pub use error::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

pub use dialog::{Dialog, DialogState, DialogTransition};
pub use engine::{CallOptions, CallOutcome, SipConfig, SipEngine};
pub use events::{DtmfMethod, SipEvent};
