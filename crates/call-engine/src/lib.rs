//! Broadcast orchestration for dialcast
//!
//! Everything above the SIP/RTP layers: the first-wins DTMF
//! confirmation pipeline, the per-call timer limiter, the per-recipient
//! dialer, the single-flight broadcast queue, the post-hoc timing
//! validator, and the audio transcode collaborator. Persistence and
//! presentation stay behind the [`queue::BroadcastProcessor`] and
//! confirmation-channel seams.

pub mod audio;
pub mod confirm;
pub mod dialer;
pub mod error;
pub mod limiter;
pub mod logging;
pub mod queue;
pub mod validator;

pub use error::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

pub use audio::{AudioTranscoder, ProcessTranscoder};
pub use confirm::{Confirmation, ConfirmationPipeline};
pub use dialer::{BroadcastDialer, CallReport, DialOutcome, DialerConfig};
pub use limiter::{CallLimiter, CallStats, LimiterConfig, TeardownReason, TimerSet};
pub use queue::{BroadcastProcessor, BroadcastQueue, QueueConfig};
pub use validator::{BroadcastValidator, ValidationReport, ValidatorConfig};
