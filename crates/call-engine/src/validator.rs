//! Post-hoc broadcast audit
//!
//! A finished broadcast's confirmation timestamps are checked against
//! what the dialing capacity could physically have produced. With at
//! most `max_concurrent` lines and a minimum seconds-per-call cycle,
//! `n` confirmations need at least `n / max_concurrent * min_duration`
//! of wall clock; a broadcast that claims to have beaten that (with a
//! 20% margin) is reporting data that cannot be real. Invalid data is
//! never accepted: the suspect confirmations are zeroed and the
//! broadcast marked failed with a note.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

pub const MIN_CALL_DURATION: Duration = Duration::from_secs(5);
pub const MAX_CONCURRENT_CALLS: usize = 10;

/// A confirmation may beat the theoretical minimum by this factor
/// before it is called impossible
const TIMING_MARGIN: f64 = 0.8;

/// Answer-to-confirmation gaps under this are not human key presses
const MIN_REACTION: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub min_call_duration: Duration,
    pub max_concurrent: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_call_duration: MIN_CALL_DURATION,
            max_concurrent: MAX_CONCURRENT_CALLS,
        }
    }
}

/// One recipient's confirmation as persisted by the broadcast layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRecord {
    pub number: String,
    pub answered_at: SystemTime,
    pub confirmed_at: SystemTime,
}

/// Outcome of one audit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    /// One entry per violated check
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastStatus {
    Completed,
    Failed,
}

/// The slice of a broadcast the validator can act on
#[derive(Debug, Clone)]
pub struct BroadcastRecord {
    pub id: u64,
    pub status: BroadcastStatus,
    pub confirmations: Vec<ConfirmationRecord>,
    pub note: Option<String>,
}

pub struct BroadcastValidator {
    config: ValidatorConfig,
}

impl BroadcastValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Check whether a set of confirmations is physically possible
    pub fn validate_timing(&self, confirmations: &[ConfirmationRecord]) -> ValidationReport {
        let mut reasons = Vec::new();
        let n = confirmations.len();
        if n == 0 {
            return ValidationReport {
                valid: true,
                reasons,
            };
        }

        let first = confirmations
            .iter()
            .map(|c| c.confirmed_at)
            .min()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let last = confirmations
            .iter()
            .map(|c| c.confirmed_at)
            .max()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let elapsed = last.duration_since(first).unwrap_or_default();

        let required = self
            .config
            .min_call_duration
            .mul_f64(n as f64 / self.config.max_concurrent as f64);
        let floor = required.mul_f64(TIMING_MARGIN);
        if elapsed < floor {
            reasons.push(format!(
                "{} confirmations in {:.1}s, but {} lines at {:.0}s per call need at least {:.1}s",
                n,
                elapsed.as_secs_f64(),
                self.config.max_concurrent,
                self.config.min_call_duration.as_secs_f64(),
                floor.as_secs_f64()
            ));
        }

        let mut per_instant: HashMap<SystemTime, usize> = HashMap::new();
        for c in confirmations {
            *per_instant.entry(c.confirmed_at).or_default() += 1;
        }
        if let Some((_, &count)) = per_instant.iter().max_by_key(|(_, count)| **count) {
            if count > self.config.max_concurrent {
                reasons.push(format!(
                    "{} confirmations share one timestamp with only {} lines",
                    count, self.config.max_concurrent
                ));
            }
        }

        let instant_presses = confirmations
            .iter()
            .filter(|c| {
                c.confirmed_at
                    .duration_since(c.answered_at)
                    .map(|gap| gap < MIN_REACTION)
                    .unwrap_or(true)
            })
            .count();
        if instant_presses > 0 {
            reasons.push(format!(
                "{} confirmation(s) under {:?} after answer",
                instant_presses, MIN_REACTION
            ));
        }

        debug!(
            "timing audit of {} confirmations over {:.1}s: {}",
            n,
            elapsed.as_secs_f64(),
            if reasons.is_empty() { "ok" } else { "invalid" }
        );
        ValidationReport {
            valid: reasons.is_empty(),
            reasons,
        }
    }

    /// Zero the suspect confirmations and mark the broadcast failed
    pub fn quarantine(&self, broadcast: &mut BroadcastRecord, report: &ValidationReport) {
        warn!(
            "quarantining broadcast {}: {}",
            broadcast.id,
            report.reasons.join("; ")
        );
        broadcast.confirmations.clear();
        broadcast.status = BroadcastStatus::Failed;
        broadcast.note = Some(format!(
            "confirmation data rejected by audit: {}",
            report.reasons.join("; ")
        ));
    }

    /// Audit a broadcast and quarantine it if invalid. Returns whether
    /// the data was accepted.
    pub fn audit(&self, broadcast: &mut BroadcastRecord) -> bool {
        let report = self.validate_timing(&broadcast.confirmations);
        if !report.valid {
            self.quarantine(broadcast, &report);
        }
        report.valid
    }
}
