//! DTMF confirmation pipeline
//!
//! Several detectors can report a digit for the same key press: the RTP
//! telephone-event listener, SIP INFO bodies, and the duration
//! heuristic that treats a call listened to long enough as implicitly
//! confirmed. The pipeline funnels every observation through one gate
//! so each call produces at most one `Confirmation`, no matter how many
//! detectors fire or how often a packet is redelivered.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dialcast_dialog_core::DtmfMethod;

/// The only digit that counts as a broadcast confirmation
pub const CONFIRM_DIGIT: char = '1';

/// A call this long is implicitly confirmed even if the announcement
/// was longer
pub const DURATION_CEILING: Duration = Duration::from_secs(45);

/// Fraction of the announcement length that counts as "listened to it"
const DURATION_FRACTION: f64 = 0.8;

/// The single confirmation a call can produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub call_id: String,
    pub number: String,
    pub digit: char,
    pub method: DtmfMethod,
    /// Time from answer to confirmation
    pub confirmed_after: Duration,
}

struct WatchedCall {
    number: String,
    answered_at: Instant,
    /// Full playback length, preroll and repeats included
    message_duration: Duration,
    confirmed: Option<Confirmation>,
}

/// First-wins confirmation gate for all detectors
pub struct ConfirmationPipeline {
    watched: Mutex<HashMap<String, WatchedCall>>,
    tx: mpsc::UnboundedSender<Confirmation>,
}

impl ConfirmationPipeline {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Confirmation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                watched: Mutex::new(HashMap::new()),
                tx,
            },
            rx,
        )
    }

    /// Start watching an answered call. `message_duration` feeds the
    /// duration heuristic.
    pub fn watch(&self, call_id: &str, number: &str, message_duration: Duration) {
        self.watched.lock().insert(
            call_id.to_string(),
            WatchedCall {
                number: number.to_string(),
                answered_at: Instant::now(),
                message_duration,
                confirmed: None,
            },
        );
    }

    /// Stop watching an ended call
    pub fn unwatch(&self, call_id: &str) {
        self.watched.lock().remove(call_id);
    }

    /// Feed one digit observation through the gate.
    ///
    /// Only [`CONFIRM_DIGIT`] confirms; other digits are logged and
    /// dropped. The first detector to report wins and later observations
    /// for the same call are no-ops.
    pub fn observe(&self, call_id: &str, digit: char, method: DtmfMethod) -> Option<Confirmation> {
        if digit != CONFIRM_DIGIT {
            debug!("call {} pressed {} ({}), not a confirmation", call_id, digit, method);
            return None;
        }

        let mut watched = self.watched.lock();
        let Some(call) = watched.get_mut(call_id) else {
            debug!("digit {} via {} for unwatched call {}", digit, method, call_id);
            return None;
        };
        if call.confirmed.is_some() {
            debug!("call {} already confirmed, ignoring {} report", call_id, method);
            return None;
        }

        let confirmation = Confirmation {
            call_id: call_id.to_string(),
            number: call.number.clone(),
            digit,
            method,
            confirmed_after: call.answered_at.elapsed(),
        };
        call.confirmed = Some(confirmation.clone());
        drop(watched);

        info!(
            "call {} ({}) confirmed via {} after {:.1}s",
            confirmation.call_id,
            confirmation.number,
            confirmation.method,
            confirmation.confirmed_after.as_secs_f64()
        );
        let _ = self.tx.send(confirmation.clone());
        Some(confirmation)
    }

    /// Last-resort detector: a call that stayed up for most of the
    /// announcement, or past the fixed ceiling, counts as confirmed.
    pub fn check_duration(&self, call_id: &str) -> Option<Confirmation> {
        let listened_enough = {
            let watched = self.watched.lock();
            let call = watched.get(call_id)?;
            let elapsed = call.answered_at.elapsed();
            let threshold = call.message_duration.mul_f64(DURATION_FRACTION);
            elapsed >= threshold || elapsed >= DURATION_CEILING
        };
        if !listened_enough {
            return None;
        }
        self.observe(call_id, CONFIRM_DIGIT, DtmfMethod::DurationHeuristic)
    }

    /// The confirmation already recorded for a still-watched call.
    ///
    /// Lets the dial loop pick up a confirmation that arrived through a
    /// side channel, like the manual override, rather than through its
    /// own event stream.
    pub fn confirmation_of(&self, call_id: &str) -> Option<Confirmation> {
        self.watched
            .lock()
            .get(call_id)
            .and_then(|call| call.confirmed.clone())
    }

    /// Operational override: confirm a live call by its phone number
    pub fn confirm_manually(&self, number: &str) -> Option<Confirmation> {
        let call_id = self
            .watched
            .lock()
            .iter()
            .find(|(_, call)| call.number == number)
            .map(|(id, _)| id.clone());
        match call_id {
            Some(id) => self.observe(&id, CONFIRM_DIGIT, DtmfMethod::Manual),
            None => {
                warn!("manual confirmation for {}: no live call", number);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> (ConfirmationPipeline, mpsc::UnboundedReceiver<Confirmation>) {
        ConfirmationPipeline::new()
    }

    #[test]
    fn test_only_digit_one_confirms() {
        let (p, mut rx) = pipeline();
        p.watch("c1", "998887766", Duration::from_secs(10));
        for digit in ['2', '9', '*', '#', 'A'] {
            assert!(p.observe("c1", digit, DtmfMethod::Rfc2833).is_none());
        }
        let c = p.observe("c1", '1', DtmfMethod::Rfc2833).unwrap();
        assert_eq!(c.number, "998887766");
        assert_eq!(c.method, DtmfMethod::Rfc2833);
        assert_eq!(rx.try_recv().unwrap(), c);
    }

    #[test]
    fn test_first_detector_wins() {
        let (p, mut rx) = pipeline();
        p.watch("c1", "998887766", Duration::from_secs(10));
        assert!(p.observe("c1", '1', DtmfMethod::SipInfo).is_some());
        // The RTP detector reporting the same press is a no-op
        assert!(p.observe("c1", '1', DtmfMethod::Rfc2833).is_none());
        assert!(p.confirm_manually("998887766").is_none());

        assert_eq!(rx.try_recv().unwrap().method, DtmfMethod::SipInfo);
        assert!(rx.try_recv().is_err(), "second confirmation leaked");
    }

    #[test]
    fn test_unwatched_call_cannot_confirm() {
        let (p, mut rx) = pipeline();
        assert!(p.observe("ghost", '1', DtmfMethod::Rfc2833).is_none());
        p.watch("c1", "998887766", Duration::from_secs(10));
        p.unwatch("c1");
        assert!(p.observe("c1", '1', DtmfMethod::Rfc2833).is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_manual_confirmation_by_number() {
        let (p, _rx) = pipeline();
        p.watch("c1", "111", Duration::from_secs(10));
        p.watch("c2", "222", Duration::from_secs(10));
        let c = p.confirm_manually("222").unwrap();
        assert_eq!(c.call_id, "c2");
        assert_eq!(c.method, DtmfMethod::Manual);
        assert!(p.confirm_manually("333").is_none());

        // The recorded confirmation stays queryable while watched
        assert_eq!(p.confirmation_of("c2").as_ref(), Some(&c));
        assert!(p.confirmation_of("c1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_heuristic_fraction() {
        let (p, _rx) = pipeline();
        p.watch("c1", "998887766", Duration::from_secs(20));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(p.check_duration("c1").is_none(), "10s of a 20s message");

        tokio::time::advance(Duration::from_secs(6)).await;
        let c = p.check_duration("c1").unwrap();
        assert_eq!(c.method, DtmfMethod::DurationHeuristic);
        assert!(c.confirmed_after >= Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_heuristic_ceiling() {
        let (p, _rx) = pipeline();
        // Message longer than the ceiling
        p.watch("c1", "998887766", Duration::from_secs(120));

        tokio::time::advance(Duration::from_secs(44)).await;
        assert!(p.check_duration("c1").is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(p.check_duration("c1").is_some());
    }
}
