//! Call lifecycle limiter
//!
//! Every tracked call carries a set of timers keyed by purpose: ring
//! timeout while unanswered, then duration limit and DTMF wait once
//! answered, then a short grace period once confirmed so the caller
//! hears the end of the announcement before the BYE. A firing timer
//! does not tear the call down itself; it asks for teardown on a
//! channel, and the consumer runs exactly one teardown per call. The
//! DTMF wait is the exception: it only logs that no digit has arrived,
//! and the duration limit remains the enforcing timer.
//! Cancelling is atomic and idempotent: once a call's timer set is
//! cancelled, no member can fire afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Timeouts applied to every call
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// How long an unanswered call may ring
    pub max_ring_time: Duration,
    /// How long an answered call may run without confirmation
    pub max_call_duration: Duration,
    /// How long after answer before the lack of a digit is logged; the
    /// call keeps running until the duration limit
    pub dtmf_timeout: Duration,
    /// Delay between confirmation and teardown, so the tail of the
    /// announcement is heard
    pub confirm_end_delay: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_ring_time: Duration::from_secs(30),
            max_call_duration: Duration::from_secs(15),
            dtmf_timeout: Duration::from_secs(10),
            confirm_end_delay: Duration::from_secs(2),
        }
    }
}

/// What a call's timers are for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerPurpose {
    Ring,
    Duration,
    DtmfWait,
    Grace,
}

/// Why a call is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    RingTimeout,
    DurationLimit,
    Confirmed,
    RemoteHangup,
}

/// A timer set for one call, cancellable as a unit.
///
/// `cancel_all` flips a flag checked again by each timer task right
/// before it fires, so a timer that was mid-flight when the set was
/// cancelled becomes a no-op instead of a late teardown.
pub struct TimerSet {
    timers: Mutex<HashMap<TimerPurpose, JoinHandle<()>>>,
    cancelled: AtomicBool,
}

impl TimerSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            timers: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Arm (or re-arm) the timer for `purpose`
    pub fn arm<F>(self: &Arc<Self>, purpose: TimerPurpose, delay: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        // The deadline is fixed here, not at first poll of the task, so
        // it is measured from the arm call
        let deadline = Instant::now() + delay;
        let set = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if set.cancelled.load(Ordering::Acquire) {
                return;
            }
            set.timers.lock().remove(&purpose);
            on_fire();
        });
        if let Some(old) = self.timers.lock().insert(purpose, task) {
            old.abort();
        }
    }

    /// Cancel one timer; a no-op if it never existed or already fired
    pub fn cancel(&self, purpose: TimerPurpose) {
        if let Some(task) = self.timers.lock().remove(&purpose) {
            task.abort();
        }
    }

    /// Cancel every timer. Idempotent; after this returns no member of
    /// the set can fire.
    pub fn cancel_all(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        for (_, task) in self.timers.lock().drain() {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A timer asking for its call to be torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownRequest {
    pub call_id: String,
    pub reason: TeardownReason,
}

/// Durations recorded when a call ends, whatever the outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStats {
    pub ring_duration: Duration,
    pub talk_duration: Option<Duration>,
    pub reason: TeardownReason,
}

struct TrackedCall {
    number: String,
    timers: Arc<TimerSet>,
    started_at: Instant,
    answered_at: Option<Instant>,
}

/// Per-call timer bookkeeping for one backend instance
pub struct CallLimiter {
    config: LimiterConfig,
    calls: Mutex<HashMap<String, TrackedCall>>,
    teardown_tx: mpsc::UnboundedSender<TeardownRequest>,
}

impl CallLimiter {
    pub fn new(config: LimiterConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<TeardownRequest>) {
        let (teardown_tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                config,
                calls: Mutex::new(HashMap::new()),
                teardown_tx,
            }),
            rx,
        )
    }

    fn request(&self, call_id: &str, reason: TeardownReason) {
        debug!("timer requests teardown of {} ({:?})", call_id, reason);
        let _ = self.teardown_tx.send(TeardownRequest {
            call_id: call_id.to_string(),
            reason,
        });
    }

    /// Start tracking a ringing call and arm its ring timeout
    pub fn track(self: &Arc<Self>, call_id: &str, number: &str) {
        let timers = TimerSet::new();
        {
            let limiter = self.clone();
            let id = call_id.to_string();
            timers.arm(TimerPurpose::Ring, self.config.max_ring_time, move || {
                limiter.request(&id, TeardownReason::RingTimeout);
            });
        }
        self.calls.lock().insert(
            call_id.to_string(),
            TrackedCall {
                number: number.to_string(),
                timers,
                started_at: Instant::now(),
                answered_at: None,
            },
        );
    }

    /// Start tracking a call that has already answered, back-dating the
    /// record so the ring phase survives into the stats
    pub fn track_answered(self: &Arc<Self>, call_id: &str, number: &str, rang_for: Duration) {
        let now = Instant::now();
        self.calls.lock().insert(
            call_id.to_string(),
            TrackedCall {
                number: number.to_string(),
                timers: TimerSet::new(),
                started_at: now.checked_sub(rang_for).unwrap_or(now),
                answered_at: None,
            },
        );
        self.on_answered(call_id);
    }

    /// The call answered: disarm the ring timer, arm the duration limit
    /// and the DTMF wait. The DTMF wait never requests teardown; a
    /// silent callee keeps hearing the announcement until the duration
    /// limit.
    pub fn on_answered(self: &Arc<Self>, call_id: &str) {
        let mut calls = self.calls.lock();
        let Some(call) = calls.get_mut(call_id) else {
            return;
        };
        call.answered_at = Some(Instant::now());
        call.timers.cancel(TimerPurpose::Ring);

        let limiter = self.clone();
        let id = call_id.to_string();
        call.timers.arm(
            TimerPurpose::Duration,
            self.config.max_call_duration,
            move || limiter.request(&id, TeardownReason::DurationLimit),
        );
        let id = call_id.to_string();
        let waited = self.config.dtmf_timeout;
        call.timers
            .arm(TimerPurpose::DtmfWait, waited, move || {
                info!("call {}: no DTMF within {:?}, still playing", id, waited);
            });
    }

    /// The call confirmed: disarm the answer-phase timers and arm the
    /// grace period before teardown
    pub fn on_confirmed(self: &Arc<Self>, call_id: &str) {
        let calls = self.calls.lock();
        let Some(call) = calls.get(call_id) else {
            return;
        };
        call.timers.cancel(TimerPurpose::Duration);
        call.timers.cancel(TimerPurpose::DtmfWait);

        let limiter = self.clone();
        let id = call_id.to_string();
        call.timers
            .arm(TimerPurpose::Grace, self.config.confirm_end_delay, move || {
                limiter.request(&id, TeardownReason::Confirmed)
            });
    }

    /// Run the single teardown path for a call: atomically cancel every
    /// timer, drop the record, and return its durations.
    ///
    /// Returns `None` if the call was already torn down, which is how
    /// a second teardown trigger becomes a no-op.
    pub fn teardown(&self, call_id: &str, reason: TeardownReason) -> Option<CallStats> {
        let call = self.calls.lock().remove(call_id)?;
        // First step, so no stale timer can fire mid-teardown
        call.timers.cancel_all();

        let now = Instant::now();
        let stats = CallStats {
            ring_duration: call
                .answered_at
                .unwrap_or(now)
                .duration_since(call.started_at),
            talk_duration: call.answered_at.map(|at| now.duration_since(at)),
            reason,
        };
        info!(
            "call {} ({}) ended: {:?}, rang {:.1}s, talked {:.1}s",
            call_id,
            call.number,
            reason,
            stats.ring_duration.as_secs_f64(),
            stats.talk_duration.unwrap_or_default().as_secs_f64()
        );
        Some(stats)
    }

    /// Number of calls currently tracked
    pub fn active_calls(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Drop for CallLimiter {
    fn drop(&mut self) {
        let mut calls = self.calls.lock();
        if !calls.is_empty() {
            warn!("limiter dropped with {} call(s) still tracked", calls.len());
        }
        for (_, call) in calls.drain() {
            call.timers.cancel_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn test_ring_timeout_fires() {
        let (limiter, mut rx) = CallLimiter::new(LimiterConfig::default());
        limiter.track("c1", "998887766");

        advance(Duration::from_secs(31)).await;
        let req = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(req.reason, TeardownReason::RingTimeout);

        let stats = limiter.teardown("c1", req.reason).unwrap();
        assert!(stats.talk_duration.is_none());
        assert!(stats.ring_duration >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_disarms_ring_timer() {
        let (limiter, mut rx) = CallLimiter::new(LimiterConfig::default());
        limiter.track("c1", "998887766");

        advance(Duration::from_secs(29)).await;
        limiter.on_answered("c1");

        // Well past the ring deadline; the next request must come from
        // the duration limit, never a late ring timeout
        advance(Duration::from_secs(20)).await;
        let req = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(req.reason, TeardownReason::DurationLimit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dtmf_wait_does_not_tear_down() {
        let (limiter, mut rx) = CallLimiter::new(LimiterConfig::default());
        limiter.track("c1", "998887766");
        limiter.on_answered("c1");

        // Past the 10s DTMF wait but short of the 15s duration limit:
        // the call must still be running
        advance(Duration::from_secs(12)).await;
        assert!(timeout(WAIT, rx.recv()).await.is_err());
        assert_eq!(limiter.active_calls(), 1);

        advance(Duration::from_secs(4)).await;
        let req = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(req.reason, TeardownReason::DurationLimit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_answered_backdates_ring() {
        let (limiter, _rx) = CallLimiter::new(LimiterConfig::default());
        limiter.track_answered("c1", "998887766", Duration::from_secs(7));

        advance(Duration::from_secs(3)).await;
        let stats = limiter
            .teardown("c1", TeardownReason::RemoteHangup)
            .unwrap();
        assert_eq!(stats.ring_duration, Duration::from_secs(7));
        assert_eq!(stats.talk_duration, Some(Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_grace_period() {
        let (limiter, mut rx) = CallLimiter::new(LimiterConfig::default());
        limiter.track("c1", "998887766");
        limiter.on_answered("c1");

        advance(Duration::from_secs(5)).await;
        limiter.on_confirmed("c1");

        // Only the grace timer is left; it fires after confirm_end_delay
        let req = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(req.reason, TeardownReason::Confirmed);

        let stats = limiter.teardown("c1", req.reason).unwrap();
        assert!(stats.talk_duration.unwrap() >= Duration::from_secs(7));

        // Duration and DTMF timers were cancelled, nothing else fires
        advance(Duration::from_secs(60)).await;
        assert!(timeout(WAIT, rx.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_is_exactly_once() {
        let (limiter, mut rx) = CallLimiter::new(LimiterConfig::default());
        limiter.track("c1", "998887766");
        limiter.on_answered("c1");

        assert!(limiter
            .teardown("c1", TeardownReason::RemoteHangup)
            .is_some());
        assert!(limiter
            .teardown("c1", TeardownReason::RemoteHangup)
            .is_none());
        assert_eq!(limiter.active_calls(), 0);

        // No timer outlives the teardown
        advance(Duration::from_secs(120)).await;
        assert!(timeout(WAIT, rx.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_is_idempotent() {
        let fired = Arc::new(AtomicBool::new(false));
        let set = TimerSet::new();
        {
            let fired = fired.clone();
            set.arm(TimerPurpose::Ring, Duration::from_secs(5), move || {
                fired.store(true, Ordering::SeqCst);
            });
        }
        set.cancel_all();
        set.cancel_all();
        assert!(set.is_cancelled());

        // Arming after cancellation is a no-op too
        {
            let fired = fired.clone();
            set.arm(TimerPurpose::Grace, Duration::from_millis(1), move || {
                fired.store(true, Ordering::SeqCst);
            });
        }
        advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let set = TimerSet::new();
        for label in ["first", "second"] {
            let tx = tx.clone();
            set.arm(TimerPurpose::Duration, Duration::from_secs(3), move || {
                let _ = tx.send(label);
            });
        }
        advance(Duration::from_secs(4)).await;
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some("second"));
        assert!(timeout(WAIT, rx.recv()).await.is_err());
    }
}
