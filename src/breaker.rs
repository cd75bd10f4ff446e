//! Failure-counting circuit breaker.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    /// Open, but the cooldown has elapsed and one probe is allowed.
    HalfOpen,
}

/// Counts consecutive failures and opens once a threshold is reached.
///
/// All state is atomic; the breaker is shared between a timer loop and
/// metric readers without locks. `open_since` is milliseconds from the
/// breaker's construction, with zero meaning closed, so the openness
/// decision and the elapsed-cooldown computation read one snapshot.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    epoch: Instant,
    failures: AtomicU32,
    open_since: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            threshold: threshold.max(1),
            cooldown,
            epoch: Instant::now(),
            failures: AtomicU32::new(0),
            open_since: AtomicU64::new(0),
        }
    }

    fn now_millis(&self) -> u64 {
        // Clamped to one so a timestamp is never confused with "closed".
        (self.epoch.elapsed().as_millis() as u64).max(1)
    }

    /// Whether the caller should attempt work: true while closed, and
    /// once per cooldown while open (the half-open probe).
    pub fn should_attempt(&self) -> bool {
        let opened = self.open_since.load(Ordering::Acquire);
        if opened == 0 {
            return true;
        }
        self.now_millis().saturating_sub(opened)
            >= self.cooldown.as_millis() as u64
    }

    /// Reset failures and close.
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        self.open_since.store(0, Ordering::Release);
    }

    /// Count a failure. Returns true only on the closed-to-open
    /// transition; re-opening after a failed probe refreshes the
    /// cooldown silently.
    pub fn record_failure(&self) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.threshold {
            return false;
        }
        let previous =
            self.open_since.swap(self.now_millis(), Ordering::AcqRel);
        previous == 0
    }

    pub fn state(&self) -> BreakerState {
        let opened = self.open_since.load(Ordering::Acquire);
        if opened == 0 {
            BreakerState::Closed
        } else if self.now_millis().saturating_sub(opened)
            >= self.cooldown.as_millis() as u64
        {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }
}
