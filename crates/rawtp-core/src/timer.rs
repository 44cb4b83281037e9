//! Retransmission timer with exponential backoff.
//!
//! `timeout(retry) = initial * 2^retry`, armed only while it stays below
//! `max`. The first retry count that reaches the ceiling aborts the
//! transfer, and so does every larger one.
//!
//! Expiry is delivered on a per-connection single-shot channel
//! (`crossbeam_channel::after`). The dispatcher consumes it at its poll point
//! with [`RetransmitTimer::poll_expired`]; nothing runs on expiry by itself.

use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

/// Default first retransmission timeout.
pub const INITIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Backoff ceiling. A computed timeout at or above this aborts.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(8);

/// Adjustable timeout parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    pub initial_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_timeout: INITIAL_TIMEOUT,
            max_timeout: MAX_TIMEOUT,
        }
    }
}

/// Result of arming the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arm {
    Armed(Duration),
    Abort,
}

impl TimerConfig {
    /// Effective timeout for `retry_count`, or `Abort` once the ceiling is hit.
    ///
    /// A caller-supplied timeout strictly between zero and the ceiling is
    /// used as is.
    pub fn backoff(&self, custom: Option<Duration>, retry_count: u32) -> Arm {
        if let Some(t) = custom {
            if !t.is_zero() && t < self.max_timeout {
                return Arm::Armed(t);
            }
        }
        let factor = match 1u32.checked_shl(retry_count) {
            Some(f) => f,
            None => return Arm::Abort,
        };
        match self.initial_timeout.checked_mul(factor) {
            Some(t) if t < self.max_timeout => Arm::Armed(t),
            _ => Arm::Abort,
        }
    }
}

/// Per-connection timer state for the outstanding transmission.
#[derive(Debug)]
pub struct RetransmitTimer {
    config: TimerConfig,
    retry_count: u32,
    current_timeout: Option<Duration>,
    expiry: Option<Receiver<Instant>>,
}

impl RetransmitTimer {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            config,
            retry_count: 0,
            current_timeout: None,
            expiry: None,
        }
    }

    pub fn config(&self) -> &TimerConfig {
        &self.config
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn current_timeout(&self) -> Option<Duration> {
        self.current_timeout
    }

    pub fn is_armed(&self) -> bool {
        self.expiry.is_some()
    }

    /// Arm a single-shot timer for the current retry count.
    ///
    /// Replaces any pending expiry. On `Abort` nothing is armed.
    pub fn arm(&mut self, custom: Option<Duration>) -> Arm {
        let outcome = self.config.backoff(custom, self.retry_count);
        match outcome {
            Arm::Armed(timeout) => {
                self.current_timeout = Some(timeout);
                self.expiry = Some(crossbeam_channel::after(timeout));
            }
            Arm::Abort => {
                self.current_timeout = None;
                self.expiry = None;
            }
        }
        outcome
    }

    /// Arm only if nothing is pending.
    pub fn ensure_armed(&mut self) -> Arm {
        match self.current_timeout {
            Some(timeout) if self.is_armed() => Arm::Armed(timeout),
            _ => self.arm(None),
        }
    }

    /// Count an expiry and re-arm with the next backoff step.
    pub fn back_off(&mut self) -> Arm {
        self.retry_count = self.retry_count.saturating_add(1);
        self.arm(None)
    }

    /// Drop any pending expiry. The retry count is kept.
    pub fn disarm(&mut self) {
        self.expiry = None;
        self.current_timeout = None;
    }

    /// Disarm and forget previous retries; the next transmission starts fresh.
    pub fn reset(&mut self) {
        self.disarm();
        self.retry_count = 0;
    }

    /// Edge-triggered expiry check. Returns true once per expiry and leaves
    /// the timer disarmed.
    pub fn poll_expired(&mut self) -> bool {
        let fired = self
            .expiry
            .as_ref()
            .is_some_and(|rx| rx.try_recv().is_ok());
        if fired {
            self.disarm();
        }
        fired
    }
}
