//! Wall-clock access and active-time accounting.
//!
//! Elapsed active time is derived, never stored: it is the distance from the
//! start instant minus everything spent paused. That keeps the value correct
//! regardless of how often (or whether) a timer fires.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Shared between clones.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseAccountant {
    started_at: DateTime<Utc>,
    paused_accumulator: Duration,
    current_pause_started_at: Option<DateTime<Utc>>,
}

impl PauseAccountant {
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            paused_accumulator: Duration::zero(),
            current_pause_started_at: None,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn paused_accumulator(&self) -> Duration {
        self.paused_accumulator
    }

    pub fn current_pause_started_at(&self) -> Option<DateTime<Utc>> {
        self.current_pause_started_at
    }

    pub fn is_paused(&self) -> bool {
        self.current_pause_started_at.is_some()
    }

    /// Returns false when already paused.
    pub fn pause(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_paused() {
            return false;
        }
        self.current_pause_started_at = Some(now);
        true
    }

    /// Folds the open pause into the accumulator and returns its length.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        let pause_started_at = self.current_pause_started_at.take()?;
        let paused_for = non_negative(now - pause_started_at);
        self.paused_accumulator += paused_for;
        Some(paused_for)
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        let reference = self.current_pause_started_at.unwrap_or(now);
        non_negative(reference - self.started_at - self.paused_accumulator)
    }

    /// Moves the accounting so that `elapsed` reads `target` at `now`,
    /// keeping the start instant when it can. Used when merging with a peer.
    pub fn rebase(&mut self, target: Duration, now: DateTime<Utc>) {
        let target = non_negative(target);
        let reference = self.current_pause_started_at.unwrap_or(now);
        let accumulator = reference - self.started_at - target;
        if accumulator < Duration::zero() {
            self.started_at = reference - target;
            self.paused_accumulator = Duration::zero();
        } else {
            self.paused_accumulator = accumulator;
        }
    }
}

fn non_negative(value: Duration) -> Duration {
    if value < Duration::zero() {
        Duration::zero()
    } else {
        value
    }
}
