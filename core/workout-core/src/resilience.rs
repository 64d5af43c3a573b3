//! Circuit breaker, rate limiter and retry backoff for the sync channel.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::cmp;
use tracing::{debug, info, warn};

use crate::config::{BreakerConfig, ChannelConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    /// Cooldown elapsed; the next send is the probe.
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened,
    Closed,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_success_at: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Open or probing. The peer stays demoted until a probe succeeds.
    pub fn is_open(&self) -> bool {
        self.state != BreakerState::Closed
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.last_success_at
    }

    pub fn probe_due(&self, now: DateTime<Utc>) -> bool {
        match (self.state, self.opened_at) {
            (BreakerState::Open, Some(opened_at)) => now - opened_at >= self.cooldown,
            (BreakerState::HalfOpen, _) => true,
            _ => false,
        }
    }

    /// Whether a send may go out now. Moves an expired Open circuit to
    /// HalfOpen so the send becomes the probe.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if self.probe_due(now) {
                    debug!("Circuit cooldown elapsed; probing peer");
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) -> Option<BreakerTransition> {
        self.consecutive_failures = 0;
        self.last_success_at = Some(now);
        if self.state == BreakerState::Closed {
            return None;
        }
        info!("Peer probe succeeded; closing circuit");
        self.state = BreakerState::Closed;
        self.opened_at = None;
        Some(BreakerTransition::Closed)
    }

    /// An unsolicited reply from the peer. Resets the failure count, and
    /// closes the circuit only while a probe is outstanding; an Open circuit
    /// still waits out its cooldown.
    pub fn record_reply(&mut self, now: DateTime<Utc>) -> Option<BreakerTransition> {
        match self.state {
            BreakerState::Open => {
                self.last_success_at = Some(now);
                None
            }
            _ => self.record_success(now),
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) -> Option<BreakerTransition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            BreakerState::HalfOpen => {
                warn!(
                    failures = self.consecutive_failures,
                    "Peer probe failed; circuit stays open"
                );
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
                None
            }
            BreakerState::Open => None,
            BreakerState::Closed if self.consecutive_failures >= self.threshold => {
                warn!(
                    failures = self.consecutive_failures,
                    cooldown_secs = self.cooldown.num_seconds(),
                    "Peer unavailable; opening circuit"
                );
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
                Some(BreakerTransition::Opened)
            }
            BreakerState::Closed => None,
        }
    }
}

/// Admits at most one action per interval.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    last: Option<DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&self, now: DateTime<Utc>) -> bool {
        match self.last {
            Some(last) => now - last >= self.interval || now < last,
            None => true,
        }
    }

    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        if !self.ready(now) {
            return false;
        }
        self.last = Some(now);
        true
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Exponential delay for control-command retries, capped, with a bounded
/// number of attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl RetryBackoff {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            base: config.retry_delay(),
            max: config.retry_max_delay(),
            max_attempts: config.retry_max_attempts,
        }
    }

    /// Delay before retry number `attempt` (0-based), or None once attempts
    /// are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 2i32.checked_pow(attempt).unwrap_or(i32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.max);
        Some(cmp::min(delay, self.max))
    }
}
