//! Sync channel: delivery policy on top of a `Transport`.
//!
//! Control commands go out as immediate messages and fall back to context
//! replication plus a backed-off retry. Steady-state pushes use context
//! replication only, are rate limited per lane, and are skipped while the
//! circuit is open. Control commands are never throttled.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration as StdDuration;
use tracing::{debug, warn};
use workout_sync_protocol::SyncEnvelope;

use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::resilience::{BreakerState, BreakerTransition, CircuitBreaker, RateLimiter, RetryBackoff};
use crate::transport::{DeliveryMode, Transport};

/// Steady-state push categories. Metrics and tracking status each have
/// their own limiter; ownership changes are bound only by the shared context
/// interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Metrics,
    TrackingStatus,
    Ownership,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered {
        mode: DeliveryMode,
        reply: Option<SyncEnvelope>,
    },
    /// Accepted for store-and-forward; a retry may still be pending.
    Queued { retry_scheduled: bool },
    Throttled,
    /// Circuit open; steady-state pushes are not attempted.
    Skipped,
    Dropped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendReport {
    pub outcome: SendOutcome,
    pub breaker: Option<BreakerTransition>,
}

impl SendReport {
    fn new(outcome: SendOutcome) -> Self {
        Self {
            outcome,
            breaker: None,
        }
    }

    pub fn reply(&self) -> Option<&SyncEnvelope> {
        match &self.outcome {
            SendOutcome::Delivered { reply, .. } => reply.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingRetry {
    envelope: SyncEnvelope,
    attempt: u32,
    due_at: DateTime<Utc>,
}

pub struct SyncChannel {
    transport: Box<dyn Transport>,
    breaker: CircuitBreaker,
    reply_timeout: StdDuration,
    context_limiter: RateLimiter,
    metrics_limiter: RateLimiter,
    status_limiter: RateLimiter,
    backoff: RetryBackoff,
    retries: VecDeque<PendingRetry>,
}

impl SyncChannel {
    pub fn new(
        transport: Box<dyn Transport>,
        channel: &ChannelConfig,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            transport,
            breaker,
            reply_timeout: channel.reply_timeout().to_std().unwrap_or_default(),
            context_limiter: RateLimiter::new(channel.context_min_interval()),
            metrics_limiter: RateLimiter::new(channel.metrics_interval()),
            status_limiter: RateLimiter::new(channel.tracking_status_interval()),
            backoff: RetryBackoff::new(channel),
            retries: VecDeque::new(),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn is_reachable(&self) -> bool {
        self.transport.is_reachable()
    }

    pub fn is_paired(&self) -> bool {
        self.transport.is_paired()
    }

    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// Latency-sensitive envelope: immediate first, then context plus a
    /// scheduled retry.
    pub fn send_control(&mut self, envelope: &SyncEnvelope, now: DateTime<Utc>) -> SendReport {
        let mut report = SendReport::new(SendOutcome::Dropped);
        if self.breaker.allow(now) {
            match self.attempt_immediate(envelope, now, &mut report) {
                Ok(reply) => {
                    report.outcome = SendOutcome::Delivered {
                        mode: DeliveryMode::Immediate,
                        reply,
                    };
                    return report;
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        kind = envelope.kind().as_str(),
                        "Immediate send failed; falling back to context"
                    );
                }
            }
        } else {
            debug!(
                kind = envelope.kind().as_str(),
                "Circuit open; sending control command through context only"
            );
        }

        let retry_scheduled = self.schedule_retry(envelope.clone(), 0, now);
        report.outcome = match self.transport.update_context(envelope) {
            Ok(()) => SendOutcome::Queued { retry_scheduled },
            Err(err) => {
                warn!(error = %err, kind = envelope.kind().as_str(), "Context fallback failed");
                report.breaker = report.breaker.or(self.breaker.record_failure(now));
                if retry_scheduled {
                    SendOutcome::Queued { retry_scheduled }
                } else {
                    SendOutcome::Dropped
                }
            }
        };
        report
    }

    /// Sends through both primitives so the peer converges even if it is
    /// unreachable right now.
    pub fn send_durable(&mut self, envelope: &SyncEnvelope, now: DateTime<Utc>) -> SendReport {
        let mut report = SendReport::new(SendOutcome::Dropped);
        let immediate = if self.breaker.allow(now) {
            match self.attempt_immediate(envelope, now, &mut report) {
                Ok(reply) => Some(reply),
                Err(err) => {
                    warn!(error = %err, kind = envelope.kind().as_str(), "Durable immediate send failed");
                    None
                }
            }
        } else {
            None
        };

        let context_ok = match self.transport.update_context(envelope) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, kind = envelope.kind().as_str(), "Durable context update failed");
                false
            }
        };

        report.outcome = match immediate {
            Some(reply) => SendOutcome::Delivered {
                mode: DeliveryMode::Immediate,
                reply,
            },
            None => {
                let retry_scheduled = self.schedule_retry(envelope.clone(), 0, now);
                if context_ok || retry_scheduled {
                    SendOutcome::Queued { retry_scheduled }
                } else {
                    SendOutcome::Dropped
                }
            }
        };
        report
    }

    /// Steady-state push through context replication.
    pub fn push_context(
        &mut self,
        envelope: &SyncEnvelope,
        lane: Lane,
        now: DateTime<Utc>,
    ) -> SendReport {
        if self.breaker.is_open() {
            return SendReport::new(SendOutcome::Skipped);
        }
        if !self.lane_ready(lane, now) {
            debug!(kind = envelope.kind().as_str(), "Context push throttled");
            return SendReport::new(SendOutcome::Throttled);
        }

        let mut report = SendReport::new(SendOutcome::Dropped);
        match self.transport.update_context(envelope) {
            Ok(()) => {
                self.context_limiter.try_acquire(now);
                match lane {
                    Lane::Metrics => self.metrics_limiter.try_acquire(now),
                    Lane::TrackingStatus => self.status_limiter.try_acquire(now),
                    Lane::Ownership => true,
                };
                report.outcome = SendOutcome::Queued {
                    retry_scheduled: false,
                };
            }
            Err(err) => {
                warn!(error = %err, kind = envelope.kind().as_str(), "Context push failed");
                report.breaker = self.breaker.record_failure(now);
            }
        }
        report
    }

    /// Whether a steady-state push on `lane` would be admitted now.
    pub fn lane_ready(&self, lane: Lane, now: DateTime<Utc>) -> bool {
        let lane_ready = match lane {
            Lane::Metrics => self.metrics_limiter.ready(now),
            Lane::TrackingStatus => self.status_limiter.ready(now),
            Lane::Ownership => true,
        };
        lane_ready && self.context_limiter.ready(now)
    }

    pub fn probe_due(&self, now: DateTime<Utc>) -> bool {
        self.breaker.probe_due(now)
    }

    /// Attempts a probe once the cooldown has elapsed.
    pub fn probe(&mut self, envelope: &SyncEnvelope, now: DateTime<Utc>) -> Option<SendReport> {
        if !self.breaker.probe_due(now) || !self.breaker.allow(now) {
            return None;
        }
        let mut report = SendReport::new(SendOutcome::Dropped);
        if let Ok(reply) = self.attempt_immediate(envelope, now, &mut report) {
            report.outcome = SendOutcome::Delivered {
                mode: DeliveryMode::Immediate,
                reply,
            };
        }
        Some(report)
    }

    /// A reply that arrived after the sender moved on still proves the peer
    /// is alive.
    pub fn record_reply(&mut self, now: DateTime<Utc>) -> Option<BreakerTransition> {
        self.breaker.record_reply(now)
    }

    /// Re-attempts control commands whose retry delay has elapsed.
    pub fn poll_retries(&mut self, now: DateTime<Utc>) -> Vec<SendReport> {
        let mut reports = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.retries.len());
        let due: Vec<PendingRetry> = self
            .retries
            .drain(..)
            .filter_map(|retry| {
                if retry.due_at <= now {
                    Some(retry)
                } else {
                    waiting.push_back(retry);
                    None
                }
            })
            .collect();
        self.retries = waiting;

        for retry in due {
            let mut report = SendReport::new(SendOutcome::Dropped);
            let attempt = if self.breaker.allow(now) {
                self.attempt_immediate(&retry.envelope, now, &mut report)
            } else {
                Err(ChannelError::Unreachable)
            };
            match attempt {
                Ok(reply) => {
                    debug!(
                        kind = retry.envelope.kind().as_str(),
                        attempt = retry.attempt + 1,
                        "Retry delivered"
                    );
                    report.outcome = SendOutcome::Delivered {
                        mode: DeliveryMode::Immediate,
                        reply,
                    };
                }
                Err(err) => {
                    let next = retry.attempt + 1;
                    let kind = retry.envelope.kind();
                    if self.schedule_retry(retry.envelope.clone(), next, now) {
                        report.outcome = SendOutcome::Queued {
                            retry_scheduled: true,
                        };
                    } else {
                        // Out of attempts: leave the command in the replicated
                        // context and give up.
                        if let Err(context_err) = self.transport.update_context(&retry.envelope) {
                            warn!(
                                error = %context_err,
                                kind = kind.as_str(),
                                "Final context update failed"
                            );
                        }
                        warn!(
                            error = %err,
                            kind = kind.as_str(),
                            attempts = next,
                            "Dropping control command after retries"
                        );
                    }
                }
            }
            reports.push(report);
        }
        reports
    }

    /// Drops queued retries for `session_id`. Returns how many were dropped.
    pub fn cancel_retries(&mut self, session_id: &str) -> usize {
        let before = self.retries.len();
        self.retries
            .retain(|retry| retry.envelope.session_id != session_id);
        before - self.retries.len()
    }

    fn attempt_immediate(
        &mut self,
        envelope: &SyncEnvelope,
        now: DateTime<Utc>,
        report: &mut SendReport,
    ) -> Result<Option<SyncEnvelope>, ChannelError> {
        match self.transport.send_message(envelope, self.reply_timeout) {
            Ok(reply) => {
                report.breaker = report.breaker.or(self.breaker.record_success(now));
                Ok(reply)
            }
            Err(err) => {
                report.breaker = report.breaker.or(self.breaker.record_failure(now));
                Err(err)
            }
        }
    }

    fn schedule_retry(&mut self, envelope: SyncEnvelope, attempt: u32, now: DateTime<Utc>) -> bool {
        match self.backoff.delay_for(attempt) {
            Some(delay) => {
                self.retries.push_back(PendingRetry {
                    envelope,
                    attempt,
                    due_at: now + delay,
                });
                true
            }
            None => false,
        }
    }
}
