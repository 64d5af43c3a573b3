//! Duplicate and echo suppression for inbound envelopes.
//!
//! Signatures are the message type plus a truncated digest of the payload;
//! the sender timestamp is left out so a peer re-sending the same state a
//! moment later still matches. The window is a bounded ring buffer.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use tracing::debug;
use workout_sync_protocol::{MessageKind, SyncEnvelope};

use crate::config::GuardConfig;

const DIGEST_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeSignature {
    pub kind: MessageKind,
    pub session_id: String,
    pub digest: String,
}

impl EnvelopeSignature {
    pub fn of(envelope: &SyncEnvelope) -> Self {
        let payload = serde_json::to_vec(&envelope.message).unwrap_or_default();
        let mut digest = format!("{:x}", md5::compute(&payload));
        digest.truncate(DIGEST_LEN);
        Self {
            kind: envelope.kind(),
            session_id: envelope.session_id.clone(),
            digest,
        }
    }
}

#[derive(Debug, Clone)]
struct SeenEnvelope {
    signature: EnvelopeSignature,
    seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LoopGuard {
    window: Duration,
    max_repeats: usize,
    capacity: usize,
    recent: VecDeque<SeenEnvelope>,
}

impl LoopGuard {
    pub fn new(config: &GuardConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            window: config.window(),
            max_repeats: config.max_repeats.max(1) as usize,
            capacity,
            recent: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns false when an identical envelope was already processed often
    /// enough inside the window. Accepted envelopes are recorded.
    pub fn should_process(&mut self, envelope: &SyncEnvelope, now: DateTime<Utc>) -> bool {
        self.evict_expired(now);

        let signature = EnvelopeSignature::of(envelope);
        let repeats = self
            .recent
            .iter()
            .filter(|seen| seen.signature == signature)
            .count();
        if repeats >= self.max_repeats {
            debug!(
                kind = signature.kind.as_str(),
                session_id = %signature.session_id,
                repeats,
                "Suppressing repeated envelope"
            );
            return false;
        }

        // A newer lifecycle command makes earlier, different ones obsolete:
        // pause, resume, pause inside one window must all get through.
        if signature.kind.is_lifecycle_control() {
            self.recent.retain(|seen| {
                !(seen.signature.kind.is_lifecycle_control()
                    && seen.signature.kind != signature.kind
                    && seen.signature.session_id == signature.session_id)
            });
        }

        self.recent.push_back(SeenEnvelope {
            signature,
            seen_at: now,
        });
        while self.recent.len() > self.capacity {
            self.recent.pop_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    /// Drops remembered lifecycle commands for `session_id`. Called on every
    /// local transition: after it, the peer repeating an earlier command is
    /// a new request, not an echo.
    pub fn forget_lifecycle(&mut self, session_id: &str) {
        self.recent.retain(|seen| {
            !(seen.signature.kind.is_lifecycle_control() && seen.signature.session_id == session_id)
        });
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.recent.retain(|seen| now - seen.seen_at <= window);
    }
}

/// Who is driving the transition currently being applied. Outbound syncs
/// caused by a remote change are not echoed back to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyContext {
    #[default]
    Local,
    Remote(MessageKind),
}

impl ApplyContext {
    pub fn suppresses_outbound(self) -> bool {
        matches!(self, ApplyContext::Remote(_))
    }
}
