//! Transport seam between the coordinator and the device link.
//!
//! A transport offers two primitives: an immediate message that needs the
//! peer to be reachable, and last-write-wins context replication that is
//! stored and forwarded. `MemoryLink` is an in-process pair used by tests and
//! the simulator.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use workout_sync_protocol::{encode_envelope, DeviceRole, SyncEnvelope, MAX_ENVELOPE_BYTES};

use crate::coordinator::WorkoutCoordinator;
use crate::error::ChannelError;

pub trait Transport: Send {
    fn is_reachable(&self) -> bool;

    fn is_paired(&self) -> bool;

    /// Sends an envelope that needs the peer right now. A transport that can
    /// wait for the reply returns it; one that cannot returns `Ok(None)` and
    /// the reply arrives later as an inbound envelope.
    fn send_message(
        &mut self,
        envelope: &SyncEnvelope,
        timeout: Duration,
    ) -> Result<Option<SyncEnvelope>, ChannelError>;

    /// Replaces the replicated context. Accepted even while the peer is
    /// unreachable.
    fn update_context(&mut self, envelope: &SyncEnvelope) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Immediate,
    Context,
}

#[derive(Debug, Clone)]
pub struct SentEnvelope {
    pub from: DeviceRole,
    pub mode: DeliveryMode,
    pub envelope: SyncEnvelope,
}

#[derive(Debug)]
struct LinkState {
    reachable: bool,
    paired: bool,
    scripted_failures: u32,
    messages: HashMap<DeviceRole, VecDeque<SyncEnvelope>>,
    contexts: HashMap<DeviceRole, SyncEnvelope>,
    sent: Vec<SentEnvelope>,
}

/// Shared handle to an in-memory link between a handheld and a wearable.
#[derive(Debug, Clone)]
pub struct MemoryLink {
    state: Arc<Mutex<LinkState>>,
}

impl Default for MemoryLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LinkState {
                reachable: true,
                paired: true,
                scripted_failures: 0,
                messages: HashMap::new(),
                contexts: HashMap::new(),
                sent: Vec::new(),
            })),
        }
    }

    pub fn transport(&self, role: DeviceRole) -> MemoryTransport {
        MemoryTransport {
            role,
            link: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn set_paired(&self, paired: bool) {
        self.lock().paired = paired;
    }

    /// The next `count` immediate sends time out regardless of reachability.
    pub fn fail_next(&self, count: u32) {
        self.lock().scripted_failures = count;
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<SentEnvelope> {
        self.lock().sent.clone()
    }

    pub fn sent_by(&self, role: DeviceRole) -> Vec<SentEnvelope> {
        self.lock()
            .sent
            .iter()
            .filter(|sent| sent.from == role)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }

    /// Hands a reply back to `recipient` as an inbound envelope.
    pub fn route_reply(&self, recipient: DeviceRole, envelope: SyncEnvelope) {
        self.lock()
            .messages
            .entry(recipient)
            .or_default()
            .push_back(envelope);
    }

    /// Drains what `recipient` can receive now: queued messages first, then
    /// the latest context. Nothing moves while the link is unreachable.
    pub fn take_deliveries(&self, recipient: DeviceRole) -> Vec<SyncEnvelope> {
        let mut state = self.lock();
        if !state.reachable {
            return Vec::new();
        }
        let mut deliveries: Vec<SyncEnvelope> = state
            .messages
            .get_mut(&recipient)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default();
        if let Some(context) = state.contexts.remove(&recipient) {
            deliveries.push(context);
        }
        deliveries
    }

    /// Delivers pending envelopes in both directions until the link is quiet
    /// or `max_rounds` is reached. Replies are routed back to the sender.
    pub fn pump(
        &self,
        first: &mut WorkoutCoordinator,
        second: &mut WorkoutCoordinator,
        max_rounds: usize,
    ) -> usize {
        let mut delivered = 0;
        for _ in 0..max_rounds {
            let moved = self.deliver_to(first) + self.deliver_to(second);
            if moved == 0 {
                break;
            }
            delivered += moved;
        }
        delivered
    }

    fn deliver_to(&self, coordinator: &mut WorkoutCoordinator) -> usize {
        let role = coordinator.role();
        let deliveries = self.take_deliveries(role);
        let count = deliveries.len();
        for envelope in deliveries {
            if let Some(reply) = coordinator.handle_inbound(envelope) {
                self.route_reply(role.peer(), reply);
            }
        }
        count
    }
}

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    role: DeviceRole,
    link: MemoryLink,
}

impl MemoryTransport {
    fn record(state: &mut LinkState, from: DeviceRole, mode: DeliveryMode, envelope: &SyncEnvelope) {
        state.sent.push(SentEnvelope {
            from,
            mode,
            envelope: envelope.clone(),
        });
    }
}

impl Transport for MemoryTransport {
    fn is_reachable(&self) -> bool {
        let state = self.link.lock();
        state.paired && state.reachable
    }

    fn is_paired(&self) -> bool {
        self.link.lock().paired
    }

    fn send_message(
        &mut self,
        envelope: &SyncEnvelope,
        timeout: Duration,
    ) -> Result<Option<SyncEnvelope>, ChannelError> {
        check_encodable(envelope)?;
        let mut state = self.link.lock();
        if !state.paired {
            return Err(ChannelError::NotPaired);
        }
        if state.scripted_failures > 0 {
            state.scripted_failures -= 1;
            return Err(ChannelError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        if !state.reachable {
            return Err(ChannelError::Unreachable);
        }
        Self::record(&mut state, self.role, DeliveryMode::Immediate, envelope);
        state
            .messages
            .entry(self.role.peer())
            .or_default()
            .push_back(envelope.clone());
        Ok(None)
    }

    fn update_context(&mut self, envelope: &SyncEnvelope) -> Result<(), ChannelError> {
        check_encodable(envelope)?;
        let mut state = self.link.lock();
        if !state.paired {
            return Err(ChannelError::NotPaired);
        }
        Self::record(&mut state, self.role, DeliveryMode::Context, envelope);
        state.contexts.insert(self.role.peer(), envelope.clone());
        Ok(())
    }
}

/// The link refuses what the peer could not decode.
fn check_encodable(envelope: &SyncEnvelope) -> Result<(), ChannelError> {
    let bytes = encode_envelope(envelope).map_err(|err| ChannelError::Rejected(err.to_string()))?;
    if bytes.len() > MAX_ENVELOPE_BYTES {
        return Err(ChannelError::Rejected(format!(
            "{} bytes exceeds {}",
            bytes.len(),
            MAX_ENVELOPE_BYTES
        )));
    }
    Ok(())
}
