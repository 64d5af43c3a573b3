//! Observer notifications.
//!
//! Observers receive events over an `mpsc` channel. A dropped receiver is
//! pruned on the next emit.

use serde::Serialize;
use std::sync::mpsc::{self, Receiver, Sender};
use workout_sync_protocol::{LifecycleState, MetricsSnapshot, OwnershipTable, WorkoutStatus};

use crate::handoff::HandoffResolution;
use crate::session::WorkoutSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    LifecycleChanged {
        session_id: Option<String>,
        state: LifecycleState,
        source: ChangeSource,
    },
    MetricsUpdated {
        metrics: MetricsSnapshot,
    },
    OwnershipChanged {
        table: OwnershipTable,
    },
    /// The circuit opened or closed.
    PeerAvailabilityChanged {
        available: bool,
    },
    PeerReachabilityChanged {
        reachable: bool,
    },
    /// The peer is tracking a workout this idle device could join.
    RemoteWorkoutAvailable {
        session_id: String,
        status: WorkoutStatus,
    },
    HandoffResolved {
        session_id: String,
        resolution: HandoffResolution,
    },
    HandoffAccepted {
        session_id: String,
    },
    EnvelopeSuppressed {
        kind: &'static str,
    },
    SessionCompleted {
        snapshot: WorkoutSnapshot,
    },
    FinalizeFailed {
        session_id: String,
        message: String,
    },
}

#[derive(Debug, Default)]
pub struct Observers {
    senders: Vec<Sender<CoordinatorEvent>>,
}

impl Observers {
    pub fn subscribe(&mut self) -> Receiver<CoordinatorEvent> {
        let (tx, rx) = mpsc::channel();
        self.senders.push(tx);
        rx
    }

    pub fn emit(&mut self, event: CoordinatorEvent) {
        self.senders.retain(|sender| sender.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}
