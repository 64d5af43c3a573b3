//! # workout-sync-core
//!
//! Keeps one workout consistent across a handheld and a wearable that are
//! independently clocked and only sometimes reachable.
//!
//! ## Design Principles
//!
//! - **Single owner**: one [`WorkoutCoordinator`] per device holds every piece
//!   of mutable state. Wrap it with [`spawn_coordinator`] to drive it from
//!   several threads.
//! - **Synchronous**: no async runtime. Time comes from a [`Clock`], so tests
//!   and the simulator run on a [`ManualClock`].
//! - **Graceful degradation**: an unreachable peer is never an error; the
//!   circuit opens and this device tracks everything itself.
//! - **Monotonic progress**: elapsed time, distance and calories never go
//!   backwards on either device.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use workout_sync_core::*;
//!
//! let link = MemoryLink::new();
//! let mut handheld = WorkoutCoordinator::new(
//!     DeviceRole::Handheld,
//!     ActivityKind::Run,
//!     load_config(None)?,
//!     Box::new(link.transport(DeviceRole::Handheld)),
//!     Arc::new(SystemClock),
//!     Box::new(DiscardFinalizer),
//! );
//! handheld.start()?;
//! ```

pub mod actor;
pub mod channel;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod guard;
pub mod handoff;
pub mod ownership;
pub mod persist;
pub mod resilience;
pub mod sensors;
pub mod session;
pub mod transport;

pub use actor::{spawn_coordinator, CoordinatorHandle};
pub use channel::{Lane, SendOutcome, SendReport, SyncChannel};
pub use clock::{Clock, ManualClock, PauseAccountant, SystemClock};
pub use config::*;
pub use coordinator::{RemoteOffer, WorkoutCoordinator};
pub use error::{ChannelError, CoreError, FinalizeError, Result};
pub use events::{ChangeSource, CoordinatorEvent};
pub use guard::{ApplyContext, EnvelopeSignature, LoopGuard};
pub use handoff::{resolve_handoff, HandoffPlan, HandoffResolution};
pub use ownership::{evaluate, DeviceHealth, LocationQuality, OwnershipArbitrator};
pub use persist::{DiscardFinalizer, JsonFileFinalizer, SessionFinalizer};
pub use resilience::{BreakerState, BreakerTransition, CircuitBreaker, RateLimiter, RetryBackoff};
pub use sensors::{classify_location, HeartRateSample, LocationSample};
pub use session::{
    activity_profile, ActivityProfile, Intent, MetricsPatch, TransitionOutcome, WorkoutSession,
    WorkoutSnapshot,
};
pub use transport::{DeliveryMode, MemoryLink, MemoryTransport, SentEnvelope, Transport};

pub use workout_sync_protocol::{
    ActivityKind, DeviceRole, LifecycleState, Message, MessageKind, MetricKind, MetricsSnapshot,
    Owner, OwnershipTable, SyncEnvelope, WorkoutStatus,
};
