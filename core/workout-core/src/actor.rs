//! Runs a coordinator on its own thread.
//!
//! Transport callbacks, sensor pipelines and timers submit commands through a
//! cloneable [`CoordinatorHandle`]; the owning thread applies them in arrival
//! order and ticks the coordinator when it is idle.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use workout_sync_protocol::SyncEnvelope;

use crate::coordinator::WorkoutCoordinator;
use crate::error::{CoreError, Result};
use crate::events::CoordinatorEvent;
use crate::ownership::DeviceHealth;
use crate::sensors::{HeartRateSample, LocationSample};
use crate::session::{MetricsPatch, TransitionOutcome, WorkoutSnapshot};

type Reply<T> = Sender<T>;

enum Command {
    Start(Reply<Result<TransitionOutcome>>),
    Pause(Reply<Result<TransitionOutcome>>),
    Resume(Reply<Result<TransitionOutcome>>),
    End(Reply<Result<WorkoutSnapshot>>),
    AcceptJoin(Reply<Result<WorkoutSnapshot>>),
    HandOff(Reply<Result<()>>),
    RequestActiveWorkout,
    SetIndoor(bool),
    Inbound {
        envelope: SyncEnvelope,
        reply: Option<Reply<Option<SyncEnvelope>>>,
    },
    Location(LocationSample),
    HeartRate(HeartRateSample),
    Metrics(MetricsPatch),
    Background(bool),
    Tick,
    Snapshot(Reply<WorkoutSnapshot>),
    Health(Reply<DeviceHealth>),
    Subscribe(Reply<Receiver<CoordinatorEvent>>),
    Shutdown,
}

#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: Sender<Command>,
}

/// Moves `coordinator` onto a dedicated thread that ticks it every
/// `tick_interval`, however busy the command queue is. Joining the returned handle
/// after [`CoordinatorHandle::shutdown`] gives the coordinator back.
pub fn spawn_coordinator(
    coordinator: WorkoutCoordinator,
    tick_interval: Duration,
) -> Result<(CoordinatorHandle, JoinHandle<WorkoutCoordinator>)> {
    let (tx, rx) = mpsc::channel();
    let name = format!("workout-coordinator-{}", coordinator.role().as_str());
    let join = thread::Builder::new()
        .name(name)
        .spawn(move || run(coordinator, rx, tick_interval))
        .map_err(|e| CoreError::Io {
            context: "spawning coordinator thread".to_string(),
            source: e,
        })?;
    Ok((CoordinatorHandle { tx }, join))
}

fn run(
    mut coordinator: WorkoutCoordinator,
    rx: Receiver<Command>,
    tick_interval: Duration,
) -> WorkoutCoordinator {
    info!(role = coordinator.role().as_str(), "Coordinator thread started");
    let mut next_tick = Instant::now() + tick_interval;
    loop {
        let now = Instant::now();
        if now >= next_tick {
            coordinator.tick();
            next_tick = now + tick_interval;
        }
        match rx.recv_timeout(next_tick.saturating_duration_since(Instant::now())) {
            Ok(Command::Shutdown) => break,
            Ok(command) => apply(&mut coordinator, command),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!(role = coordinator.role().as_str(), "Coordinator thread stopped");
    coordinator
}

// A requester that gave up on its reply is not an error.
fn apply(coordinator: &mut WorkoutCoordinator, command: Command) {
    match command {
        Command::Start(reply) => {
            let _ = reply.send(coordinator.start());
        }
        Command::Pause(reply) => {
            let _ = reply.send(coordinator.pause());
        }
        Command::Resume(reply) => {
            let _ = reply.send(coordinator.resume());
        }
        Command::End(reply) => {
            let _ = reply.send(coordinator.end());
        }
        Command::AcceptJoin(reply) => {
            let _ = reply.send(coordinator.accept_join());
        }
        Command::HandOff(reply) => {
            let _ = reply.send(coordinator.hand_off());
        }
        Command::RequestActiveWorkout => coordinator.request_active_workout(),
        Command::SetIndoor(indoor) => coordinator.set_indoor(indoor),
        Command::Inbound { envelope, reply } => {
            let response = coordinator.handle_inbound(envelope);
            match reply {
                Some(reply) => {
                    let _ = reply.send(response);
                }
                None if response.is_some() => {
                    debug!("Inbound reply dropped; sender did not wait for one");
                }
                None => {}
            }
        }
        Command::Location(sample) => coordinator.record_location(sample),
        Command::HeartRate(sample) => coordinator.record_heart_rate(sample),
        Command::Metrics(patch) => coordinator.record_local_metrics(patch),
        Command::Background(true) => coordinator.enter_background(),
        Command::Background(false) => coordinator.enter_foreground(),
        Command::Tick => coordinator.tick(),
        Command::Snapshot(reply) => {
            let _ = reply.send(coordinator.snapshot());
        }
        Command::Health(reply) => {
            let _ = reply.send(coordinator.health());
        }
        Command::Subscribe(reply) => {
            let _ = reply.send(coordinator.subscribe());
        }
        Command::Shutdown => {}
    }
}

impl CoordinatorHandle {
    pub fn start(&self) -> Result<TransitionOutcome> {
        self.request(Command::Start)?
    }

    pub fn pause(&self) -> Result<TransitionOutcome> {
        self.request(Command::Pause)?
    }

    pub fn resume(&self) -> Result<TransitionOutcome> {
        self.request(Command::Resume)?
    }

    pub fn end(&self) -> Result<WorkoutSnapshot> {
        self.request(Command::End)?
    }

    pub fn accept_join(&self) -> Result<WorkoutSnapshot> {
        self.request(Command::AcceptJoin)?
    }

    pub fn hand_off(&self) -> Result<()> {
        self.request(Command::HandOff)?
    }

    pub fn request_active_workout(&self) -> Result<()> {
        self.send(Command::RequestActiveWorkout)
    }

    pub fn set_indoor(&self, indoor: bool) -> Result<()> {
        self.send(Command::SetIndoor(indoor))
    }

    /// Hands an inbound envelope to the coordinator and waits for the reply,
    /// if any.
    pub fn deliver(&self, envelope: SyncEnvelope) -> Result<Option<SyncEnvelope>> {
        self.request(|reply| Command::Inbound {
            envelope,
            reply: Some(reply),
        })
    }

    /// Fire-and-forget variant of [`deliver`](Self::deliver) for context
    /// updates, which never expect a reply.
    pub fn deliver_context(&self, envelope: SyncEnvelope) -> Result<()> {
        self.send(Command::Inbound {
            envelope,
            reply: None,
        })
    }

    pub fn record_location(&self, sample: LocationSample) -> Result<()> {
        self.send(Command::Location(sample))
    }

    pub fn record_heart_rate(&self, sample: HeartRateSample) -> Result<()> {
        self.send(Command::HeartRate(sample))
    }

    pub fn record_local_metrics(&self, patch: MetricsPatch) -> Result<()> {
        self.send(Command::Metrics(patch))
    }

    pub fn enter_background(&self) -> Result<()> {
        self.send(Command::Background(true))
    }

    pub fn enter_foreground(&self) -> Result<()> {
        self.send(Command::Background(false))
    }

    pub fn tick(&self) -> Result<()> {
        self.send(Command::Tick)
    }

    pub fn snapshot(&self) -> Result<WorkoutSnapshot> {
        self.request(Command::Snapshot)
    }

    pub fn health(&self) -> Result<DeviceHealth> {
        self.request(Command::Health)
    }

    pub fn subscribe(&self) -> Result<Receiver<CoordinatorEvent>> {
        self.request(Command::Subscribe)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| CoreError::CoordinatorStopped)
    }

    fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(command(reply_tx))?;
        reply_rx.recv().map_err(|_| CoreError::CoordinatorStopped)
    }
}
