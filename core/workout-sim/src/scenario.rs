//! Scenario files and their replay.
//!
//! A scenario is a JSON list of timed steps. Both devices share one manual
//! clock and one in-memory link; between steps the clock advances a second at
//! a time, both coordinators tick, and the link is pumped until quiet.

use chrono::{DateTime, Duration, TimeZone, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::{info, warn};
use workout_sync_core::{
    ActivityKind, CoordinatorConfig, CoordinatorEvent, DeviceRole, DiscardFinalizer,
    HeartRateSample, LifecycleState, LocationSample, ManualClock, MemoryLink, MetricsPatch,
    SessionFinalizer, WorkoutCoordinator, WorkoutSnapshot,
};

const PUMP_ROUNDS: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("Failed to read scenario {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Scenario is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Step {index} ({action}) needs a device")]
    MissingDevice { index: usize, action: &'static str },

    #[error("Step {index} is scheduled before the previous step")]
    OutOfOrder { index: usize },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default = "default_kind")]
    pub activity_kind: ActivityKind,
    pub steps: Vec<Step>,
}

fn default_kind() -> ActivityKind {
    ActivityKind::Run
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub at_secs: i64,
    #[serde(default)]
    pub device: Option<DeviceRole>,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Start,
    Pause,
    Resume,
    End,
    AcceptJoin,
    HandOff,
    RequestActiveWorkout,
    SetIndoor {
        indoor: bool,
    },
    Location {
        horizontal_accuracy: f64,
        #[serde(default)]
        distance: Option<f64>,
        #[serde(default)]
        speed: Option<f64>,
    },
    HeartRate {
        bpm: f64,
    },
    Metrics {
        #[serde(default)]
        cadence: Option<f64>,
        #[serde(default)]
        calories: Option<f64>,
        #[serde(default)]
        elevation_gain: Option<f64>,
    },
    Background,
    Foreground,
    Reachable {
        reachable: bool,
    },
    Paired {
        paired: bool,
    },
    FailNext {
        count: u32,
    },
    Expect {
        #[serde(default)]
        lifecycle: Option<LifecycleState>,
        #[serde(default)]
        min_elapsed: Option<f64>,
        #[serde(default)]
        circuit_open: Option<bool>,
        #[serde(default)]
        same_session: Option<bool>,
    },
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Pause => "pause",
            Action::Resume => "resume",
            Action::End => "end",
            Action::AcceptJoin => "accept_join",
            Action::HandOff => "hand_off",
            Action::RequestActiveWorkout => "request_active_workout",
            Action::SetIndoor { .. } => "set_indoor",
            Action::Location { .. } => "location",
            Action::HeartRate { .. } => "heart_rate",
            Action::Metrics { .. } => "metrics",
            Action::Background => "background",
            Action::Foreground => "foreground",
            Action::Reachable { .. } => "reachable",
            Action::Paired { .. } => "paired",
            Action::FailNext { .. } => "fail_next",
            Action::Expect { .. } => "expect",
        }
    }

    fn is_link_action(&self) -> bool {
        matches!(
            self,
            Action::Reachable { .. } | Action::Paired { .. } | Action::FailNext { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    pub index: usize,
    pub at_secs: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub name: String,
    pub steps: usize,
    pub rejected: Vec<StepFailure>,
    pub failed_expectations: Vec<StepFailure>,
    pub handheld: WorkoutSnapshot,
    pub wearable: WorkoutSnapshot,
}

impl Report {
    pub fn passed(&self) -> bool {
        self.failed_expectations.is_empty()
    }
}

pub fn load(path: &Path) -> Result<Scenario, ScenarioError> {
    let content = fs::read_to_string(path).map_err(|e| ScenarioError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(serde_json::from_str(&content)?)
}

/// Where replayed events go.
pub trait EventSink {
    fn event(&mut self, at_secs: i64, device: DeviceRole, event: &CoordinatorEvent);
}

/// Drops events.
pub struct Quiet;

impl EventSink for Quiet {
    fn event(&mut self, _at_secs: i64, _device: DeviceRole, _event: &CoordinatorEvent) {}
}

/// Prints one JSON object per event on stdout.
pub struct JsonLines;

impl EventSink for JsonLines {
    fn event(&mut self, at_secs: i64, device: DeviceRole, event: &CoordinatorEvent) {
        println!(
            "{}",
            json!({ "at_secs": at_secs, "device": device.as_str(), "event": event })
        );
    }
}

struct Rig {
    epoch: DateTime<Utc>,
    clock: ManualClock,
    link: MemoryLink,
    handheld: WorkoutCoordinator,
    wearable: WorkoutCoordinator,
    handheld_events: Receiver<CoordinatorEvent>,
    wearable_events: Receiver<CoordinatorEvent>,
    now_secs: i64,
}

impl Rig {
    fn new(kind: ActivityKind, config: &CoordinatorConfig) -> Self {
        let epoch = Utc
            .with_ymd_and_hms(2026, 1, 1, 6, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let clock = ManualClock::new(epoch);
        let link = MemoryLink::new();
        let mut handheld = coordinator(DeviceRole::Handheld, kind, config, &link, &clock);
        let mut wearable = coordinator(DeviceRole::Wearable, kind, config, &link, &clock);
        let handheld_events = handheld.subscribe();
        let wearable_events = wearable.subscribe();
        Self {
            epoch,
            clock,
            link,
            handheld,
            wearable,
            handheld_events,
            wearable_events,
            now_secs: 0,
        }
    }

    fn device(&mut self, role: DeviceRole) -> &mut WorkoutCoordinator {
        match role {
            DeviceRole::Handheld => &mut self.handheld,
            DeviceRole::Wearable => &mut self.wearable,
        }
    }

    fn pump(&mut self) {
        self.link
            .pump(&mut self.handheld, &mut self.wearable, PUMP_ROUNDS);
    }

    fn advance_to(&mut self, at_secs: i64, sink: &mut dyn EventSink) {
        while self.now_secs < at_secs {
            self.now_secs += 1;
            self.clock
                .set(self.epoch + Duration::seconds(self.now_secs));
            self.handheld.tick();
            self.wearable.tick();
            self.pump();
            self.flush(sink);
        }
    }

    fn flush(&mut self, sink: &mut dyn EventSink) {
        for event in self.handheld_events.try_iter() {
            sink.event(self.now_secs, DeviceRole::Handheld, &event);
        }
        for event in self.wearable_events.try_iter() {
            sink.event(self.now_secs, DeviceRole::Wearable, &event);
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.epoch + Duration::seconds(self.now_secs)
    }
}

fn coordinator(
    role: DeviceRole,
    kind: ActivityKind,
    config: &CoordinatorConfig,
    link: &MemoryLink,
    clock: &ManualClock,
) -> WorkoutCoordinator {
    let finalizer: Box<dyn SessionFinalizer> = Box::new(DiscardFinalizer);
    WorkoutCoordinator::new(
        role,
        kind,
        config.clone(),
        Box::new(link.transport(role)),
        Arc::new(clock.clone()),
        finalizer,
    )
}

pub fn replay(
    scenario: &Scenario,
    config: &CoordinatorConfig,
    sink: &mut dyn EventSink,
) -> Result<Report, ScenarioError> {
    let mut rig = Rig::new(scenario.activity_kind, config);
    let mut rejected = Vec::new();
    let mut failed_expectations = Vec::new();
    let mut last_at = 0;

    info!(
        name = %scenario.name,
        kind = scenario.activity_kind.as_str(),
        steps = scenario.steps.len(),
        "Replaying scenario"
    );

    for (index, step) in scenario.steps.iter().enumerate() {
        if step.at_secs < last_at {
            return Err(ScenarioError::OutOfOrder { index });
        }
        last_at = step.at_secs;
        rig.advance_to(step.at_secs, sink);

        if step.action.is_link_action() {
            apply_link(&rig.link, &step.action);
        } else {
            let role = step.device.ok_or(ScenarioError::MissingDevice {
                index,
                action: step.action.name(),
            })?;
            let outcome = match &step.action {
                Action::Expect {
                    lifecycle,
                    min_elapsed,
                    circuit_open,
                    same_session,
                } => {
                    let problems = check(
                        &mut rig,
                        role,
                        *lifecycle,
                        *min_elapsed,
                        *circuit_open,
                        *same_session,
                    );
                    for message in problems {
                        warn!(index, at_secs = step.at_secs, %message, "Expectation failed");
                        failed_expectations.push(StepFailure {
                            index,
                            at_secs: step.at_secs,
                            message,
                        });
                    }
                    Ok(())
                }
                action => apply_device(&mut rig, role, action),
            };
            if let Err(message) = outcome {
                warn!(
                    index,
                    device = role.as_str(),
                    action = step.action.name(),
                    %message,
                    "Step rejected"
                );
                rejected.push(StepFailure {
                    index,
                    at_secs: step.at_secs,
                    message,
                });
            }
        }

        rig.pump();
        rig.flush(sink);
    }

    Ok(Report {
        name: scenario.name.clone(),
        steps: scenario.steps.len(),
        rejected,
        failed_expectations,
        handheld: rig.handheld.snapshot(),
        wearable: rig.wearable.snapshot(),
    })
}

fn apply_link(link: &MemoryLink, action: &Action) {
    match action {
        Action::Reachable { reachable } => link.set_reachable(*reachable),
        Action::Paired { paired } => link.set_paired(*paired),
        Action::FailNext { count } => link.fail_next(*count),
        _ => {}
    }
}

fn apply_device(rig: &mut Rig, role: DeviceRole, action: &Action) -> Result<(), String> {
    let now = rig.now();
    let device = rig.device(role);
    match action {
        Action::Start => device.start().map(|_| ()).map_err(|e| e.to_string()),
        Action::Pause => device.pause().map(|_| ()).map_err(|e| e.to_string()),
        Action::Resume => device.resume().map(|_| ()).map_err(|e| e.to_string()),
        Action::End => device.end().map(|_| ()).map_err(|e| e.to_string()),
        Action::AcceptJoin => device.accept_join().map(|_| ()).map_err(|e| e.to_string()),
        Action::HandOff => device.hand_off().map_err(|e| e.to_string()),
        Action::RequestActiveWorkout => {
            device.request_active_workout();
            Ok(())
        }
        Action::SetIndoor { indoor } => {
            device.set_indoor(*indoor);
            Ok(())
        }
        Action::Location {
            horizontal_accuracy,
            distance,
            speed,
        } => {
            device.record_location(LocationSample {
                latitude: 0.0,
                longitude: 0.0,
                horizontal_accuracy: *horizontal_accuracy,
                speed: *speed,
                distance: *distance,
                timestamp: now,
            });
            Ok(())
        }
        Action::HeartRate { bpm } => {
            device.record_heart_rate(HeartRateSample {
                bpm: *bpm,
                timestamp: now,
            });
            Ok(())
        }
        Action::Metrics {
            cadence,
            calories,
            elevation_gain,
        } => {
            device.record_local_metrics(MetricsPatch {
                cadence: *cadence,
                calories: *calories,
                elevation_gain: *elevation_gain,
                ..MetricsPatch::default()
            });
            Ok(())
        }
        Action::Background => {
            device.enter_background();
            Ok(())
        }
        Action::Foreground => {
            device.enter_foreground();
            Ok(())
        }
        Action::Reachable { .. }
        | Action::Paired { .. }
        | Action::FailNext { .. }
        | Action::Expect { .. } => Ok(()),
    }
}

fn check(
    rig: &mut Rig,
    role: DeviceRole,
    lifecycle: Option<LifecycleState>,
    min_elapsed: Option<f64>,
    circuit_open: Option<bool>,
    same_session: Option<bool>,
) -> Vec<String> {
    let mut problems = Vec::new();
    let device = rig.device(role);
    let snapshot = device.snapshot();
    let health = device.health();

    if let Some(expected) = lifecycle {
        if snapshot.lifecycle_state != expected {
            problems.push(format!(
                "{} is {} (expected {})",
                role.as_str(),
                snapshot.lifecycle_state.as_str(),
                expected.as_str()
            ));
        }
    }
    if let Some(min) = min_elapsed {
        if snapshot.metrics.elapsed_active_time < min {
            problems.push(format!(
                "{} elapsed {:.1}s (expected at least {:.1}s)",
                role.as_str(),
                snapshot.metrics.elapsed_active_time,
                min
            ));
        }
    }
    if let Some(expected) = circuit_open {
        if health.circuit_open != expected {
            problems.push(format!(
                "{} circuit_open={} (expected {})",
                role.as_str(),
                health.circuit_open,
                expected
            ));
        }
    }
    if let Some(expected) = same_session {
        let same = rig.handheld.session_id().is_some()
            && rig.handheld.session_id() == rig.wearable.session_id();
        if same != expected {
            problems.push(format!("devices share a session: {same} (expected {expected})"));
        }
    }
    problems
}
