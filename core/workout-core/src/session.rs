//! Workout lifecycle state machine.
//!
//! `NotStarted -> Running <-> Paused -> Completed`, with `Running -> Completed`
//! allowed directly. Repeating pause or resume is a no-op; anything else out
//! of order is rejected. Each device holds one of these and reconciles through
//! the coordinator.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use workout_sync_protocol::{
    epoch_secs, ActivityKind, LifecycleState, MetricKind, MetricsSnapshot, Owner, OwnershipTable,
    WorkoutStatus,
};

use crate::clock::PauseAccountant;
use crate::error::{CoreError, Result};
use crate::handoff::HandoffPlan;

/// What a kind of activity measures and how it is arbitrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityProfile {
    pub tracked: &'static [MetricKind],
    pub gps_bound: bool,
    pub tracks_elevation: bool,
    /// Arbitrate as if indoors regardless of the user's toggle.
    pub forces_indoor: bool,
}

const OUTDOOR_METRICS: &[MetricKind] = &MetricKind::ALL;
const STRENGTH_METRICS: &[MetricKind] = &[MetricKind::HeartRate, MetricKind::Calories];

pub fn activity_profile(kind: ActivityKind) -> ActivityProfile {
    match kind {
        ActivityKind::Run | ActivityKind::Walk => ActivityProfile {
            tracked: OUTDOOR_METRICS,
            gps_bound: true,
            tracks_elevation: false,
            forces_indoor: false,
        },
        ActivityKind::Hike => ActivityProfile {
            tracked: OUTDOOR_METRICS,
            gps_bound: true,
            tracks_elevation: true,
            forces_indoor: false,
        },
        ActivityKind::StrengthSet => ActivityProfile {
            tracked: STRENGTH_METRICS,
            gps_bound: false,
            tracks_elevation: false,
            forces_indoor: true,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Start,
    Pause,
    Resume,
    End,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Start => "start",
            Intent::Pause => "pause",
            Intent::Resume => "resume",
            Intent::End => "end",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied(LifecycleState),
    Unchanged,
}

/// Partial metric reading from a local sensor or a peer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MetricsPatch {
    pub distance: Option<f64>,
    pub pace: Option<f64>,
    pub heart_rate: Option<f64>,
    pub cadence: Option<f64>,
    pub calories: Option<f64>,
    pub elevation_gain: Option<f64>,
    pub elevation_loss: Option<f64>,
}

impl From<&MetricsSnapshot> for MetricsPatch {
    fn from(metrics: &MetricsSnapshot) -> Self {
        Self {
            distance: Some(metrics.distance),
            pace: metrics.pace,
            heart_rate: metrics.heart_rate,
            cadence: metrics.cadence,
            calories: Some(metrics.calories),
            elevation_gain: Some(metrics.elevation_gain),
            elevation_loss: Some(metrics.elevation_loss),
        }
    }
}

/// Read-only view of a session handed to observers and persistence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkoutSnapshot {
    pub session_id: Option<String>,
    pub activity_kind: ActivityKind,
    pub lifecycle_state: LifecycleState,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_accumulator_secs: f64,
    pub metrics: MetricsSnapshot,
    pub is_indoor: bool,
    pub joining: bool,
}

#[derive(Debug, Clone)]
pub struct WorkoutSession {
    id: Option<String>,
    activity_kind: ActivityKind,
    lifecycle: LifecycleState,
    accountant: Option<PauseAccountant>,
    metrics: MetricsSnapshot,
    is_indoor: bool,
    joining: bool,
    collecting_gps: bool,
    last_transition_at: Option<DateTime<Utc>>,
}

impl WorkoutSession {
    pub fn new(activity_kind: ActivityKind) -> Self {
        Self {
            id: None,
            activity_kind,
            lifecycle: LifecycleState::NotStarted,
            accountant: None,
            metrics: MetricsSnapshot::default(),
            is_indoor: false,
            joining: false,
            collecting_gps: false,
            last_transition_at: None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn activity_kind(&self) -> ActivityKind {
        self.activity_kind
    }

    pub fn profile(&self) -> ActivityProfile {
        activity_profile(self.activity_kind)
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn is_indoor(&self) -> bool {
        self.is_indoor
    }

    pub fn set_indoor(&mut self, indoor: bool) {
        self.is_indoor = indoor;
    }

    pub fn is_joining(&self) -> bool {
        self.joining
    }

    pub fn finish_joining(&mut self) {
        self.joining = false;
    }

    pub fn is_collecting_gps(&self) -> bool {
        self.collecting_gps
    }

    pub fn last_transition_at(&self) -> Option<DateTime<Utc>> {
        self.last_transition_at
    }

    pub fn accountant(&self) -> Option<&PauseAccountant> {
        self.accountant.as_ref()
    }

    /// Whether `id` names this session. A session without an id matches
    /// nothing.
    pub fn is_session(&self, id: &str) -> bool {
        self.id.as_deref() == Some(id)
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        self.accountant
            .map(|accountant| accountant.elapsed(now))
            .unwrap_or_else(Duration::zero)
    }

    /// Recomputes elapsed active time. The stored value only moves forward,
    /// so a wall clock stepping backwards cannot make progress regress.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        if !self.lifecycle.is_active() {
            return;
        }
        let elapsed = duration_secs(self.elapsed(now));
        if elapsed > self.metrics.elapsed_active_time {
            self.metrics.elapsed_active_time = elapsed;
        }
    }

    pub fn metrics(&self) -> &MetricsSnapshot {
        &self.metrics
    }

    pub fn start(&mut self, id: String, now: DateTime<Utc>) -> Result<TransitionOutcome> {
        if self.lifecycle != LifecycleState::NotStarted {
            return Err(self.invalid(Intent::Start));
        }
        self.id = Some(id);
        self.accountant = Some(PauseAccountant::start(now));
        self.metrics = MetricsSnapshot::default();
        self.collecting_gps = self.profile().gps_bound;
        self.joining = false;
        Ok(self.enter(LifecycleState::Running, now))
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<TransitionOutcome> {
        match self.lifecycle {
            LifecycleState::Paused => Ok(TransitionOutcome::Unchanged),
            LifecycleState::Running => {
                self.refresh(now);
                if let Some(accountant) = self.accountant.as_mut() {
                    accountant.pause(now);
                }
                self.collecting_gps = false;
                Ok(self.enter(LifecycleState::Paused, now))
            }
            _ => Err(self.invalid(Intent::Pause)),
        }
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<TransitionOutcome> {
        match self.lifecycle {
            LifecycleState::Running => Ok(TransitionOutcome::Unchanged),
            LifecycleState::Paused => {
                if let Some(accountant) = self.accountant.as_mut() {
                    accountant.resume(now);
                }
                self.collecting_gps = self.profile().gps_bound;
                Ok(self.enter(LifecycleState::Running, now))
            }
            _ => Err(self.invalid(Intent::Resume)),
        }
    }

    /// Freezes metrics and completes the session, returning the final view.
    pub fn end(&mut self, now: DateTime<Utc>) -> Result<WorkoutSnapshot> {
        if !self.lifecycle.is_active() {
            return Err(self.invalid(Intent::End));
        }
        self.refresh(now);
        if let Some(accountant) = self.accountant.as_mut() {
            accountant.pause(now);
        }
        self.collecting_gps = false;
        self.enter(LifecycleState::Completed, now);
        Ok(self.snapshot(now))
    }

    /// Discards the session. The next start needs a fresh id.
    pub fn reset(&mut self) {
        let is_indoor = self.is_indoor;
        *self = Self::new(self.activity_kind);
        self.is_indoor = is_indoor;
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> WorkoutSnapshot {
        let mut metrics = self.metrics;
        if self.lifecycle.is_active() {
            metrics.elapsed_active_time = metrics
                .elapsed_active_time
                .max(duration_secs(self.elapsed(now)));
        }
        WorkoutSnapshot {
            session_id: self.id.clone(),
            activity_kind: self.activity_kind,
            lifecycle_state: self.lifecycle,
            started_at: self.accountant.map(|accountant| accountant.started_at()),
            paused_accumulator_secs: self
                .accountant
                .map(|accountant| duration_secs(accountant.paused_accumulator()))
                .unwrap_or(0.0),
            metrics,
            is_indoor: self.is_indoor,
            joining: self.joining,
        }
    }

    pub fn to_status(&self, ownership: OwnershipTable, now: DateTime<Utc>) -> WorkoutStatus {
        let snapshot = self.snapshot(now);
        WorkoutStatus {
            activity_kind: self.activity_kind,
            lifecycle_state: self.lifecycle,
            started_at: snapshot.started_at.map(epoch_secs),
            metrics: snapshot.metrics,
            ownership,
            is_indoor: self.is_indoor,
        }
    }

    /// Applies readings from this device's sensors. Only fields this device
    /// owns are taken; GPS-bound fields are ignored while collection is off.
    pub fn apply_local_metrics(&mut self, patch: &MetricsPatch, ownership: &OwnershipTable) -> bool {
        if !self.lifecycle.is_active() {
            return false;
        }
        self.merge_metrics(patch, ownership, Owner::Local)
    }

    /// Applies a peer's readings for the fields the peer owns. Elapsed time
    /// is merged with the take-max rule.
    pub fn apply_remote_metrics(
        &mut self,
        metrics: &MetricsSnapshot,
        ownership: &OwnershipTable,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.lifecycle.is_active() {
            return false;
        }
        let mut changed = self.merge_metrics(&MetricsPatch::from(metrics), ownership, Owner::Remote);
        self.refresh(now);
        if metrics.elapsed_active_time > self.metrics.elapsed_active_time {
            if let Some(accountant) = self.accountant.as_mut() {
                accountant.rebase(secs_duration(metrics.elapsed_active_time), now);
            }
            self.metrics.elapsed_active_time = metrics.elapsed_active_time;
            changed = true;
        }
        changed
    }

    fn merge_metrics(
        &mut self,
        patch: &MetricsPatch,
        ownership: &OwnershipTable,
        source: Owner,
    ) -> bool {
        let profile = self.profile();
        let accepts = |metric: MetricKind| {
            profile.tracked.contains(&metric) && ownership.get(metric) == source
        };
        let gps_open = source == Owner::Remote || self.collecting_gps;
        let before = self.metrics;

        if accepts(MetricKind::Distance) && gps_open {
            raise(&mut self.metrics.distance, patch.distance);
            if profile.tracks_elevation {
                raise(&mut self.metrics.elevation_gain, patch.elevation_gain);
                raise(&mut self.metrics.elevation_loss, patch.elevation_loss);
            }
        }
        if accepts(MetricKind::Pace) && gps_open && patch.pace.is_some() {
            self.metrics.pace = patch.pace;
        }
        if accepts(MetricKind::HeartRate) && patch.heart_rate.is_some() {
            self.metrics.heart_rate = patch.heart_rate;
        }
        if accepts(MetricKind::Cadence) && patch.cadence.is_some() {
            self.metrics.cadence = patch.cadence;
        }
        if accepts(MetricKind::Calories) {
            raise(&mut self.metrics.calories, patch.calories);
        }

        self.metrics != before
    }

    /// Replaces this session's identity and progress with a resolved handoff.
    pub fn apply_handoff(&mut self, plan: &HandoffPlan, now: DateTime<Utc>) {
        let mut accountant = PauseAccountant::start(plan.started_at);
        if plan.lifecycle == LifecycleState::Paused {
            accountant.pause(now);
        }
        accountant.rebase(plan.elapsed, now);

        self.id = Some(plan.session_id.clone());
        self.activity_kind = plan.activity_kind;
        self.accountant = Some(accountant);
        self.metrics = plan.metrics;
        self.metrics.elapsed_active_time = duration_secs(plan.elapsed);
        self.is_indoor = plan.is_indoor;
        self.joining = plan.joining;
        self.collecting_gps = plan.lifecycle == LifecycleState::Running && self.profile().gps_bound;
        self.enter(plan.lifecycle, now);
    }

    fn enter(&mut self, state: LifecycleState, now: DateTime<Utc>) -> TransitionOutcome {
        self.lifecycle = state;
        self.last_transition_at = Some(now);
        TransitionOutcome::Applied(state)
    }

    fn invalid(&self, intent: Intent) -> CoreError {
        CoreError::InvalidTransition {
            intent: intent.as_str(),
            state: self.lifecycle,
        }
    }
}

fn raise(slot: &mut f64, candidate: Option<f64>) {
    if let Some(value) = candidate {
        if value > *slot {
            *slot = value;
        }
    }
}

pub(crate) fn duration_secs(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

pub(crate) fn secs_duration(secs: f64) -> Duration {
    if !secs.is_finite() || secs <= 0.0 {
        return Duration::zero();
    }
    Duration::milliseconds((secs * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 7, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(secs)
    }

    fn running() -> WorkoutSession {
        let mut session = WorkoutSession::new(ActivityKind::Run);
        session.start("run-1".to_string(), t0()).unwrap();
        session
    }

    #[test]
    fn start_enters_running_with_fresh_accounting() {
        let session = running();
        assert_eq!(session.lifecycle(), LifecycleState::Running);
        assert_eq!(session.id(), Some("run-1"));
        assert!(session.is_collecting_gps());
        assert_eq!(session.elapsed(at(42)), Duration::seconds(42));
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut session = running();
        let err = session.start("run-2".to_string(), at(1)).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidTransition {
                intent: "start",
                state: LifecycleState::Running
            }
        ));
    }

    #[test]
    fn pause_twice_matches_pause_once() {
        let mut once = running();
        once.pause(at(30)).unwrap();

        let mut twice = running();
        twice.pause(at(30)).unwrap();
        assert_eq!(twice.pause(at(31)).unwrap(), TransitionOutcome::Unchanged);

        assert_eq!(once.snapshot(at(50)), twice.snapshot(at(50)));
        assert_eq!(once.last_transition_at(), twice.last_transition_at());
    }

    #[test]
    fn resume_while_running_is_noop() {
        let mut session = running();
        assert_eq!(session.resume(at(5)).unwrap(), TransitionOutcome::Unchanged);
        assert_eq!(session.last_transition_at(), Some(t0()));
    }

    #[test]
    fn pause_stops_gps_collection_and_freezes_elapsed() {
        let mut session = running();
        session.pause(at(60)).unwrap();
        assert!(!session.is_collecting_gps());

        let table = OwnershipTable::all(Owner::Local);
        let patch = MetricsPatch {
            distance: Some(500.0),
            heart_rate: Some(120.0),
            ..MetricsPatch::default()
        };
        session.apply_local_metrics(&patch, &table);
        assert_eq!(session.metrics().distance, 0.0);
        assert_eq!(session.metrics().heart_rate, Some(120.0));
        assert_eq!(session.snapshot(at(300)).metrics.elapsed_active_time, 60.0);
    }

    #[test]
    fn elapsed_is_preserved_across_pause() {
        let mut session = running();
        let before = session.snapshot(at(120)).metrics.elapsed_active_time;
        session.pause(at(120)).unwrap();
        session.resume(at(185)).unwrap();
        let after = session.snapshot(at(185)).metrics.elapsed_active_time;
        assert_eq!(before, after);
        assert_eq!(
            session.accountant().unwrap().paused_accumulator(),
            Duration::seconds(65)
        );
    }

    #[test]
    fn end_freezes_and_completes() {
        let mut session = running();
        let snapshot = session.end(at(200)).unwrap();
        assert_eq!(snapshot.lifecycle_state, LifecycleState::Completed);
        assert_eq!(snapshot.metrics.elapsed_active_time, 200.0);
        assert!(session.pause(at(201)).is_err());
        assert!(session.end(at(202)).is_err());

        session.reset();
        assert_eq!(session.lifecycle(), LifecycleState::NotStarted);
        assert_eq!(session.id(), None);
    }

    #[test]
    fn end_requires_active_session() {
        let mut session = WorkoutSession::new(ActivityKind::Walk);
        assert!(session.end(t0()).is_err());
        assert!(session.pause(t0()).is_err());
    }

    #[test]
    fn local_metrics_only_fill_owned_fields() {
        let mut session = running();
        let mut table = OwnershipTable::all(Owner::Local);
        table.heart_rate = Owner::Remote;
        let patch = MetricsPatch {
            distance: Some(1500.0),
            heart_rate: Some(150.0),
            ..MetricsPatch::default()
        };
        assert!(session.apply_local_metrics(&patch, &table));
        assert_eq!(session.metrics().distance, 1500.0);
        assert_eq!(session.metrics().heart_rate, None);
    }

    #[test]
    fn cumulative_metrics_never_regress() {
        let mut session = running();
        let table = OwnershipTable::all(Owner::Local);
        session.apply_local_metrics(
            &MetricsPatch {
                distance: Some(800.0),
                calories: Some(40.0),
                ..MetricsPatch::default()
            },
            &table,
        );
        session.apply_local_metrics(
            &MetricsPatch {
                distance: Some(700.0),
                calories: Some(35.0),
                ..MetricsPatch::default()
            },
            &table,
        );
        assert_eq!(session.metrics().distance, 800.0);
        assert_eq!(session.metrics().calories, 40.0);
    }

    #[test]
    fn remote_elapsed_only_moves_forward() {
        let mut session = running();
        let table = OwnershipTable::all(Owner::Remote);
        let mut remote = MetricsSnapshot {
            elapsed_active_time: 90.0,
            ..MetricsSnapshot::default()
        };
        session.apply_remote_metrics(&remote, &table, at(60));
        assert_eq!(session.snapshot(at(60)).metrics.elapsed_active_time, 90.0);
        assert_eq!(session.snapshot(at(70)).metrics.elapsed_active_time, 100.0);

        remote.elapsed_active_time = 10.0;
        session.apply_remote_metrics(&remote, &table, at(70));
        assert_eq!(session.snapshot(at(70)).metrics.elapsed_active_time, 100.0);
    }

    #[test]
    fn strength_profile_ignores_gps_fields() {
        let mut session = WorkoutSession::new(ActivityKind::StrengthSet);
        session.start("gym-1".to_string(), t0()).unwrap();
        assert!(!session.is_collecting_gps());
        let table = OwnershipTable::all(Owner::Local);
        session.apply_local_metrics(
            &MetricsPatch {
                distance: Some(20.0),
                cadence: Some(80.0),
                calories: Some(12.0),
                ..MetricsPatch::default()
            },
            &table,
        );
        assert_eq!(session.metrics().distance, 0.0);
        assert_eq!(session.metrics().cadence, None);
        assert_eq!(session.metrics().calories, 12.0);
    }

    #[test]
    fn hike_profile_tracks_elevation() {
        let mut session = WorkoutSession::new(ActivityKind::Hike);
        session.start("hike-1".to_string(), t0()).unwrap();
        let table = OwnershipTable::all(Owner::Local);
        session.apply_local_metrics(
            &MetricsPatch {
                distance: Some(300.0),
                elevation_gain: Some(25.0),
                ..MetricsPatch::default()
            },
            &table,
        );
        assert_eq!(session.metrics().elevation_gain, 25.0);
    }
}
