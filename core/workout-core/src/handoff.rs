//! Join and handoff resolution.
//!
//! A clean join (this device idle) copies the peer's session verbatim. A
//! conflicting join (both devices tracking) merges deterministically: the
//! peer's id and start instant win, sensor-bound readings come from the peer,
//! and progress takes the maximum so nothing visible ever goes backwards.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use workout_sync_protocol::{from_epoch_secs, ActivityKind, LifecycleState, MetricsSnapshot, WorkoutStatus};

use crate::session::{duration_secs, secs_duration, WorkoutSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffResolution {
    CleanJoin,
    Merged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandoffPlan {
    pub resolution: HandoffResolution,
    pub session_id: String,
    pub activity_kind: ActivityKind,
    pub lifecycle: LifecycleState,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub metrics: MetricsSnapshot,
    pub is_indoor: bool,
    /// Local sensors have not reported yet; arbitration waits for them.
    pub joining: bool,
}

pub fn resolve_handoff(
    local: Option<&WorkoutSnapshot>,
    remote_session_id: &str,
    remote: &WorkoutStatus,
    now: DateTime<Utc>,
) -> HandoffPlan {
    let remote_elapsed = secs_duration(remote.metrics.elapsed_active_time);
    let lifecycle = if remote.lifecycle_state.is_active() {
        remote.lifecycle_state
    } else {
        LifecycleState::Running
    };

    let local = match local.filter(|snapshot| snapshot.lifecycle_state.is_active()) {
        Some(local) => local,
        None => {
            return HandoffPlan {
                resolution: HandoffResolution::CleanJoin,
                session_id: remote_session_id.to_string(),
                activity_kind: remote.activity_kind,
                lifecycle,
                started_at: remote_start(remote, remote_elapsed, now),
                elapsed: remote_elapsed,
                metrics: remote.metrics,
                is_indoor: remote.is_indoor,
                joining: true,
            };
        }
    };

    let local_metrics = &local.metrics;
    let remote_metrics = &remote.metrics;
    let elapsed_secs = local_metrics
        .elapsed_active_time
        .max(remote_metrics.elapsed_active_time);

    let metrics = MetricsSnapshot {
        distance: local_metrics.distance.max(remote_metrics.distance),
        elapsed_active_time: elapsed_secs,
        pace: remote_metrics.pace.or(local_metrics.pace),
        heart_rate: remote_metrics.heart_rate.or(local_metrics.heart_rate),
        cadence: remote_metrics.cadence.or(local_metrics.cadence),
        calories: local_metrics.calories.max(remote_metrics.calories),
        elevation_gain: local_metrics.elevation_gain.max(remote_metrics.elevation_gain),
        elevation_loss: local_metrics.elevation_loss.max(remote_metrics.elevation_loss),
    };

    HandoffPlan {
        resolution: HandoffResolution::Merged,
        session_id: remote_session_id.to_string(),
        activity_kind: local.activity_kind,
        lifecycle: local.lifecycle_state,
        started_at: remote_start(remote, remote_elapsed, now),
        elapsed: secs_duration(elapsed_secs),
        metrics,
        is_indoor: local.is_indoor,
        joining: false,
    }
}

fn remote_start(remote: &WorkoutStatus, remote_elapsed: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    remote
        .started_at
        .and_then(from_epoch_secs)
        .unwrap_or_else(|| now - remote_elapsed)
}

impl HandoffPlan {
    pub fn elapsed_secs(&self) -> f64 {
        duration_secs(self.elapsed)
    }
}
