//! Wire types and validation for cross-device workout sync.
//!
//! Both devices link this crate so the envelope schema cannot drift between
//! them. Receivers still validate everything they decode; a peer running an
//! older build is treated as untrusted input, not as a bug.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_ENVELOPE_BYTES: usize = 64 * 1024;
const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceRole {
    Handheld,
    Wearable,
}

impl DeviceRole {
    pub fn peer(self) -> Self {
        match self {
            DeviceRole::Handheld => DeviceRole::Wearable,
            DeviceRole::Wearable => DeviceRole::Handheld,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceRole::Handheld => "handheld",
            DeviceRole::Wearable => "wearable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityKind {
    Run,
    Hike,
    Walk,
    StrengthSet,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityKind::Run => "run",
            ActivityKind::Hike => "hike",
            ActivityKind::Walk => "walk",
            ActivityKind::StrengthSet => "strengthSet",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    #[default]
    NotStarted,
    Running,
    Paused,
    Completed,
}

impl LifecycleState {
    /// Running or Paused: a session exists and is still accumulating.
    pub fn is_active(self) -> bool {
        matches!(self, LifecycleState::Running | LifecycleState::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::NotStarted => "notStarted",
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
            LifecycleState::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricKind {
    Distance,
    Pace,
    HeartRate,
    Cadence,
    Calories,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::Distance,
        MetricKind::Pace,
        MetricKind::HeartRate,
        MetricKind::Cadence,
        MetricKind::Calories,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Distance => "distance",
            MetricKind::Pace => "pace",
            MetricKind::HeartRate => "heartRate",
            MetricKind::Cadence => "cadence",
            MetricKind::Calories => "calories",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Owner {
    #[default]
    Local,
    Remote,
}

impl Owner {
    /// The same owner as seen from the other device.
    pub fn mirrored(self) -> Self {
        match self {
            Owner::Local => Owner::Remote,
            Owner::Remote => Owner::Local,
        }
    }
}

/// Per-metric owner. One slot per metric class, so a metric always has
/// exactly one authoritative side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipTable {
    pub distance: Owner,
    pub pace: Owner,
    pub heart_rate: Owner,
    pub cadence: Owner,
    pub calories: Owner,
}

impl OwnershipTable {
    pub fn all(owner: Owner) -> Self {
        Self {
            distance: owner,
            pace: owner,
            heart_rate: owner,
            cadence: owner,
            calories: owner,
        }
    }

    pub fn get(&self, metric: MetricKind) -> Owner {
        match metric {
            MetricKind::Distance => self.distance,
            MetricKind::Pace => self.pace,
            MetricKind::HeartRate => self.heart_rate,
            MetricKind::Cadence => self.cadence,
            MetricKind::Calories => self.calories,
        }
    }

    pub fn set(&mut self, metric: MetricKind, owner: Owner) {
        match metric {
            MetricKind::Distance => self.distance = owner,
            MetricKind::Pace => self.pace = owner,
            MetricKind::HeartRate => self.heart_rate = owner,
            MetricKind::Cadence => self.cadence = owner,
            MetricKind::Calories => self.calories = owner,
        }
    }

    pub fn mirrored(&self) -> Self {
        Self {
            distance: self.distance.mirrored(),
            pace: self.pace.mirrored(),
            heart_rate: self.heart_rate.mirrored(),
            cadence: self.cadence.mirrored(),
            calories: self.calories.mirrored(),
        }
    }
}

/// Metric values as carried on the wire. Durations are seconds, distances
/// and elevation are meters, pace is seconds per kilometer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSnapshot {
    pub distance: f64,
    pub elapsed_active_time: f64,
    pub pace: Option<f64>,
    pub heart_rate: Option<f64>,
    pub cadence: Option<f64>,
    pub calories: f64,
    pub elevation_gain: f64,
    pub elevation_loss: f64,
}

impl MetricsSnapshot {
    fn values(&self) -> [(&'static str, Option<f64>); 8] {
        [
            ("distance", Some(self.distance)),
            ("elapsedActiveTime", Some(self.elapsed_active_time)),
            ("pace", self.pace),
            ("heartRate", self.heart_rate),
            ("cadence", self.cadence),
            ("calories", Some(self.calories)),
            ("elevationGain", Some(self.elevation_gain)),
            ("elevationLoss", Some(self.elevation_loss)),
        ]
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        for (name, value) in self.values() {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    return Err(ErrorInfo::new(
                        "invalid_metric",
                        format!("{} must be a finite, non-negative number", name),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkoutStatus {
    pub activity_kind: ActivityKind,
    pub lifecycle_state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    #[serde(default)]
    pub metrics: MetricsSnapshot,
    #[serde(default)]
    pub ownership: OwnershipTable,
    #[serde(default)]
    pub is_indoor: bool,
}

impl WorkoutStatus {
    fn validate(&self) -> Result<(), ErrorInfo> {
        if let Some(started_at) = self.started_at {
            require_timestamp(started_at, "startedAt")?;
        }
        self.metrics.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Message {
    WorkoutUpdate(WorkoutStatus),
    PauseWorkout,
    ResumeWorkout,
    EndWorkout(WorkoutStatus),
    RequestActiveWorkout,
    ActiveWorkoutResponse {
        #[serde(default)]
        active: Option<WorkoutStatus>,
    },
    HandoffRequest(WorkoutStatus),
    HandoffResponse {
        accepted: bool,
    },
    TrackingStatus {
        lifecycle_state: LifecycleState,
        ownership: OwnershipTable,
        #[serde(default)]
        is_indoor: bool,
    },
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    WorkoutUpdate,
    PauseWorkout,
    ResumeWorkout,
    EndWorkout,
    RequestActiveWorkout,
    ActiveWorkoutResponse,
    HandoffRequest,
    HandoffResponse,
    TrackingStatus,
    Heartbeat,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::WorkoutUpdate => "workoutUpdate",
            MessageKind::PauseWorkout => "pauseWorkout",
            MessageKind::ResumeWorkout => "resumeWorkout",
            MessageKind::EndWorkout => "endWorkout",
            MessageKind::RequestActiveWorkout => "requestActiveWorkout",
            MessageKind::ActiveWorkoutResponse => "activeWorkoutResponse",
            MessageKind::HandoffRequest => "handoffRequest",
            MessageKind::HandoffResponse => "handoffResponse",
            MessageKind::TrackingStatus => "trackingStatus",
            MessageKind::Heartbeat => "heartbeat",
        }
    }

    /// Pause/resume/end. These bypass rate limiting and are never dropped
    /// by the throttle.
    pub fn is_lifecycle_control(self) -> bool {
        matches!(
            self,
            MessageKind::PauseWorkout | MessageKind::ResumeWorkout | MessageKind::EndWorkout
        )
    }

    /// Envelopes that may be sent before either side has a session id.
    fn allows_empty_session(self) -> bool {
        matches!(
            self,
            MessageKind::RequestActiveWorkout
                | MessageKind::ActiveWorkoutResponse
                | MessageKind::TrackingStatus
                | MessageKind::Heartbeat
        )
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::WorkoutUpdate(_) => MessageKind::WorkoutUpdate,
            Message::PauseWorkout => MessageKind::PauseWorkout,
            Message::ResumeWorkout => MessageKind::ResumeWorkout,
            Message::EndWorkout(_) => MessageKind::EndWorkout,
            Message::RequestActiveWorkout => MessageKind::RequestActiveWorkout,
            Message::ActiveWorkoutResponse { .. } => MessageKind::ActiveWorkoutResponse,
            Message::HandoffRequest(_) => MessageKind::HandoffRequest,
            Message::HandoffResponse { .. } => MessageKind::HandoffResponse,
            Message::TrackingStatus { .. } => MessageKind::TrackingStatus,
            Message::Heartbeat => MessageKind::Heartbeat,
        }
    }

    fn status(&self) -> Option<&WorkoutStatus> {
        match self {
            Message::WorkoutUpdate(status)
            | Message::EndWorkout(status)
            | Message::HandoffRequest(status) => Some(status),
            Message::ActiveWorkoutResponse { active } => active.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default)]
    pub session_id: String,
    pub origin: DeviceRole,
    /// Sender wall clock, seconds since the Unix epoch.
    pub timestamp: f64,
    #[serde(flatten)]
    pub message: Message,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

impl SyncEnvelope {
    pub fn new(
        session_id: impl Into<String>,
        origin: DeviceRole,
        sent_at: DateTime<Utc>,
        message: Message,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            session_id: session_id.into(),
            origin,
            timestamp: epoch_secs(sent_at),
            message,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        from_epoch_secs(self.timestamp)
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(ErrorInfo::new(
                "protocol_mismatch",
                format!("unsupported protocol version {}", self.protocol_version),
            ));
        }

        require_timestamp(self.timestamp, "timestamp")?;

        let kind = self.kind();
        if self.session_id.trim().is_empty() && !kind.allows_empty_session() {
            return Err(ErrorInfo::new(
                "missing_field",
                format!("sessionId is required for {}", kind.as_str()),
            ));
        }
        if self.session_id.len() > MAX_SESSION_ID_LEN {
            return Err(ErrorInfo::new(
                "invalid_session_id",
                "sessionId must be 128 characters or fewer",
            ));
        }

        if let Some(status) = self.message.status() {
            status.validate()?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

pub fn parse_envelope(value: Value) -> Result<SyncEnvelope, ErrorInfo> {
    let envelope: SyncEnvelope = serde_json::from_value(value).map_err(|err| {
        ErrorInfo::new(
            "invalid_envelope",
            format!("envelope payload is invalid: {}", err),
        )
    })?;
    envelope.validate()?;
    Ok(envelope)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<SyncEnvelope, ErrorInfo> {
    if bytes.len() > MAX_ENVELOPE_BYTES {
        return Err(ErrorInfo::new(
            "envelope_too_large",
            "envelope exceeded maximum size",
        ));
    }
    let value: Value = serde_json::from_slice(bytes).map_err(|err| {
        ErrorInfo::new("invalid_json", format!("envelope was not valid JSON: {}", err))
    })?;
    parse_envelope(value)
}

pub fn encode_envelope(envelope: &SyncEnvelope) -> Result<Vec<u8>, ErrorInfo> {
    serde_json::to_vec(envelope).map_err(|err| {
        ErrorInfo::new(
            "serialization_error",
            format!("failed to encode envelope: {}", err),
        )
    })
}

pub fn epoch_secs(instant: DateTime<Utc>) -> f64 {
    instant.timestamp_millis() as f64 / 1000.0
}

/// Drops precision below what the wire carries (milliseconds).
pub fn wire_instant(instant: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(instant.timestamp_millis())
        .single()
        .unwrap_or(instant)
}

pub fn from_epoch_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
}

fn require_timestamp(value: f64, field: &str) -> Result<(), ErrorInfo> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ErrorInfo::new(
            "invalid_timestamp",
            format!("{} must be non-negative seconds since epoch", field),
        ))
    }
}
