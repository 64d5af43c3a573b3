//! Local sensor readings fed into the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ownership::LocationQuality;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Radius of uncertainty in meters. Negative means no fix.
    pub horizontal_accuracy: f64,
    /// Meters per second, when the receiver reports it.
    #[serde(default)]
    pub speed: Option<f64>,
    /// Cumulative distance reported by the location pipeline, in meters.
    #[serde(default)]
    pub distance: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartRateSample {
    pub bpm: f64,
    pub timestamp: DateTime<Utc>,
}

pub fn classify_location(sample: &LocationSample, good_accuracy_meters: f64) -> LocationQuality {
    let accuracy = sample.horizontal_accuracy;
    if accuracy.is_finite() && accuracy >= 0.0 && accuracy <= good_accuracy_meters {
        LocationQuality::Good
    } else {
        LocationQuality::Degraded
    }
}

impl LocationSample {
    /// Pace in seconds per kilometer derived from instantaneous speed.
    pub fn pace(&self) -> Option<f64> {
        self.speed
            .filter(|speed| speed.is_finite() && *speed > 0.1)
            .map(|speed| 1000.0 / speed)
    }
}

impl HeartRateSample {
    /// Readings outside a human range are sensor noise.
    pub fn is_plausible(&self) -> bool {
        self.bpm.is_finite() && (25.0..=250.0).contains(&self.bpm)
    }
}
