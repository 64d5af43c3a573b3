//! Per-metric ownership arbitration.
//!
//! Fixed priority rules, evaluated from scratch each time an input changes:
//!
//! 1. Peer unavailable (not paired, or circuit open): everything is local.
//! 2. Heart rate belongs to the wearable side (remote); calories follow it.
//! 3. Cadence is remote.
//! 4. Distance and pace are local only outdoors with a good fix.
//!
//! The rules are stated from the handheld's side. The handheld arbitrates and
//! publishes its table; the wearable adopts the mirror of the last table it
//! received, and until then mirrors the handheld's rules assuming a degraded
//! fix. Both sides fall back to all-local when the peer is unavailable.
//!
//! Indoor sessions therefore hand distance, pace, cadence and calories to the
//! wearable. An improving location signal is only trusted after it has held
//! for the stabilization delay; a degrading one is believed immediately.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;
use workout_sync_protocol::{DeviceRole, Owner, OwnershipTable};

use crate::config::ArbitrationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationQuality {
    Good,
    Degraded,
}

/// The peer as this device currently sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceHealth {
    pub reachable: bool,
    /// Paired with the companion app installed.
    pub paired: bool,
    pub location_quality: LocationQuality,
    pub consecutive_comm_failures: u32,
    pub circuit_open: bool,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl Default for DeviceHealth {
    fn default() -> Self {
        Self {
            reachable: false,
            paired: false,
            location_quality: LocationQuality::Degraded,
            consecutive_comm_failures: 0,
            circuit_open: false,
            last_success_at: None,
        }
    }
}

impl DeviceHealth {
    /// Momentary unreachability does not count; only a missing pairing or an
    /// open circuit makes the peer unavailable for ownership purposes.
    pub fn peer_available(&self) -> bool {
        self.paired && !self.circuit_open
    }
}

pub fn evaluate(indoor: bool, location_quality: LocationQuality, peer: &DeviceHealth) -> OwnershipTable {
    if !peer.peer_available() {
        return OwnershipTable::all(Owner::Local);
    }

    let gps_owner = if !indoor && location_quality == LocationQuality::Good {
        Owner::Local
    } else {
        Owner::Remote
    };
    let heart_rate = Owner::Remote;

    OwnershipTable {
        distance: gps_owner,
        pace: gps_owner,
        heart_rate,
        cadence: Owner::Remote,
        calories: heart_rate,
    }
}

#[derive(Debug, Clone)]
pub struct OwnershipArbitrator {
    role: DeviceRole,
    stabilization: Duration,
    effective_quality: LocationQuality,
    improving_since: Option<DateTime<Utc>>,
    /// Last table published by the handheld, from the handheld's side.
    published: Option<OwnershipTable>,
    table: OwnershipTable,
}

impl OwnershipArbitrator {
    pub fn new(config: &ArbitrationConfig, role: DeviceRole) -> Self {
        Self {
            role,
            stabilization: config.stabilization(),
            effective_quality: LocationQuality::Degraded,
            improving_since: None,
            published: None,
            table: OwnershipTable::all(Owner::Local),
        }
    }

    pub fn table(&self) -> OwnershipTable {
        self.table
    }

    /// Whether this side computes the table rather than following the peer.
    pub fn is_arbiter(&self) -> bool {
        self.role == DeviceRole::Handheld
    }

    /// Records a table published by the peer, stated from the peer's side.
    /// Ignored on the arbitrating side. Returns true when it differs from the
    /// last one recorded.
    pub fn record_published(&mut self, peer_table: OwnershipTable) -> bool {
        if self.is_arbiter() || self.published == Some(peer_table) {
            return false;
        }
        self.published = Some(peer_table);
        true
    }

    pub fn forget_published(&mut self) {
        self.published = None;
    }

    pub fn effective_quality(&self) -> LocationQuality {
        self.effective_quality
    }

    /// Records a raw quality reading. Returns true when the quality used
    /// for arbitration changed.
    pub fn observe_quality(&mut self, quality: LocationQuality, now: DateTime<Utc>) -> bool {
        match quality {
            LocationQuality::Degraded => {
                self.improving_since = None;
                if self.effective_quality == LocationQuality::Degraded {
                    return false;
                }
                self.effective_quality = LocationQuality::Degraded;
                true
            }
            LocationQuality::Good => {
                if self.effective_quality == LocationQuality::Good {
                    return false;
                }
                if self.improving_since.is_none() {
                    debug!("Location quality improving; waiting for it to stabilize");
                    self.improving_since = Some(now);
                }
                self.promote_if_stable(now)
            }
        }
    }

    /// Promotes a pending improvement once it has held long enough.
    pub fn promote_if_stable(&mut self, now: DateTime<Utc>) -> bool {
        match self.improving_since {
            Some(since) if now - since >= self.stabilization => {
                self.improving_since = None;
                self.effective_quality = LocationQuality::Good;
                true
            }
            _ => false,
        }
    }

    /// Recomputes the table. Returns the new table only when it changed.
    pub fn reevaluate(&mut self, indoor: bool, peer: &DeviceHealth) -> Option<OwnershipTable> {
        let next = match self.role {
            DeviceRole::Handheld => evaluate(indoor, self.effective_quality, peer),
            DeviceRole::Wearable if !peer.peer_available() => OwnershipTable::all(Owner::Local),
            DeviceRole::Wearable => self
                .published
                .unwrap_or_else(|| evaluate(indoor, LocationQuality::Degraded, peer))
                .mirrored(),
        };
        if next == self.table {
            return None;
        }
        self.table = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use workout_sync_protocol::MetricKind;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 7, 0, 0).unwrap()
    }

    fn healthy_peer() -> DeviceHealth {
        DeviceHealth {
            reachable: true,
            paired: true,
            ..DeviceHealth::default()
        }
    }

    #[test]
    fn outdoor_good_fix_keeps_gps_metrics_local() {
        let table = evaluate(false, LocationQuality::Good, &healthy_peer());
        assert_eq!(table.distance, Owner::Local);
        assert_eq!(table.pace, Owner::Local);
        assert_eq!(table.heart_rate, Owner::Remote);
        assert_eq!(table.cadence, Owner::Remote);
        assert_eq!(table.calories, Owner::Remote);
    }

    #[test]
    fn degraded_fix_hands_gps_metrics_to_peer() {
        let table = evaluate(false, LocationQuality::Degraded, &healthy_peer());
        assert_eq!(table.distance, Owner::Remote);
        assert_eq!(table.pace, Owner::Remote);
    }

    #[test]
    fn indoor_forces_remote_even_with_good_fix() {
        let table = evaluate(true, LocationQuality::Good, &healthy_peer());
        assert_eq!(table, OwnershipTable::all(Owner::Remote));
    }

    #[test]
    fn momentary_unreachability_keeps_heart_rate_remote() {
        let mut peer = healthy_peer();
        peer.reachable = false;
        let table = evaluate(false, LocationQuality::Good, &peer);
        assert_eq!(table.heart_rate, Owner::Remote);
        assert_eq!(table.calories, table.heart_rate);
    }

    #[test]
    fn open_circuit_degrades_everything_to_local() {
        let mut peer = healthy_peer();
        peer.circuit_open = true;
        for indoor in [false, true] {
            for quality in [LocationQuality::Good, LocationQuality::Degraded] {
                assert_eq!(
                    evaluate(indoor, quality, &peer),
                    OwnershipTable::all(Owner::Local)
                );
            }
        }
    }

    #[test]
    fn unpaired_peer_means_single_device_tracking() {
        let table = evaluate(true, LocationQuality::Degraded, &DeviceHealth::default());
        assert_eq!(table, OwnershipTable::all(Owner::Local));
    }

    #[test]
    fn calories_always_follow_heart_rate() {
        let mut peer = healthy_peer();
        for circuit_open in [false, true] {
            peer.circuit_open = circuit_open;
            for indoor in [false, true] {
                let table = evaluate(indoor, LocationQuality::Good, &peer);
                assert_eq!(table.calories, table.heart_rate);
                for metric in MetricKind::ALL {
                    let owner = table.get(metric);
                    assert!(owner == Owner::Local || owner == Owner::Remote);
                }
            }
        }
    }

    #[test]
    fn improved_quality_waits_for_stabilization() {
        let config = ArbitrationConfig::default();
        let mut arbitrator = OwnershipArbitrator::new(&config, DeviceRole::Handheld);
        assert!(!arbitrator.observe_quality(LocationQuality::Good, t0()));
        assert_eq!(arbitrator.effective_quality(), LocationQuality::Degraded);

        assert!(!arbitrator.observe_quality(LocationQuality::Good, t0() + Duration::seconds(3)));
        assert!(arbitrator.promote_if_stable(t0() + Duration::seconds(5)));
        assert_eq!(arbitrator.effective_quality(), LocationQuality::Good);
    }

    #[test]
    fn flapping_quality_restarts_stabilization() {
        let config = ArbitrationConfig::default();
        let mut arbitrator = OwnershipArbitrator::new(&config, DeviceRole::Handheld);
        arbitrator.observe_quality(LocationQuality::Good, t0());
        arbitrator.observe_quality(LocationQuality::Degraded, t0() + Duration::seconds(2));
        arbitrator.observe_quality(LocationQuality::Good, t0() + Duration::seconds(4));
        assert!(!arbitrator.promote_if_stable(t0() + Duration::seconds(8)));
        assert!(arbitrator.promote_if_stable(t0() + Duration::seconds(9)));
    }

    #[test]
    fn degraded_quality_applies_immediately() {
        let config = ArbitrationConfig {
            stabilization_secs: 0,
            ..ArbitrationConfig::default()
        };
        let mut arbitrator = OwnershipArbitrator::new(&config, DeviceRole::Handheld);
        assert!(arbitrator.observe_quality(LocationQuality::Good, t0()));
        assert!(arbitrator.observe_quality(LocationQuality::Degraded, t0()));
        assert_eq!(arbitrator.effective_quality(), LocationQuality::Degraded);
    }

    #[test]
    fn reevaluate_reports_only_changes() {
        let mut arbitrator = OwnershipArbitrator::new(&ArbitrationConfig::default(), DeviceRole::Handheld);
        let peer = healthy_peer();
        let first = arbitrator.reevaluate(false, &peer).expect("changed from default");
        assert_eq!(first.heart_rate, Owner::Remote);
        assert_eq!(arbitrator.reevaluate(false, &peer), None);
    }

    #[test]
    fn wearable_mirrors_default_rules_until_published() {
        let mut arbitrator =
            OwnershipArbitrator::new(&ArbitrationConfig::default(), DeviceRole::Wearable);
        // Degraded handheld fix: the wearable owns every stream.
        assert_eq!(arbitrator.reevaluate(false, &healthy_peer()), None);
        assert_eq!(arbitrator.table(), OwnershipTable::all(Owner::Local));
    }

    #[test]
    fn wearable_follows_published_table() {
        let mut arbitrator =
            OwnershipArbitrator::new(&ArbitrationConfig::default(), DeviceRole::Wearable);
        let published = evaluate(false, LocationQuality::Good, &healthy_peer());
        assert!(arbitrator.record_published(published));
        assert!(!arbitrator.record_published(published));

        let table = arbitrator.reevaluate(false, &healthy_peer()).expect("changed");
        assert_eq!(table, published.mirrored());
        assert_eq!(table.distance, Owner::Remote);
        assert_eq!(table.heart_rate, Owner::Local);

        let mut peer = healthy_peer();
        peer.circuit_open = true;
        assert_eq!(
            arbitrator.reevaluate(false, &peer),
            Some(OwnershipTable::all(Owner::Local))
        );
    }

    #[test]
    fn handheld_ignores_published_tables() {
        let mut arbitrator =
            OwnershipArbitrator::new(&ArbitrationConfig::default(), DeviceRole::Handheld);
        assert!(!arbitrator.record_published(OwnershipTable::all(Owner::Local)));
    }
}
