use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use workout_sync_core::{
    evaluate, ActivityKind, BreakerState, ChangeSource, Clock, CoordinatorConfig, CoordinatorEvent,
    DeliveryMode, DeviceHealth, DeviceRole, DiscardFinalizer, FinalizeError, HandoffResolution,
    LifecycleState, LocationQuality, LocationSample, ManualClock, MemoryLink, Message,
    MessageKind, MetricsSnapshot, Owner, OwnershipTable, SessionFinalizer, SyncEnvelope,
    TransitionOutcome, WorkoutCoordinator, WorkoutSnapshot, WorkoutStatus,
};
use workout_sync_protocol::epoch_secs;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 7, 0, 0).unwrap()
}

struct Pair {
    link: MemoryLink,
    clock: ManualClock,
    handheld: WorkoutCoordinator,
    wearable: WorkoutCoordinator,
}

impl Pair {
    fn new(kind: ActivityKind) -> Self {
        let link = MemoryLink::new();
        let clock = ManualClock::new(t0());
        let handheld = device(DeviceRole::Handheld, kind, &link, &clock);
        let wearable = device(DeviceRole::Wearable, kind, &link, &clock);
        Self {
            link,
            clock,
            handheld,
            wearable,
        }
    }

    fn pump(&mut self) -> usize {
        self.link.pump(&mut self.handheld, &mut self.wearable, 16)
    }

    fn advance(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }
}

fn device(
    role: DeviceRole,
    kind: ActivityKind,
    link: &MemoryLink,
    clock: &ManualClock,
) -> WorkoutCoordinator {
    WorkoutCoordinator::new(
        role,
        kind,
        CoordinatorConfig::default(),
        Box::new(link.transport(role)),
        Arc::new(clock.clone()),
        Box::new(DiscardFinalizer),
    )
}

fn from_wearable(session_id: &str, at: DateTime<Utc>, message: Message) -> SyncEnvelope {
    SyncEnvelope::new(session_id, DeviceRole::Wearable, at, message)
}

fn running_status(elapsed: f64, heart_rate: f64) -> WorkoutStatus {
    WorkoutStatus {
        activity_kind: ActivityKind::Run,
        lifecycle_state: LifecycleState::Running,
        started_at: None,
        metrics: MetricsSnapshot {
            elapsed_active_time: elapsed,
            heart_rate: Some(heart_rate),
            ..MetricsSnapshot::default()
        },
        ownership: OwnershipTable::all(Owner::Local),
        is_indoor: false,
    }
}

fn sent_kinds(link: &MemoryLink, role: DeviceRole) -> Vec<MessageKind> {
    link.sent_by(role)
        .iter()
        .map(|sent| sent.envelope.kind())
        .collect()
}

fn drain(events: &Receiver<CoordinatorEvent>) -> Vec<CoordinatorEvent> {
    events.try_iter().collect()
}

#[test]
fn test_peer_pause_in_same_tick_is_applied_without_echo() {
    let mut pair = Pair::new(ActivityKind::Run);
    pair.handheld.start().unwrap();
    let id = pair.handheld.session_id().unwrap().to_string();
    pair.link.clear_sent();

    let pause = from_wearable(&id, t0(), Message::PauseWorkout);
    assert_eq!(pair.handheld.handle_inbound(pause.clone()), None);
    assert_eq!(pair.handheld.lifecycle(), LifecycleState::Paused);
    assert!(!sent_kinds(&pair.link, DeviceRole::Handheld).contains(&MessageKind::PauseWorkout));

    let events = pair.handheld.subscribe();
    assert_eq!(pair.handheld.handle_inbound(pause), None);
    assert!(drain(&events)
        .iter()
        .any(|event| matches!(event, CoordinatorEvent::EnvelopeSuppressed { kind } if *kind == "pauseWorkout")));
}

#[test]
fn test_idle_device_adopts_handoff_and_replies() {
    let mut pair = Pair::new(ActivityKind::Run);
    let events = pair.handheld.subscribe();

    let request = from_wearable("abc", t0(), Message::HandoffRequest(running_status(120.0, 140.0)));
    let reply = pair.handheld.handle_inbound(request).expect("handoff reply");

    assert_eq!(reply.session_id, "abc");
    assert_eq!(reply.origin, DeviceRole::Handheld);
    assert_eq!(reply.message, Message::HandoffResponse { accepted: true });

    let snapshot = pair.handheld.snapshot();
    assert_eq!(snapshot.session_id.as_deref(), Some("abc"));
    assert_eq!(snapshot.lifecycle_state, LifecycleState::Running);
    assert_eq!(snapshot.metrics.elapsed_active_time, 120.0);
    assert_eq!(snapshot.metrics.heart_rate, Some(140.0));
    assert!(snapshot.joining);

    let events = drain(&events);
    assert!(events.contains(&CoordinatorEvent::HandoffResolved {
        session_id: "abc".to_string(),
        resolution: HandoffResolution::CleanJoin,
    }));
    assert!(events.iter().any(|event| matches!(
        event,
        CoordinatorEvent::LifecycleChanged {
            state: LifecycleState::Running,
            source: ChangeSource::Remote,
            ..
        }
    )));
}

#[test]
fn test_conflicting_join_keeps_larger_elapsed() {
    let mut pair = Pair::new(ActivityKind::Run);
    pair.handheld.start().unwrap();
    pair.advance(300);
    pair.handheld.tick();

    let request = from_wearable(
        "abc",
        t0() + Duration::seconds(300),
        Message::HandoffRequest(running_status(280.0, 150.0)),
    );
    let reply = pair.handheld.handle_inbound(request).expect("handoff reply");
    assert_eq!(reply.session_id, "abc");

    let snapshot = pair.handheld.snapshot();
    assert_eq!(snapshot.session_id.as_deref(), Some("abc"));
    assert_eq!(snapshot.metrics.elapsed_active_time, 300.0);
    assert_eq!(snapshot.metrics.heart_rate, Some(150.0));
    assert!(!snapshot.joining);
}

#[test]
fn test_circuit_opens_after_three_failures_and_probe_closes_it() {
    let mut pair = Pair::new(ActivityKind::Run);
    let healthy = evaluate(
        false,
        LocationQuality::Degraded,
        &DeviceHealth {
            reachable: true,
            paired: true,
            ..DeviceHealth::default()
        },
    );
    assert_eq!(pair.handheld.ownership(), healthy);
    assert_eq!(pair.handheld.ownership().heart_rate, Owner::Remote);
    let events = pair.handheld.subscribe();

    pair.link.fail_next(3);
    pair.handheld.start().unwrap();
    pair.handheld.pause().unwrap();
    pair.handheld.resume().unwrap();

    assert_eq!(pair.handheld.breaker_state(), BreakerState::Open);
    assert!(pair.handheld.health().circuit_open);
    assert_eq!(pair.handheld.ownership(), OwnershipTable::all(Owner::Local));
    assert!(drain(&events).contains(&CoordinatorEvent::PeerAvailabilityChanged { available: false }));

    // Steady-state pushes are skipped while open.
    pair.link.clear_sent();
    pair.advance(10);
    pair.handheld.tick();
    assert!(pair.link.sent_by(DeviceRole::Handheld).is_empty());

    pair.advance(25);
    pair.handheld.tick();
    assert_eq!(pair.handheld.breaker_state(), BreakerState::Closed);
    assert_eq!(pair.handheld.health().consecutive_comm_failures, 0);
    assert_eq!(pair.handheld.ownership(), healthy);

    let events = drain(&events);
    assert!(events.contains(&CoordinatorEvent::PeerAvailabilityChanged { available: true }));
    assert!(events.contains(&CoordinatorEvent::OwnershipChanged { table: healthy }));
}

#[test]
fn test_duplicate_pause_is_idempotent() {
    let mut pair = Pair::new(ActivityKind::Run);
    pair.handheld.start().unwrap();
    let id = pair.handheld.session_id().unwrap().to_string();
    pair.advance(30);

    assert_eq!(
        pair.handheld.pause().unwrap(),
        TransitionOutcome::Applied(LifecycleState::Paused)
    );
    let once = pair.handheld.snapshot();
    assert_eq!(pair.handheld.pause().unwrap(), TransitionOutcome::Unchanged);

    pair.handheld.handle_inbound(from_wearable(
        &id,
        t0() + Duration::seconds(30),
        Message::PauseWorkout,
    ));
    pair.handheld.handle_inbound(from_wearable(
        &id,
        t0() + Duration::seconds(31),
        Message::PauseWorkout,
    ));
    assert_eq!(pair.handheld.snapshot(), once);
}

#[test]
fn test_pause_accounting_preserves_elapsed_across_pause() {
    let mut pair = Pair::new(ActivityKind::Walk);
    pair.handheld.start().unwrap();
    pair.advance(60);
    pair.handheld.pause().unwrap();
    let before = pair.handheld.snapshot();
    assert_eq!(before.metrics.elapsed_active_time, 60.0);

    pair.advance(45);
    pair.handheld.resume().unwrap();
    let after = pair.handheld.snapshot();
    assert_eq!(after.metrics.elapsed_active_time, 60.0);
    assert_eq!(after.paused_accumulator_secs, before.paused_accumulator_secs + 45.0);
}

#[test]
fn test_elapsed_time_never_decreases_under_remote_updates() {
    let mut pair = Pair::new(ActivityKind::Run);
    pair.handheld.start().unwrap();
    let id = pair.handheld.session_id().unwrap().to_string();

    let mut last = 0.0;
    for (step, remote_elapsed) in [5.0, 50.0, 12.0, 130.0, 90.0, 131.0].into_iter().enumerate() {
        pair.advance(10);
        let at = t0() + Duration::seconds(10 * (step as i64 + 1));
        pair.handheld.handle_inbound(from_wearable(
            &id,
            at,
            Message::WorkoutUpdate(running_status(remote_elapsed, 120.0 + step as f64)),
        ));
        pair.handheld.tick();
        let elapsed = pair.handheld.snapshot().metrics.elapsed_active_time;
        assert!(elapsed >= last, "elapsed went from {last} to {elapsed}");
        assert!(elapsed >= remote_elapsed);
        last = elapsed;
    }
    // Rebased to 130 at t+40, then twenty more seconds of local running.
    assert_eq!(last, 150.0);
}

#[test]
fn test_two_devices_stay_converged_through_a_session() {
    let mut pair = Pair::new(ActivityKind::Run);
    let wearable_events = pair.wearable.subscribe();
    let handheld_events = pair.handheld.subscribe();

    pair.handheld.start().unwrap();
    let id = pair.handheld.session_id().unwrap().to_string();
    pair.pump();
    assert_eq!(
        pair.wearable.remote_offer().map(|offer| offer.session_id.clone()),
        Some(id.clone())
    );

    let joined = pair.wearable.accept_join().unwrap();
    assert_eq!(joined.session_id.as_deref(), Some(id.as_str()));
    pair.pump();
    assert!(drain(&handheld_events).contains(&CoordinatorEvent::HandoffAccepted {
        session_id: id.clone()
    }));

    pair.advance(10);
    pair.link.clear_sent();
    pair.wearable.pause().unwrap();
    pair.pump();
    assert_eq!(pair.handheld.lifecycle(), LifecycleState::Paused);
    assert!(!sent_kinds(&pair.link, DeviceRole::Handheld).contains(&MessageKind::PauseWorkout));

    pair.advance(10);
    pair.handheld.resume().unwrap();
    pair.pump();
    assert_eq!(pair.wearable.lifecycle(), LifecycleState::Running);

    pair.advance(10);
    let finished = pair.handheld.end().unwrap();
    pair.pump();
    assert_eq!(finished.metrics.elapsed_active_time, 20.0);
    assert_eq!(pair.wearable.lifecycle(), LifecycleState::NotStarted);
    assert!(!sent_kinds(&pair.link, DeviceRole::Wearable).contains(&MessageKind::EndWorkout));

    let completed: Vec<WorkoutSnapshot> = drain(&wearable_events)
        .into_iter()
        .filter_map(|event| match event {
            CoordinatorEvent::SessionCompleted { snapshot } => Some(snapshot),
            _ => None,
        })
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].session_id.as_deref(), Some(id.as_str()));
}

#[test]
fn test_good_fix_moves_distance_to_handheld_after_stabilizing() {
    let mut pair = Pair::new(ActivityKind::Run);
    pair.handheld.start().unwrap();
    assert_eq!(pair.handheld.ownership().distance, Owner::Remote);

    let sample = |at: DateTime<Utc>, distance: f64| LocationSample {
        latitude: 47.6,
        longitude: -122.3,
        horizontal_accuracy: 6.0,
        speed: Some(3.2),
        distance: Some(distance),
        timestamp: at,
    };
    pair.handheld.record_location(sample(t0(), 0.0));
    assert_eq!(pair.handheld.ownership().distance, Owner::Remote);

    pair.advance(6);
    pair.handheld.tick();
    let table = pair.handheld.ownership();
    assert_eq!(table.distance, Owner::Local);
    assert_eq!(table.pace, Owner::Local);
    assert_eq!(table.heart_rate, Owner::Remote);

    pair.handheld.record_location(sample(t0() + Duration::seconds(6), 19.5));
    assert_eq!(pair.handheld.snapshot().metrics.distance, 19.5);

    let published = pair
        .link
        .sent_by(DeviceRole::Handheld)
        .into_iter()
        .filter(|sent| sent.mode == DeliveryMode::Context)
        .any(|sent| matches!(sent.envelope.message, Message::TrackingStatus { ownership, .. } if ownership == table));
    assert!(published);

    pair.handheld.set_indoor(true);
    assert_eq!(pair.handheld.ownership(), OwnershipTable::all(Owner::Remote));
}

#[test]
fn test_wearable_follows_published_ownership() {
    let mut pair = Pair::new(ActivityKind::Run);
    pair.handheld.start().unwrap();
    pair.pump();
    pair.wearable.accept_join().unwrap();
    pair.pump();

    pair.handheld.record_location(LocationSample {
        latitude: 47.6,
        longitude: -122.3,
        horizontal_accuracy: 5.0,
        speed: None,
        distance: None,
        timestamp: t0(),
    });
    pair.advance(6);
    pair.handheld.tick();
    pair.pump();

    let handheld = pair.handheld.ownership();
    assert_eq!(handheld.distance, Owner::Local);
    assert_eq!(pair.wearable.ownership(), handheld.mirrored());
}

struct FailingFinalizer;

impl SessionFinalizer for FailingFinalizer {
    fn finalize(&mut self, snapshot: &WorkoutSnapshot) -> Result<(), FinalizeError> {
        Err(FinalizeError {
            session_id: snapshot.session_id.clone().unwrap_or_default(),
            message: "disk full".to_string(),
        })
    }
}

#[test]
fn test_finalize_failure_does_not_block_teardown() {
    let link = MemoryLink::new();
    let clock = ManualClock::new(t0());
    let mut handheld = WorkoutCoordinator::new(
        DeviceRole::Handheld,
        ActivityKind::StrengthSet,
        CoordinatorConfig::default(),
        Box::new(link.transport(DeviceRole::Handheld)),
        Arc::new(clock.clone()),
        Box::new(FailingFinalizer),
    );
    let events = handheld.subscribe();
    handheld.start().unwrap();
    clock.advance(Duration::seconds(40));

    let snapshot = handheld.end().unwrap();
    assert_eq!(snapshot.lifecycle_state, LifecycleState::Completed);
    assert_eq!(handheld.lifecycle(), LifecycleState::NotStarted);

    let events = drain(&events);
    assert!(events.iter().any(|event| matches!(
        event,
        CoordinatorEvent::FinalizeFailed { message, .. } if message == "disk full"
    )));
    assert!(events
        .iter()
        .any(|event| matches!(event, CoordinatorEvent::SessionCompleted { .. })));
}

#[test]
fn test_active_workout_query_discovers_peer_session() {
    let mut pair = Pair::new(ActivityKind::Hike);
    pair.wearable.start().unwrap();
    let id = pair.wearable.session_id().unwrap().to_string();
    pair.advance(70);
    pair.link.clear_sent();

    // Handheld came up late and missed the start broadcast.
    pair.link.take_deliveries(DeviceRole::Handheld);
    pair.handheld = device(DeviceRole::Handheld, ActivityKind::Hike, &pair.link, &pair.clock);
    pair.handheld.request_active_workout();
    pair.pump();

    let offer = pair.handheld.remote_offer().expect("offer");
    assert_eq!(offer.session_id, id);
    assert_eq!(offer.status.activity_kind, ActivityKind::Hike);
    assert_eq!(offer.status.metrics.elapsed_active_time, 70.0);
    assert_eq!(offer.status.started_at, Some(epoch_secs(t0())));
}

fn lone_handheld(start: DateTime<Utc>) -> (MemoryLink, ManualClock, WorkoutCoordinator) {
    let link = MemoryLink::new();
    let clock = ManualClock::new(start);
    let handheld = device(DeviceRole::Handheld, ActivityKind::Run, &link, &clock);
    (link, clock, handheld)
}

fn context_kinds(link: &MemoryLink, role: DeviceRole) -> Vec<MessageKind> {
    link.sent_by(role)
        .iter()
        .filter(|sent| sent.mode == DeliveryMode::Context)
        .map(|sent| sent.envelope.kind())
        .collect()
}

#[test]
fn test_peer_pause_after_local_resume_is_not_mistaken_for_a_repeat() {
    let (_link, clock, mut handheld) = lone_handheld(t0());
    handheld.start().unwrap();
    let id = handheld.session_id().unwrap().to_string();

    clock.advance(Duration::milliseconds(500));
    handheld.handle_inbound(from_wearable(&id, clock.now(), Message::PauseWorkout));
    assert_eq!(handheld.lifecycle(), LifecycleState::Paused);

    clock.advance(Duration::milliseconds(500));
    handheld.resume().unwrap();
    assert_eq!(handheld.lifecycle(), LifecycleState::Running);

    clock.advance(Duration::seconds(1));
    handheld.handle_inbound(from_wearable(&id, clock.now(), Message::PauseWorkout));
    assert_eq!(handheld.lifecycle(), LifecycleState::Paused);
}

#[test]
fn test_same_tick_pause_survives_sub_millisecond_clock() {
    let start = t0() + Duration::microseconds(400);
    let (_link, clock, mut handheld) = lone_handheld(start);
    handheld.start().unwrap();
    let id = handheld.session_id().unwrap().to_string();

    handheld.handle_inbound(from_wearable(&id, clock.now(), Message::PauseWorkout));
    assert_eq!(handheld.lifecycle(), LifecycleState::Paused);
}

#[test]
fn test_peer_clock_slightly_behind_still_pauses() {
    let (_link, clock, mut handheld) = lone_handheld(t0());
    handheld.start().unwrap();
    let id = handheld.session_id().unwrap().to_string();

    let skewed = clock.now() - Duration::milliseconds(200);
    handheld.handle_inbound(from_wearable(&id, skewed, Message::PauseWorkout));
    assert_eq!(handheld.lifecycle(), LifecycleState::Paused);

    // Well outside the tolerance the command is stale.
    clock.advance(Duration::seconds(10));
    handheld.resume().unwrap();
    let stale = clock.now() - Duration::seconds(2);
    handheld.handle_inbound(from_wearable(&id, stale, Message::PauseWorkout));
    assert_eq!(handheld.lifecycle(), LifecycleState::Running);
}

#[test]
fn test_tracking_status_follows_its_own_cadence() {
    let (link, clock, mut handheld) = lone_handheld(t0());
    handheld.start().unwrap();
    for _ in 0..5 {
        clock.advance(Duration::seconds(1));
        handheld.tick();
    }
    link.clear_sent();

    let mut status_at = Vec::new();
    let mut updates = 0;
    for second in 6..=66 {
        clock.advance(Duration::seconds(1));
        handheld.tick();
        let kinds = context_kinds(&link, DeviceRole::Handheld);
        if kinds.contains(&MessageKind::TrackingStatus) {
            status_at.push(second);
        }
        updates += kinds
            .iter()
            .filter(|kind| **kind == MessageKind::WorkoutUpdate)
            .count();
        link.clear_sent();
    }

    assert!(status_at.len() >= 3, "status pushes at {:?}", status_at);
    for gap in status_at.windows(2).map(|pair| pair[1] - pair[0]) {
        assert!((15..=17).contains(&gap), "status pushes at {:?}", status_at);
    }
    assert!(updates >= 20, "only {} metric pushes", updates);
}

#[test]
fn test_control_command_bypasses_throttled_metrics_lane() {
    let (link, clock, mut handheld) = lone_handheld(t0());
    handheld.start().unwrap();

    let mut pushed = false;
    for _ in 0..5 {
        clock.advance(Duration::seconds(1));
        link.clear_sent();
        handheld.tick();
        if context_kinds(&link, DeviceRole::Handheld).contains(&MessageKind::WorkoutUpdate) {
            pushed = true;
            break;
        }
    }
    assert!(pushed);

    link.clear_sent();
    clock.advance(Duration::milliseconds(200));
    handheld.tick();
    assert!(!context_kinds(&link, DeviceRole::Handheld).contains(&MessageKind::WorkoutUpdate));

    handheld.pause().unwrap();
    let pause: Vec<DeliveryMode> = link
        .sent_by(DeviceRole::Handheld)
        .iter()
        .filter(|sent| sent.envelope.kind() == MessageKind::PauseWorkout)
        .map(|sent| sent.mode)
        .collect();
    assert_eq!(pause, vec![DeliveryMode::Immediate]);
}

#[test]
fn test_end_drops_retries_for_the_finished_session() {
    let (link, clock, mut handheld) = lone_handheld(t0());
    handheld.start().unwrap();
    link.set_reachable(false);
    clock.advance(Duration::seconds(1));
    handheld.pause().unwrap();
    clock.advance(Duration::seconds(1));
    handheld.resume().unwrap();
    assert_eq!(handheld.pending_retries(), 2);

    link.set_reachable(true);
    handheld.end().unwrap();
    assert_eq!(handheld.pending_retries(), 0);

    link.clear_sent();
    clock.advance(Duration::seconds(30));
    handheld.tick();
    let kinds = sent_kinds(&link, DeviceRole::Handheld);
    assert!(!kinds.contains(&MessageKind::PauseWorkout));
    assert!(!kinds.contains(&MessageKind::ResumeWorkout));
}
