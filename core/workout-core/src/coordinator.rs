//! Per-device workout coordinator.
//!
//! One `WorkoutCoordinator` owns all mutable state for a device: the session,
//! the ownership table, the sync channel and the loop guard. Intents, inbound
//! envelopes and timer ticks all take `&mut self`, so they are applied one at
//! a time. Wrap it with [`crate::actor::spawn_coordinator`] when several
//! threads need to drive it.
//!
//! Outbound traffic:
//!
//! - start, pause, resume and handoff go out as control commands
//! - end goes out through both delivery modes
//! - metrics and tracking status are pushed on the sync timer
//! - ownership changes are pushed as soon as the context interval allows
//!
//! Changes applied on behalf of the peer are never echoed back.

use chrono::{DateTime, Utc};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::{debug, info, warn};
use ulid::Ulid;
use workout_sync_protocol::{
    wire_instant, ActivityKind, DeviceRole, LifecycleState, Message, MessageKind, OwnershipTable,
    SyncEnvelope, WorkoutStatus,
};

use crate::channel::{Lane, SendOutcome, SendReport, SyncChannel};
use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::error::{CoreError, Result};
use crate::events::{ChangeSource, CoordinatorEvent, Observers};
use crate::guard::{ApplyContext, LoopGuard};
use crate::handoff::{resolve_handoff, HandoffPlan};
use crate::ownership::{DeviceHealth, OwnershipArbitrator};
use crate::persist::SessionFinalizer;
use crate::resilience::{BreakerState, BreakerTransition, CircuitBreaker};
use crate::sensors::{classify_location, HeartRateSample, LocationSample};
use crate::session::{Intent, MetricsPatch, TransitionOutcome, WorkoutSession, WorkoutSnapshot};
use crate::transport::Transport;

/// A workout the peer is tracking that this idle device may join.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteOffer {
    pub session_id: String,
    pub status: WorkoutStatus,
}

pub struct WorkoutCoordinator {
    role: DeviceRole,
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    session: WorkoutSession,
    arbitrator: OwnershipArbitrator,
    channel: SyncChannel,
    guard: LoopGuard,
    apply_context: ApplyContext,
    finalizer: Box<dyn SessionFinalizer>,
    observers: Observers,
    sync_timer_running: bool,
    remote_offer: Option<RemoteOffer>,
    /// Peer's last reported table, mirrored to this side.
    peer_ownership: Option<OwnershipTable>,
    ownership_dirty: bool,
    was_reachable: bool,
    completed_session: Option<String>,
}

impl WorkoutCoordinator {
    pub fn new(
        role: DeviceRole,
        activity_kind: ActivityKind,
        config: CoordinatorConfig,
        transport: Box<dyn Transport>,
        clock: Arc<dyn Clock>,
        finalizer: Box<dyn SessionFinalizer>,
    ) -> Self {
        let channel = SyncChannel::new(
            transport,
            &config.channel,
            CircuitBreaker::new(&config.breaker),
        );
        let was_reachable = channel.is_reachable();
        let mut coordinator = Self {
            role,
            clock,
            session: WorkoutSession::new(activity_kind),
            arbitrator: OwnershipArbitrator::new(&config.arbitration, role),
            channel,
            guard: LoopGuard::new(&config.guard),
            apply_context: ApplyContext::Local,
            finalizer,
            observers: Observers::default(),
            sync_timer_running: false,
            remote_offer: None,
            peer_ownership: None,
            ownership_dirty: false,
            was_reachable,
            completed_session: None,
            config,
        };
        let health = coordinator.health();
        coordinator
            .arbitrator
            .reevaluate(coordinator.arbitration_indoor(), &health);
        coordinator
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.session.lifecycle()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.id()
    }

    pub fn snapshot(&self) -> WorkoutSnapshot {
        self.session.snapshot(self.clock.now())
    }

    pub fn ownership(&self) -> OwnershipTable {
        self.arbitrator.table()
    }

    pub fn peer_ownership(&self) -> Option<OwnershipTable> {
        self.peer_ownership
    }

    pub fn remote_offer(&self) -> Option<&RemoteOffer> {
        self.remote_offer.as_ref()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.channel.breaker_state()
    }

    pub fn pending_retries(&self) -> usize {
        self.channel.pending_retries()
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_timer_running
    }

    pub fn health(&self) -> DeviceHealth {
        let breaker = self.channel.breaker();
        DeviceHealth {
            reachable: self.channel.is_reachable(),
            paired: self.channel.is_paired(),
            location_quality: self.arbitrator.effective_quality(),
            consecutive_comm_failures: breaker.consecutive_failures(),
            circuit_open: breaker.is_open(),
            last_success_at: breaker.last_success_at(),
        }
    }

    pub fn subscribe(&mut self) -> Receiver<CoordinatorEvent> {
        self.observers.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Intents
    // ─────────────────────────────────────────────────────────────────────

    pub fn start(&mut self) -> Result<TransitionOutcome> {
        let now = self.clock.now();
        let outcome = self.session.start(Ulid::new().to_string(), now)?;
        self.remote_offer = None;
        self.peer_ownership = None;
        self.arbitrator.forget_published();
        self.completed_session = None;
        info!(
            session_id = self.session.id().unwrap_or_default(),
            kind = self.session.activity_kind().as_str(),
            role = self.role.as_str(),
            "Workout started"
        );

        self.after_transition(outcome);
        self.rearbitrate("session_start", now);
        let status = self.status(now);
        self.broadcast_control(Message::WorkoutUpdate(status), now);
        Ok(outcome)
    }

    pub fn pause(&mut self) -> Result<TransitionOutcome> {
        let now = self.clock.now();
        let outcome = self.session.pause(now)?;
        if outcome == TransitionOutcome::Unchanged {
            debug!("Pause ignored; already paused");
            return Ok(outcome);
        }
        info!(
            session_id = self.session.id().unwrap_or_default(),
            elapsed_secs = self.session.metrics().elapsed_active_time,
            "Workout paused"
        );
        self.after_transition(outcome);
        self.broadcast_control(Message::PauseWorkout, now);
        Ok(outcome)
    }

    pub fn resume(&mut self) -> Result<TransitionOutcome> {
        let now = self.clock.now();
        let outcome = self.session.resume(now)?;
        if outcome == TransitionOutcome::Unchanged {
            debug!("Resume ignored; already running");
            return Ok(outcome);
        }
        info!(session_id = self.session.id().unwrap_or_default(), "Workout resumed");
        self.after_transition(outcome);
        self.broadcast_control(Message::ResumeWorkout, now);
        Ok(outcome)
    }

    /// Completes the session, syncs the final state, hands it to the
    /// finalizer and resets to `NotStarted`.
    pub fn end(&mut self) -> Result<WorkoutSnapshot> {
        let now = self.clock.now();
        let snapshot = self.session.end(now)?;
        let session_id = snapshot.session_id.clone().unwrap_or_default();
        info!(
            session_id = %session_id,
            elapsed_secs = snapshot.metrics.elapsed_active_time,
            distance = snapshot.metrics.distance,
            "Workout ended"
        );
        self.after_transition(TransitionOutcome::Applied(LifecycleState::Completed));
        let dropped = self.channel.cancel_retries(&session_id);
        if dropped > 0 {
            debug!(dropped, "Dropped pending retries for the finished session");
        }

        if self.apply_context.suppresses_outbound() {
            debug!("Not echoing remote end");
        } else {
            let envelope = SyncEnvelope::new(
                session_id.clone(),
                self.role,
                now,
                Message::EndWorkout(self.status(now)),
            );
            let report = self.channel.send_durable(&envelope, now);
            self.handle_report(report, now);
        }

        self.finalize(&snapshot);
        self.observers.emit(CoordinatorEvent::SessionCompleted {
            snapshot: snapshot.clone(),
        });
        self.session.reset();
        self.peer_ownership = None;
        self.arbitrator.forget_published();
        self.ownership_dirty = false;
        self.completed_session = Some(session_id);
        Ok(snapshot)
    }

    pub fn set_indoor(&mut self, indoor: bool) {
        if self.session.is_indoor() == indoor {
            return;
        }
        info!(indoor, "Indoor mode changed");
        self.session.set_indoor(indoor);
        let now = self.clock.now();
        self.rearbitrate("indoor_toggle", now);
    }

    /// Asks the peer whether it is tracking a workout. The answer arrives as
    /// an `activeWorkoutResponse` and may raise `RemoteWorkoutAvailable`.
    pub fn request_active_workout(&mut self) {
        let now = self.clock.now();
        let envelope = SyncEnvelope::new("", self.role, now, Message::RequestActiveWorkout);
        let report = self.channel.send_control(&envelope, now);
        self.handle_report(report, now);
    }

    /// Offers the running session to the peer, which joins or merges.
    pub fn hand_off(&mut self) -> Result<()> {
        let state = self.session.lifecycle();
        if !state.is_active() {
            return Err(CoreError::InvalidTransition {
                intent: "hand off",
                state,
            });
        }
        let now = self.clock.now();
        let status = self.status(now);
        let envelope = self.envelope(Message::HandoffRequest(status), now);
        let report = self.channel.send_control(&envelope, now);
        self.handle_report(report, now);
        Ok(())
    }

    /// Joins the workout last offered by the peer.
    pub fn accept_join(&mut self) -> Result<WorkoutSnapshot> {
        let state = self.session.lifecycle();
        if state.is_active() {
            return Err(CoreError::InvalidTransition {
                intent: "join",
                state,
            });
        }
        let offer = self.remote_offer.take().ok_or(CoreError::NothingToJoin)?;
        let now = self.clock.now();
        let plan = resolve_handoff(None, &offer.session_id, &offer.status, now);
        self.apply_plan(&plan, ChangeSource::Local, now);

        let envelope = SyncEnvelope::new(
            plan.session_id.clone(),
            self.role,
            now,
            Message::HandoffResponse { accepted: true },
        );
        let report = self.channel.send_control(&envelope, now);
        self.handle_report(report, now);
        Ok(self.session.snapshot(now))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Local sensors
    // ─────────────────────────────────────────────────────────────────────

    pub fn record_location(&mut self, sample: LocationSample) {
        let now = self.clock.now();
        let quality = classify_location(&sample, self.config.arbitration.good_accuracy_meters);
        let quality_changed = self.arbitrator.observe_quality(quality, now);

        if self.session.is_joining() {
            info!(quality = ?quality, "Location reporting; arbitrating joined session");
            self.finish_joining(now);
        } else if quality_changed {
            self.rearbitrate("location_quality", now);
        }

        self.apply_local(
            MetricsPatch {
                distance: sample.distance,
                pace: sample.pace(),
                ..MetricsPatch::default()
            },
            now,
        );
    }

    pub fn record_heart_rate(&mut self, sample: HeartRateSample) {
        if !sample.is_plausible() {
            debug!(bpm = sample.bpm, "Discarding implausible heart rate");
            return;
        }
        let now = self.clock.now();
        if self.session.is_joining() && !self.session.profile().gps_bound {
            info!("Heart rate reporting; arbitrating joined session");
            self.finish_joining(now);
        }
        self.apply_local(
            MetricsPatch {
                heart_rate: Some(sample.bpm),
                ..MetricsPatch::default()
            },
            now,
        );
    }

    /// Readings computed outside the core (cadence, calories, elevation).
    /// Fields this device does not own are dropped.
    pub fn record_local_metrics(&mut self, patch: MetricsPatch) {
        let now = self.clock.now();
        self.apply_local(patch, now);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sync timer
    // ─────────────────────────────────────────────────────────────────────

    pub fn start_sync_timer(&mut self) {
        if !self.sync_timer_running {
            debug!("Sync timer started");
            self.sync_timer_running = true;
        }
    }

    pub fn stop_sync_timer(&mut self) {
        if self.sync_timer_running {
            debug!("Sync timer stopped");
            self.sync_timer_running = false;
        }
    }

    /// Stops periodic pushes while the app is suspended. Control commands
    /// still go out.
    pub fn enter_background(&mut self) {
        info!("Entering background");
        self.stop_sync_timer();
    }

    pub fn enter_foreground(&mut self) {
        info!("Entering foreground");
        if self.session.lifecycle() == LifecycleState::Running {
            self.start_sync_timer();
        }
    }

    /// Periodic work: elapsed time, reachability, retries, probes and
    /// steady-state pushes. Call about once a second.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        self.session.refresh(now);

        let reachable = self.channel.is_reachable();
        if reachable != self.was_reachable {
            self.was_reachable = reachable;
            info!(reachable, "Peer reachability changed");
            self.observers
                .emit(CoordinatorEvent::PeerReachabilityChanged { reachable });
            self.rearbitrate("reachability", now);
        }

        if self.arbitrator.promote_if_stable(now) {
            info!("Location quality stabilized");
            self.rearbitrate("location_quality", now);
        }

        for report in self.channel.poll_retries(now) {
            self.handle_report(report, now);
        }

        if self.channel.probe_due(now) {
            let probe = self.envelope(Message::Heartbeat, now);
            if let Some(report) = self.channel.probe(&probe, now) {
                self.handle_report(report, now);
            }
        }

        self.flush_ownership(now);
        self.push_periodic(now);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────

    /// Applies one envelope from the peer. Returns the reply to send back,
    /// if the message asks for one.
    pub fn handle_inbound(&mut self, envelope: SyncEnvelope) -> Option<SyncEnvelope> {
        let kind = envelope.kind();
        if envelope.origin == self.role {
            debug!(kind = kind.as_str(), "Ignoring self-authored envelope");
            return None;
        }
        if let Err(err) = envelope.validate() {
            warn!(error = %err, kind = kind.as_str(), "Rejecting invalid envelope");
            return None;
        }
        if !envelope.session_id.is_empty()
            && self.completed_session.as_deref() == Some(envelope.session_id.as_str())
        {
            debug!(kind = kind.as_str(), "Ignoring envelope for a finished session");
            return None;
        }

        let now = self.clock.now();
        if !self.guard.should_process(&envelope, now) {
            self.observers.emit(CoordinatorEvent::EnvelopeSuppressed {
                kind: kind.as_str(),
            });
            return None;
        }

        if matches!(
            kind,
            MessageKind::ActiveWorkoutResponse
                | MessageKind::HandoffResponse
                | MessageKind::TrackingStatus
        ) {
            let transition = self.channel.record_reply(now);
            self.on_breaker_transition(transition, now);
        }

        match &envelope.message {
            Message::WorkoutUpdate(status) => {
                self.on_remote_status(&envelope, status, now);
                None
            }
            Message::PauseWorkout => {
                self.apply_remote_intent(&envelope, Intent::Pause);
                None
            }
            Message::ResumeWorkout => {
                self.apply_remote_intent(&envelope, Intent::Resume);
                None
            }
            Message::EndWorkout(status) => {
                self.on_remote_end(&envelope, status, now);
                None
            }
            Message::RequestActiveWorkout => {
                let active = self
                    .session
                    .lifecycle()
                    .is_active()
                    .then(|| self.status(now));
                Some(self.envelope(Message::ActiveWorkoutResponse { active }, now))
            }
            Message::ActiveWorkoutResponse { active } => {
                match active {
                    Some(status) => self.consider_offer(&envelope.session_id, status),
                    None => debug!("Peer has no active workout"),
                }
                None
            }
            Message::HandoffRequest(status) => Some(self.on_handoff_request(&envelope, status, now)),
            Message::HandoffResponse { accepted } => {
                if *accepted {
                    info!(session_id = %envelope.session_id, "Peer accepted handoff");
                    self.observers.emit(CoordinatorEvent::HandoffAccepted {
                        session_id: envelope.session_id.clone(),
                    });
                } else {
                    warn!(session_id = %envelope.session_id, "Peer declined handoff");
                }
                None
            }
            Message::TrackingStatus { ownership, .. } => {
                self.on_peer_ownership(&envelope, *ownership, now);
                None
            }
            Message::Heartbeat => Some(self.tracking_status(now)),
        }
    }

    fn on_remote_status(&mut self, envelope: &SyncEnvelope, status: &WorkoutStatus, now: DateTime<Utc>) {
        if !self.session.lifecycle().is_active() {
            self.consider_offer(&envelope.session_id, status);
            return;
        }
        if !self.session.is_session(&envelope.session_id) {
            debug!(
                session_id = %envelope.session_id,
                "Ignoring update for another session"
            );
            return;
        }

        self.on_peer_ownership(envelope, status.ownership, now);
        let table = self.arbitrator.table();
        if self.session.apply_remote_metrics(&status.metrics, &table, now) {
            self.emit_metrics();
        }

        let intent = match (self.session.lifecycle(), status.lifecycle_state) {
            (LifecycleState::Running, LifecycleState::Paused) => Intent::Pause,
            (LifecycleState::Paused, LifecycleState::Running) => Intent::Resume,
            (_, LifecycleState::Completed) => Intent::End,
            _ => return,
        };
        self.apply_remote_intent(envelope, intent);
    }

    fn on_remote_end(&mut self, envelope: &SyncEnvelope, status: &WorkoutStatus, now: DateTime<Utc>) {
        if !self.session.is_session(&envelope.session_id) {
            if self
                .remote_offer
                .as_ref()
                .is_some_and(|offer| offer.session_id == envelope.session_id)
            {
                debug!(session_id = %envelope.session_id, "Offered workout ended");
                self.remote_offer = None;
            }
            return;
        }
        let table = self.arbitrator.table();
        if self.session.apply_remote_metrics(&status.metrics, &table, now) {
            self.emit_metrics();
        }
        self.apply_remote_intent(envelope, Intent::End);
    }

    /// Applies a peer's lifecycle command as if it were a local intent,
    /// without echoing it back.
    fn apply_remote_intent(&mut self, envelope: &SyncEnvelope, intent: Intent) {
        let kind = envelope.kind();
        if !self.session.is_session(&envelope.session_id) {
            debug!(
                kind = kind.as_str(),
                session_id = %envelope.session_id,
                "Ignoring command for another session"
            );
            return;
        }
        if let (Some(sent_at), Some(last)) = (envelope.sent_at(), self.session.last_transition_at()) {
            if sent_at + self.config.guard.stale_tolerance() < wire_instant(last) {
                debug!(kind = kind.as_str(), "Ignoring command older than the last transition");
                return;
            }
        }

        let result = self.with_remote(kind, |this| match intent {
            Intent::Pause => this.pause().map(|_| ()),
            Intent::Resume => this.resume().map(|_| ()),
            Intent::End => this.end().map(|_| ()),
            Intent::Start => Ok(()),
        });
        if let Err(err) = result {
            debug!(error = %err, kind = kind.as_str(), "Remote command not applicable");
        }
    }

    fn on_handoff_request(
        &mut self,
        envelope: &SyncEnvelope,
        status: &WorkoutStatus,
        now: DateTime<Utc>,
    ) -> SyncEnvelope {
        if !status.lifecycle_state.is_active() {
            warn!(
                session_id = %envelope.session_id,
                state = status.lifecycle_state.as_str(),
                "Declining handoff of an inactive workout"
            );
            return self.envelope(Message::HandoffResponse { accepted: false }, now);
        }

        let local = self
            .session
            .lifecycle()
            .is_active()
            .then(|| self.session.snapshot(now));
        let plan = resolve_handoff(local.as_ref(), &envelope.session_id, status, now);
        self.with_remote(envelope.kind(), |this| {
            this.apply_plan(&plan, ChangeSource::Remote, now)
        });
        SyncEnvelope::new(
            plan.session_id.clone(),
            self.role,
            now,
            Message::HandoffResponse { accepted: true },
        )
    }

    fn on_peer_ownership(&mut self, envelope: &SyncEnvelope, table: OwnershipTable, now: DateTime<Utc>) {
        if !envelope.session_id.is_empty() && !self.session.is_session(&envelope.session_id) {
            return;
        }
        let mirrored = table.mirrored();
        self.peer_ownership = Some(mirrored);

        if self.arbitrator.record_published(table) {
            if self.session.is_joining() {
                self.session.finish_joining();
            }
            self.rearbitrate("peer_table", now);
        } else if self.arbitrator.is_arbiter()
            && self.session.lifecycle().is_active()
            && mirrored != self.arbitrator.table()
        {
            debug!("Peer disagrees on ownership; republishing");
            self.ownership_dirty = true;
        }
    }

    fn consider_offer(&mut self, session_id: &str, status: &WorkoutStatus) {
        if session_id.is_empty() {
            return;
        }
        if !status.lifecycle_state.is_active() {
            if self
                .remote_offer
                .as_ref()
                .is_some_and(|offer| offer.session_id == session_id)
            {
                self.remote_offer = None;
            }
            return;
        }

        let offer = RemoteOffer {
            session_id: session_id.to_string(),
            status: status.clone(),
        };
        let is_new = self
            .remote_offer
            .as_ref()
            .map_or(true, |current| current.session_id != offer.session_id);
        self.remote_offer = Some(offer);
        if is_new {
            info!(
                session_id,
                kind = status.activity_kind.as_str(),
                "Peer is tracking a workout"
            );
            self.observers.emit(CoordinatorEvent::RemoteWorkoutAvailable {
                session_id: session_id.to_string(),
                status: status.clone(),
            });
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────

    fn apply_plan(&mut self, plan: &HandoffPlan, source: ChangeSource, now: DateTime<Utc>) {
        let previous = self.session.id().map(str::to_string);
        self.session.apply_handoff(plan, now);
        self.arbitrator.forget_published();
        self.remote_offer = None;
        self.completed_session = None;
        info!(
            resolution = ?plan.resolution,
            session_id = %plan.session_id,
            previous_session = ?previous,
            elapsed_secs = plan.elapsed_secs(),
            "Handoff resolved"
        );

        self.observers.emit(CoordinatorEvent::HandoffResolved {
            session_id: plan.session_id.clone(),
            resolution: plan.resolution,
        });
        self.observers.emit(CoordinatorEvent::LifecycleChanged {
            session_id: Some(plan.session_id.clone()),
            state: plan.lifecycle,
            source,
        });
        self.emit_metrics();

        if plan.lifecycle == LifecycleState::Running {
            self.start_sync_timer();
        } else {
            self.stop_sync_timer();
        }
        self.rearbitrate("handoff", now);
    }

    fn finish_joining(&mut self, now: DateTime<Utc>) {
        self.session.finish_joining();
        self.rearbitrate("joined", now);
    }

    fn apply_local(&mut self, patch: MetricsPatch, now: DateTime<Utc>) {
        self.session.refresh(now);
        let table = self.arbitrator.table();
        if self.session.apply_local_metrics(&patch, &table) {
            self.emit_metrics();
        }
    }

    fn after_transition(&mut self, outcome: TransitionOutcome) {
        let TransitionOutcome::Applied(state) = outcome else {
            return;
        };
        let source = if self.apply_context.suppresses_outbound() {
            ChangeSource::Remote
        } else {
            if let Some(id) = self.session.id() {
                self.guard.forget_lifecycle(id);
            }
            ChangeSource::Local
        };
        self.observers.emit(CoordinatorEvent::LifecycleChanged {
            session_id: self.session.id().map(str::to_string),
            state,
            source,
        });
        if state == LifecycleState::Running {
            self.start_sync_timer();
        } else {
            self.stop_sync_timer();
        }
    }

    /// Recomputes ownership and publishes a changed table. Deferred while a
    /// clean join waits for local sensors.
    fn rearbitrate(&mut self, reason: &'static str, now: DateTime<Utc>) {
        if self.session.is_joining() {
            debug!(reason, "Deferring arbitration until local sensors report");
            return;
        }
        let health = self.health();
        if let Some(table) = self.arbitrator.reevaluate(self.arbitration_indoor(), &health) {
            info!(reason, table = ?table, "Ownership changed");
            self.observers
                .emit(CoordinatorEvent::OwnershipChanged { table });
            self.ownership_dirty = true;
            self.flush_ownership(now);
        }
    }

    fn arbitration_indoor(&self) -> bool {
        self.session.is_indoor() || self.session.profile().forces_indoor
    }

    fn flush_ownership(&mut self, now: DateTime<Utc>) {
        if !self.ownership_dirty || self.apply_context.suppresses_outbound() {
            return;
        }
        if !self.session.lifecycle().is_active() {
            self.ownership_dirty = false;
            return;
        }
        let envelope = self.tracking_status(now);
        let report = self.channel.push_context(&envelope, Lane::Ownership, now);
        match report.outcome {
            // An open circuit publishes again when it closes.
            SendOutcome::Queued { .. } | SendOutcome::Skipped => self.ownership_dirty = false,
            _ => {}
        }
        self.handle_report(report, now);
    }

    fn push_periodic(&mut self, now: DateTime<Utc>) {
        if !self.sync_timer_running || self.session.lifecycle() != LifecycleState::Running {
            return;
        }
        if self.channel.lane_ready(Lane::Metrics, now) {
            let envelope = self.envelope(Message::WorkoutUpdate(self.status(now)), now);
            let report = self.channel.push_context(&envelope, Lane::Metrics, now);
            self.handle_report(report, now);
        }
        if self.channel.lane_ready(Lane::TrackingStatus, now) {
            let envelope = self.tracking_status(now);
            let report = self.channel.push_context(&envelope, Lane::TrackingStatus, now);
            self.handle_report(report, now);
        }
    }

    fn broadcast_control(&mut self, message: Message, now: DateTime<Utc>) {
        if let ApplyContext::Remote(cause) = self.apply_context {
            debug!(
                kind = message.kind().as_str(),
                cause = cause.as_str(),
                "Not echoing remote change"
            );
            return;
        }
        let envelope = self.envelope(message, now);
        let report = self.channel.send_control(&envelope, now);
        self.handle_report(report, now);
    }

    fn handle_report(&mut self, report: SendReport, now: DateTime<Utc>) {
        self.on_breaker_transition(report.breaker, now);
        if let Some(reply) = report.reply().cloned() {
            if let Some(unsent) = self.handle_inbound(reply) {
                debug!(kind = unsent.kind().as_str(), "Dropping reply to a reply");
            }
        }
    }

    fn on_breaker_transition(&mut self, transition: Option<BreakerTransition>, now: DateTime<Utc>) {
        match transition {
            Some(BreakerTransition::Opened) => {
                warn!(
                    failures = self.channel.breaker().consecutive_failures(),
                    "Peer unavailable; tracking on this device only"
                );
                self.observers
                    .emit(CoordinatorEvent::PeerAvailabilityChanged { available: false });
                self.rearbitrate("circuit_opened", now);
            }
            Some(BreakerTransition::Closed) => {
                info!("Peer available again");
                self.observers
                    .emit(CoordinatorEvent::PeerAvailabilityChanged { available: true });
                self.rearbitrate("circuit_closed", now);
            }
            None => {}
        }
    }

    fn finalize(&mut self, snapshot: &WorkoutSnapshot) {
        if let Err(err) = self.finalizer.finalize(snapshot) {
            warn!(
                error = %err,
                session_id = %err.session_id,
                "Failed to persist finished workout"
            );
            self.observers.emit(CoordinatorEvent::FinalizeFailed {
                session_id: err.session_id,
                message: err.message,
            });
        }
    }

    fn with_remote<R>(&mut self, kind: MessageKind, apply: impl FnOnce(&mut Self) -> R) -> R {
        let previous = std::mem::replace(&mut self.apply_context, ApplyContext::Remote(kind));
        let result = apply(self);
        self.apply_context = previous;
        result
    }

    fn emit_metrics(&mut self) {
        let metrics = *self.session.metrics();
        self.observers
            .emit(CoordinatorEvent::MetricsUpdated { metrics });
    }

    fn status(&self, now: DateTime<Utc>) -> WorkoutStatus {
        self.session.to_status(self.arbitrator.table(), now)
    }

    fn tracking_status(&self, now: DateTime<Utc>) -> SyncEnvelope {
        self.envelope(
            Message::TrackingStatus {
                lifecycle_state: self.session.lifecycle(),
                ownership: self.arbitrator.table(),
                is_indoor: self.session.is_indoor(),
            },
            now,
        )
    }

    fn envelope(&self, message: Message, now: DateTime<Utc>) -> SyncEnvelope {
        SyncEnvelope::new(
            self.session.id().unwrap_or_default(),
            self.role,
            now,
            message,
        )
    }
}
