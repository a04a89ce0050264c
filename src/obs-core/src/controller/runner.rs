// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! The controller's single consuming loop.
//!
//! Each [`ObservatoryController::step`] first drains the inbound queue and
//! applies every queued message (the checkpoint), then performs the action
//! of the current state. Long actions (pointing, science exposures) consult
//! the queue again between device operations. A science exposure in flight
//! is abandoned as soon as a preempting message arrives.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::device::{Camera, DeviceError, DeviceErrorKind, ImageHandle, Mount, PlateSolver};
use crate::error::ObsError;
use crate::message::{ObsMessage, OverrideAction, SafetyStatus};
use crate::pointing::{AbortReason, Checkpoint, PointingConfig, PointingLoop, PointingOutcome};
use crate::scheduler::{FailureKind, FailureVerdict, TargetScheduler};
use crate::target::Target;
use crate::DynResult;

use super::events::{ListenerId, ObsEventEmitter, ObsListener};
use super::executor::{execute_with_retry, MountCommand};
use super::machine::{
    EventKind, ObsEvent, ObservationSnapshot, ObservationState, ObservationStateMachine,
    Transition,
};
use super::policies::ExponentialBackoff;

/// Consecutive steps without progress before the controller gives up on the
/// current state and parks.
pub const STALL_LIMIT: u32 = 5;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub pointing: PointingConfig,
    pub retry: ExponentialBackoff,
    /// How long conditions may stay unsafe in `SafetyHold` before parking.
    pub safety_grace: Duration,
    /// Upper bound on any idle wait, so queued messages are applied promptly.
    pub checkpoint_interval: Duration,
    /// Re-check interval while waiting for darkness or for a cooldown to end.
    pub idle_retry: Duration,
    /// Start a run as soon as the loop starts.
    pub auto_start: bool,
    /// Return from [`ObservatoryController::run`] once a run ends in `Parked`.
    /// Otherwise a run that runs out of targets stays armed and waits in
    /// `Parked` for one to rise.
    pub exit_when_done: bool,
    pub initial_safety: SafetyStatus,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            pointing: PointingConfig::default(),
            retry: ExponentialBackoff::default(),
            safety_grace: Duration::from_secs(900),
            checkpoint_interval: Duration::from_millis(500),
            idle_retry: Duration::from_secs(60),
            auto_start: true,
            exit_when_done: false,
            initial_safety: SafetyStatus::default(),
        }
    }
}

pub struct Devices {
    pub mount: Box<dyn Mount>,
    pub camera: Box<dyn Camera>,
    pub solver: Box<dyn PlateSolver>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The state action ran.
    Continue,
    /// Waited on purpose (darkness, cooldown, safety).
    Idle,
    /// The loop is finished.
    Exit,
}

/// Source of "now" for scheduling decisions.
pub type Clock = fn() -> DateTime<Utc>;

pub struct ObservatoryController {
    machine: ObservationStateMachine,
    scheduler: TargetScheduler,
    devices: Devices,
    emitter: ObsEventEmitter,
    inbox: mpsc::Receiver<ObsMessage>,
    pending: VecDeque<ObsMessage>,
    inbox_closed: bool,
    safety: SafetyStatus,
    config: ControllerConfig,
    clock: Clock,
    run_active: bool,
    shutdown_requested: bool,
    hold_since: Option<Instant>,
    stalled: u32,
}

/// Checkpoint backed by the controller's inbound queue.
struct InboxCheckpoint<'a> {
    inbox: &'a mut mpsc::Receiver<ObsMessage>,
    pending: &'a mut VecDeque<ObsMessage>,
    closed: &'a mut bool,
    safety: SafetyStatus,
    progress: Option<PointingProgress<'a>>,
}

/// Publishes the pointing iteration as each capture starts.
struct PointingProgress<'a> {
    machine: &'a mut ObservationStateMachine,
    emitter: &'a ObsEventEmitter,
    run_active: bool,
}

fn drain_inbox(
    inbox: &mut mpsc::Receiver<ObsMessage>,
    pending: &mut VecDeque<ObsMessage>,
    closed: &mut bool,
) {
    loop {
        match inbox.try_recv() {
            Ok(msg) => pending.push_back(msg),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                *closed = true;
                break;
            }
        }
    }
}

impl Checkpoint for InboxCheckpoint<'_> {
    fn interrupt(&mut self) -> Option<String> {
        drain_inbox(self.inbox, self.pending, self.closed);
        self.pending
            .iter()
            .find(|msg| msg.preempts(&self.safety))
            .map(|msg| format!("{:?}", msg))
    }

    fn iteration_started(&mut self, iteration: u32) {
        if let Some(progress) = self.progress.as_mut() {
            progress.machine.set_pointing_iteration(iteration);
            progress.emitter.notify_snapshot(
                &progress
                    .machine
                    .snapshot(self.safety.is_safe(), progress.run_active),
            );
        }
    }
}

fn target_suffix(transition: &Transition) -> String {
    match &transition.target {
        Some(id) => format!(" [{}]", id),
        None => String::new(),
    }
}

impl ObservatoryController {
    pub fn new(
        machine: ObservationStateMachine,
        scheduler: TargetScheduler,
        devices: Devices,
        inbox: mpsc::Receiver<ObsMessage>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            machine,
            scheduler,
            devices,
            emitter: ObsEventEmitter::new(),
            inbox,
            pending: VecDeque::new(),
            inbox_closed: false,
            safety: config.initial_safety,
            run_active: config.auto_start,
            config,
            clock: Utc::now,
            shutdown_requested: false,
            hold_since: None,
            stalled: 0,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn register_listener(&mut self, listener: Arc<dyn ObsListener>) -> ListenerId {
        self.emitter.register(listener)
    }

    pub fn machine(&self) -> &ObservationStateMachine {
        &self.machine
    }

    pub fn scheduler(&self) -> &TargetScheduler {
        &self.scheduler
    }

    pub fn safety(&self) -> &SafetyStatus {
        &self.safety
    }

    pub fn snapshot(&self) -> ObservationSnapshot {
        self.machine
            .snapshot(self.safety.is_safe(), self.run_active)
    }

    fn publish(&self) {
        self.emitter.notify_snapshot(&self.snapshot());
    }

    /// Drive the machine until it exits.
    pub async fn run(&mut self) -> Result<(), ObsError> {
        let now = (self.clock)();
        let site = self.scheduler.visibility().site();
        info!(
            "Controller started (table: {}, scheduler: {}, {} targets, local time {})",
            self.machine.table().name(),
            self.scheduler.kind(),
            self.scheduler.targets().len(),
            site.local_time(now).format("%Y-%m-%d %H:%M")
        );
        self.publish();
        loop {
            if self.step().await? == StepOutcome::Exit {
                break;
            }
        }
        info!("Controller stopped in {}", self.machine.state());
        Ok(())
    }

    /// Apply queued messages, then run one state action.
    pub async fn step(&mut self) -> Result<StepOutcome, ObsError> {
        drain_inbox(&mut self.inbox, &mut self.pending, &mut self.inbox_closed);
        while let Some(msg) = self.pending.pop_front() {
            self.apply_message(msg).await;
        }

        let before = self.machine.transition_count();
        let outcome = match self.machine.state() {
            ObservationState::Parked => self.on_parked().await,
            ObservationState::Scheduling => self.on_scheduling().await,
            ObservationState::Slewing => self.on_slewing().await,
            ObservationState::PointingRefinement => self.on_pointing().await,
            ObservationState::Tracking => self.on_tracking().await,
            ObservationState::Observing => self.on_observing().await,
            ObservationState::Analyzing => self.on_analyzing(),
            ObservationState::Parking => self.on_parking().await,
            ObservationState::SafetyHold => self.on_safety_hold().await,
        };

        if self.machine.transition_count() != before {
            self.stalled = 0;
        } else if outcome == StepOutcome::Continue && self.pending.is_empty() {
            self.stalled += 1;
            if self.stalled >= STALL_LIMIT {
                let state = self.machine.state();
                if state == ObservationState::Parking {
                    error!("Unable to park after {} attempts", self.stalled);
                    return Err(ObsError::Stalled {
                        state,
                        attempts: self.stalled,
                    });
                }
                warn!(
                    "Stuck in {} for {} iterations, parking",
                    state, self.stalled
                );
                self.stalled = 0;
                self.run_active = false;
                self.fire(ObsEvent::Park);
            }
        }
        Ok(outcome)
    }

    fn fire(&mut self, event: ObsEvent) -> Option<Transition> {
        let transition = self.machine.process_event(event)?;
        info!(
            "{} -> {}{}",
            transition.previous,
            transition.current,
            target_suffix(&transition)
        );
        let snapshot = self.snapshot();
        self.emitter.notify_state_change(&transition, &snapshot);
        self.emitter.notify_snapshot(&snapshot);
        Some(transition)
    }

    async fn apply_message(&mut self, msg: ObsMessage) {
        debug!("Applying {:?} in {}", msg, self.machine.state());
        match msg {
            ObsMessage::Safety(signal) => {
                if self.safety.apply(&signal) {
                    self.emitter.notify_safety_change(&self.safety);
                    self.publish();
                    if self.safety.is_safe() {
                        info!("Conditions safe again ({} signal)", signal.kind);
                    }
                }
                if !self.safety.is_safe() && self.machine.state().is_active() {
                    warn!("{} unsafe, holding", signal.kind);
                    self.enter_safety_hold().await;
                }
            }
            ObsMessage::Shutdown => {
                info!("Shutdown requested");
                self.shutdown_requested = true;
                self.run_active = false;
                self.fire(ObsEvent::Park);
            }
            ObsMessage::Override(OverrideAction::Park) => {
                info!("Operator park requested");
                self.run_active = false;
                self.fire(ObsEvent::Park);
                self.publish();
            }
            ObsMessage::Override(OverrideAction::Resume) => {
                if self.machine.state() == ObservationState::Parked && !self.shutdown_requested {
                    info!("Run resumed by operator");
                    self.run_active = true;
                    self.publish();
                } else {
                    debug!("Resume ignored in {}", self.machine.state());
                }
            }
            ObsMessage::Override(OverrideAction::Skip) => {
                match self.machine.target().map(str::to_string) {
                    Some(id) if self.machine.accepts(EventKind::Skip) => {
                        info!("Skipping {} on operator request", id);
                        self.fire(ObsEvent::Skip);
                    }
                    _ => debug!("Nothing to skip in {}", self.machine.state()),
                }
            }
        }
    }

    async fn enter_safety_hold(&mut self) {
        let Some(transition) = self.fire(ObsEvent::Unsafe) else {
            return;
        };
        self.hold_since = Some(Instant::now());
        if let Some(id) = transition.released {
            warn!("Released {} without counting the observation", id);
        }
        match execute_with_retry(
            self.devices.mount.as_mut(),
            MountCommand::Stop,
            &self.config.retry,
        )
        .await
        {
            Ok(()) => {}
            Err(e) if e.kind == DeviceErrorKind::NotSupported => {}
            Err(e) => warn!("Failed to stop mount: {}", e),
        }
    }

    /// Wait for one inbound message, or at most `limit`.
    async fn wait_for_message(&mut self, limit: Option<Duration>) {
        if self.inbox_closed {
            if let Some(limit) = limit {
                time::sleep(limit).await;
            }
            return;
        }
        let received = match limit {
            Some(limit) => match time::timeout(limit, self.inbox.recv()).await {
                Ok(msg) => msg,
                Err(_) => return,
            },
            None => self.inbox.recv().await,
        };
        match received {
            Some(msg) => self.pending.push_back(msg),
            None => {
                debug!("Inbound channel closed");
                self.inbox_closed = true;
            }
        }
    }

    /// Run a science exposure while listening to the inbox. Returns `None`
    /// when a queued message preempts the frame.
    async fn capture_or_preempt(&mut self, exptime_secs: f64) -> Option<DynResult<ImageHandle>> {
        let mut capture = self.devices.camera.capture(exptime_secs);
        loop {
            if self.inbox_closed {
                return Some(capture.await);
            }
            tokio::select! {
                biased;
                result = &mut capture => return Some(result),
                received = self.inbox.recv() => match received {
                    Some(msg) => {
                        let preempts = msg.preempts(&self.safety);
                        self.pending.push_back(msg);
                        if preempts {
                            return None;
                        }
                    }
                    None => {
                        debug!("Inbound channel closed");
                        self.inbox_closed = true;
                    }
                },
            }
        }
    }

    fn current_target(&self) -> Option<Target> {
        self.machine
            .target()
            .and_then(|id| self.scheduler.target(id))
            .cloned()
    }

    fn fail_target(&mut self, id: &str, kind: FailureKind) {
        let now = (self.clock)();
        match self.scheduler.record_failure(id, now, kind) {
            Some(FailureVerdict::Excluded { failures }) => {
                warn!("{} excluded for this run after {} failures", id, failures)
            }
            Some(FailureVerdict::Cooldown {
                until: Some(until),
                failures,
            }) => info!(
                "{} cooling down until {} ({} failure(s))",
                id,
                until.format("%H:%M:%S"),
                failures
            ),
            Some(FailureVerdict::Cooldown { failures, .. }) => {
                info!("{} cooling down ({} failure(s))", id, failures)
            }
            None => {}
        }
    }

    async fn park_mount(&mut self) -> bool {
        match execute_with_retry(
            self.devices.mount.as_mut(),
            MountCommand::Park,
            &self.config.retry,
        )
        .await
        {
            Ok(()) => true,
            Err(e) => {
                error!("Park failed: {}", e);
                false
            }
        }
    }

    async fn on_parked(&mut self) -> StepOutcome {
        if self.shutdown_requested || (self.inbox_closed && !self.run_active) {
            return StepOutcome::Exit;
        }
        if !self.run_active {
            if self.config.exit_when_done {
                return StepOutcome::Exit;
            }
            self.wait_for_message(None).await;
            return StepOutcome::Idle;
        }
        if !self.safety.is_safe() {
            debug!("Waiting for safe conditions before starting");
            self.wait_for_message(Some(self.config.idle_retry)).await;
            return StepOutcome::Idle;
        }
        let now = (self.clock)();
        if !self.scheduler.visibility().is_dark(&now) {
            debug!(
                "Sun at {:.1}°, waiting for twilight",
                self.scheduler.visibility().sun_altitude_deg(&now)
            );
            self.wait_for_message(Some(self.config.idle_retry)).await;
            return StepOutcome::Idle;
        }
        if !self.config.exit_when_done && self.scheduler.next_target(&now, None).is_none() {
            let wait = self
                .scheduler
                .next_cooldown_expiry(&now)
                .and_then(|until| (until - now).to_std().ok())
                .map_or(self.config.idle_retry, |left| left.min(self.config.idle_retry));
            debug!("No target above its limits yet, rechecking in {:?}", wait);
            self.wait_for_message(Some(wait)).await;
            return StepOutcome::Idle;
        }
        if let Err(e) = execute_with_retry(
            self.devices.mount.as_mut(),
            MountCommand::Unpark,
            &self.config.retry,
        )
        .await
        {
            error!("Unpark failed, run not started: {}", e);
            self.run_active = false;
            self.publish();
            return StepOutcome::Continue;
        }
        self.fire(ObsEvent::Start);
        StepOutcome::Continue
    }

    async fn on_scheduling(&mut self) -> StepOutcome {
        let now = (self.clock)();
        if let Some(target) = self.scheduler.next_target(&now, self.machine.target()) {
            info!(
                "Selected {} at {} (priority {}, observed {} of {})",
                target.id,
                target.coord,
                target.priority,
                target.observation_count,
                target.max_observations
            );
            self.fire(ObsEvent::TargetSelected(target.id));
            return StepOutcome::Continue;
        }

        if let Some(until) = self.scheduler.next_cooldown_expiry(&now) {
            let wait = (until - now)
                .to_std()
                .unwrap_or_default()
                .min(self.config.idle_retry);
            debug!("No target ready, next cooldown ends at {}", until);
            self.wait_for_message(Some(wait)).await;
            return StepOutcome::Idle;
        }

        if self.config.exit_when_done {
            info!(
                "No observable targets ({} still pending), ending run",
                self.scheduler.remaining()
            );
            self.run_active = false;
        } else {
            info!(
                "No observable targets ({} still pending), parking until one rises",
                self.scheduler.remaining()
            );
        }
        self.park_mount().await;
        self.fire(ObsEvent::NoTarget);
        StepOutcome::Continue
    }

    async fn on_slewing(&mut self) -> StepOutcome {
        let Some(target) = self.current_target() else {
            error!("Slewing without a target in progress");
            self.fire(ObsEvent::Skip);
            return StepOutcome::Continue;
        };
        let mut pointing = PointingLoop::new(
            self.devices.mount.as_mut(),
            self.devices.camera.as_mut(),
            self.devices.solver.as_mut(),
            &self.config.retry,
        );
        match pointing.coarse_slew(&target.coord).await {
            Ok(()) => {
                self.fire(ObsEvent::SlewComplete);
            }
            Err(e) => {
                warn!("Slew to {} failed: {}", target.id, e);
                self.fail_target(&target.id, FailureKind::HardwareFault);
                self.fire(ObsEvent::Fault(e.to_string()));
            }
        }
        StepOutcome::Continue
    }

    async fn on_pointing(&mut self) -> StepOutcome {
        let Some(target) = self.current_target() else {
            error!("Pointing without a target in progress");
            self.fire(ObsEvent::Skip);
            return StepOutcome::Continue;
        };
        let mut checkpoint = InboxCheckpoint {
            inbox: &mut self.inbox,
            pending: &mut self.pending,
            closed: &mut self.inbox_closed,
            safety: self.safety,
            progress: Some(PointingProgress {
                machine: &mut self.machine,
                emitter: &self.emitter,
                run_active: self.run_active,
            }),
        };
        let report = PointingLoop::new(
            self.devices.mount.as_mut(),
            self.devices.camera.as_mut(),
            self.devices.solver.as_mut(),
            &self.config.retry,
        )
        .refine(&target.coord, &self.config.pointing, &mut checkpoint)
        .await;

        for attempt in &report.attempts {
            self.emitter.notify_pointing_attempt(&target.id, attempt);
        }
        self.machine
            .set_pointing_iteration(report.outcome.iterations());
        self.emitter
            .notify_pointing_outcome(&target.id, &report.outcome);

        match &report.outcome {
            PointingOutcome::Converged { .. } => {
                info!("{}: pointing {}", target.id, report.outcome);
                self.fire(ObsEvent::Converged);
            }
            PointingOutcome::Exhausted { .. } => {
                warn!("{}: pointing {}", target.id, report.outcome);
                self.fail_target(&target.id, FailureKind::Exhausted);
                self.fire(ObsEvent::PointingFailed);
            }
            PointingOutcome::Aborted {
                reason: AbortReason::Preempted(why),
                ..
            } => {
                debug!("{}: pointing interrupted ({})", target.id, why);
                self.publish();
            }
            PointingOutcome::Aborted { .. } => {
                warn!("{}: pointing {}", target.id, report.outcome);
                self.fail_target(&target.id, FailureKind::Aborted);
                self.fire(ObsEvent::PointingFailed);
            }
        }
        StepOutcome::Continue
    }

    async fn on_tracking(&mut self) -> StepOutcome {
        let target_id = self.machine.target().unwrap_or_default().to_string();
        match execute_with_retry(
            self.devices.mount.as_mut(),
            MountCommand::StartTracking,
            &self.config.retry,
        )
        .await
        {
            Ok(()) => {
                self.fire(ObsEvent::TrackingStable);
            }
            Err(e) => {
                warn!("Tracking on {} failed: {}", target_id, e);
                self.fail_target(&target_id, FailureKind::HardwareFault);
                self.fire(ObsEvent::Fault(e.to_string()));
            }
        }
        StepOutcome::Continue
    }

    async fn on_observing(&mut self) -> StepOutcome {
        let Some(target) = self.current_target() else {
            error!("Observing without a target in progress");
            self.fire(ObsEvent::Skip);
            return StepOutcome::Continue;
        };
        let plan = target.exposure;
        for n in 1..=plan.count {
            let mut checkpoint = InboxCheckpoint {
                inbox: &mut self.inbox,
                pending: &mut self.pending,
                closed: &mut self.inbox_closed,
                safety: self.safety,
                progress: None,
            };
            if let Some(why) = checkpoint.interrupt() {
                debug!(
                    "{}: exposure {}/{} interrupted ({})",
                    target.id, n, plan.count, why
                );
                return StepOutcome::Continue;
            }
            let Some(result) = self.capture_or_preempt(plan.exptime_secs).await else {
                debug!(
                    "{}: exposure {}/{} abandoned mid-frame",
                    target.id, n, plan.count
                );
                return StepOutcome::Continue;
            };
            match result {
                Ok(image) => info!(
                    "{}: exposure {}/{} complete ({})",
                    target.id, n, plan.count, image.id
                ),
                Err(e) => {
                    let err = DeviceError::classify(e.as_ref());
                    warn!("{}: exposure {} failed: {}", target.id, n, err);
                    self.fail_target(&target.id, FailureKind::HardwareFault);
                    self.fire(ObsEvent::Fault(err.to_string()));
                    return StepOutcome::Continue;
                }
            }
        }
        self.fire(ObsEvent::ExposuresComplete);
        StepOutcome::Continue
    }

    fn on_analyzing(&mut self) -> StepOutcome {
        if let Some(id) = self.machine.target().map(str::to_string) {
            if let Some(count) = self.scheduler.record_observation(&id) {
                info!("{} observed ({} so far)", id, count);
                self.emitter.notify_target_observed(&id, count);
            }
        }
        self.fire(ObsEvent::AnalysisComplete);
        StepOutcome::Continue
    }

    async fn on_parking(&mut self) -> StepOutcome {
        if self.park_mount().await {
            self.fire(ObsEvent::ParkComplete);
        }
        StepOutcome::Continue
    }

    async fn on_safety_hold(&mut self) -> StepOutcome {
        if self.safety.is_safe() {
            self.hold_since = None;
            self.fire(ObsEvent::Safe);
            return StepOutcome::Continue;
        }
        let held = self.hold_since.get_or_insert_with(Instant::now).elapsed();
        if held >= self.config.safety_grace {
            warn!("Unsafe for {:?}, parking", held);
            self.hold_since = None;
            self.park_mount().await;
            self.fire(ObsEvent::GraceExpired);
            return StepOutcome::Continue;
        }
        let remaining = self.config.safety_grace - held;
        self.wait_for_message(Some(remaining.min(self.config.checkpoint_interval)))
            .await;
        StepOutcome::Idle
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::catalog::Catalog;
    use crate::controller::policies::TargetRetryPolicy;
    use crate::controller::table::TransitionTable;
    use crate::device::{Device, DeviceFuture, DeviceInfo, ImageHandle};
    use crate::message::{SafetyKind, SafetySignal};
    use crate::scheduler::SchedulerKind;
    use crate::sky::ephemeris::local_sidereal_deg;
    use crate::sky::{EquatorialCoord, SiteContext, VisibilityCalculator};
    use crate::DynResult;

    fn night() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-20T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    static CLOCK_OFFSET_HOURS: AtomicI64 = AtomicI64::new(0);

    fn shifted_night() -> DateTime<Utc> {
        night() + chrono::Duration::hours(CLOCK_OFFSET_HOURS.load(Ordering::SeqCst))
    }

    fn at_altitude(altitude: f64) -> EquatorialCoord {
        EquatorialCoord::new(local_sidereal_deg(0.0, &night()), altitude - 90.0)
    }

    fn info(model: &str) -> DeviceInfo {
        DeviceInfo {
            driver: "test".into(),
            model: model.into(),
            port: None,
        }
    }

    #[derive(Default)]
    struct Scope {
        actual: Option<EquatorialCoord>,
        commands: Vec<&'static str>,
        captures: u32,
    }

    type SharedScope = Arc<Mutex<Scope>>;

    struct TestMount {
        info: DeviceInfo,
        scope: SharedScope,
        bias: (f64, f64),
        park_fails: bool,
    }

    impl Device for TestMount {
        fn info(&self) -> &DeviceInfo {
            &self.info
        }
    }

    impl Mount for TestMount {
        fn slew_to<'a>(&'a mut self, coord: EquatorialCoord) -> DeviceFuture<'a, ()> {
            let mut scope = self.scope.lock().unwrap();
            scope.commands.push("slew");
            scope.actual = Some(coord.shifted(self.bias.0, self.bias.1));
            Box::pin(std::future::ready(Ok(())))
        }

        fn start_tracking<'a>(&'a mut self) -> DeviceFuture<'a, ()> {
            self.scope.lock().unwrap().commands.push("track");
            Box::pin(std::future::ready(Ok(())))
        }

        fn park<'a>(&'a mut self) -> DeviceFuture<'a, ()> {
            self.scope.lock().unwrap().commands.push("park");
            let result: DynResult<()> = if self.park_fails {
                Err(DeviceError::rejected("brake engaged").into())
            } else {
                Ok(())
            };
            Box::pin(std::future::ready(result))
        }

        fn unpark<'a>(&'a mut self) -> DeviceFuture<'a, ()> {
            self.scope.lock().unwrap().commands.push("unpark");
            Box::pin(std::future::ready(Ok(())))
        }

        fn stop<'a>(&'a mut self) -> DeviceFuture<'a, ()> {
            self.scope.lock().unwrap().commands.push("stop");
            Box::pin(std::future::ready(Ok(())))
        }
    }

    /// Sends `message` to the controller as a side effect of the nth capture.
    /// Captures from `slow_from` on take far longer than any test waits.
    struct TestCamera {
        info: DeviceInfo,
        scope: SharedScope,
        hook: Option<(u32, ObsMessage, mpsc::Sender<ObsMessage>)>,
        slow_from: Option<u32>,
    }

    impl Device for TestCamera {
        fn info(&self) -> &DeviceInfo {
            &self.info
        }
    }

    impl Camera for TestCamera {
        fn capture<'a>(&'a mut self, exptime_secs: f64) -> DeviceFuture<'a, ImageHandle> {
            let captures = {
                let mut scope = self.scope.lock().unwrap();
                scope.captures += 1;
                scope.captures
            };
            if let Some((n, message, tx)) = &self.hook {
                if *n == captures {
                    tx.try_send(*message).unwrap();
                }
            }
            if self.slow_from.is_some_and(|n| captures >= n) {
                return Box::pin(async move {
                    time::sleep(Duration::from_secs(30)).await;
                    Ok(ImageHandle::new(exptime_secs))
                });
            }
            Box::pin(std::future::ready(Ok(ImageHandle::new(exptime_secs))))
        }
    }

    struct TestSolver {
        info: DeviceInfo,
        scope: SharedScope,
        stuck_at: Option<EquatorialCoord>,
    }

    impl Device for TestSolver {
        fn info(&self) -> &DeviceInfo {
            &self.info
        }
    }

    impl PlateSolver for TestSolver {
        fn solve<'a>(&'a mut self, _image: &'a ImageHandle) -> DeviceFuture<'a, EquatorialCoord> {
            let actual = self.scope.lock().unwrap().actual;
            let result: DynResult<EquatorialCoord> = match self.stuck_at.or(actual) {
                Some(coord) => Ok(coord),
                None => Err("no stars".into()),
            };
            Box::pin(std::future::ready(result))
        }
    }

    #[derive(Default)]
    struct Recorder {
        transitions: Mutex<Vec<(ObservationState, ObservationState)>>,
        outcomes: Mutex<Vec<PointingOutcome>>,
        observed: Mutex<Vec<(String, u32)>>,
        pointing_iterations: Mutex<Vec<u32>>,
    }

    impl ObsListener for Recorder {
        fn on_state_change(&self, transition: &Transition, _snapshot: &ObservationSnapshot) {
            self.transitions
                .lock()
                .unwrap()
                .push((transition.previous, transition.current));
        }

        fn on_pointing_outcome(&self, _target: &str, outcome: &PointingOutcome) {
            self.outcomes.lock().unwrap().push(outcome.clone());
        }

        fn on_target_observed(&self, target: &str, observation_count: u32) {
            self.observed
                .lock()
                .unwrap()
                .push((target.to_string(), observation_count));
        }

        fn on_snapshot(&self, snapshot: &ObservationSnapshot) {
            if snapshot.state == ObservationState::PointingRefinement {
                self.pointing_iterations
                    .lock()
                    .unwrap()
                    .push(snapshot.pointing_iteration);
            }
        }
    }

    impl Recorder {
        fn saw(&self, from: ObservationState, to: ObservationState) -> bool {
            self.transitions.lock().unwrap().contains(&(from, to))
        }
    }

    struct Setup {
        bias: (f64, f64),
        stuck_at: Option<EquatorialCoord>,
        park_fails: bool,
        camera_hook: Option<(u32, ObsMessage)>,
        slow_from: Option<u32>,
        target_retry: TargetRetryPolicy,
        config: ControllerConfig,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                bias: (0.01, 0.0),
                stuck_at: None,
                park_fails: false,
                camera_hook: None,
                slow_from: None,
                target_retry: TargetRetryPolicy::default(),
                config: ControllerConfig {
                    pointing: PointingConfig {
                        threshold_deg: 0.05,
                        exptime_secs: 1.0,
                        max_iterations: 3,
                        solve_timeout: None,
                    },
                    retry: ExponentialBackoff::new(
                        1,
                        Duration::from_millis(1),
                        Duration::from_millis(1),
                    ),
                    safety_grace: Duration::from_secs(60),
                    checkpoint_interval: Duration::from_millis(10),
                    idle_retry: Duration::from_millis(10),
                    auto_start: true,
                    exit_when_done: true,
                    initial_safety: SafetyStatus::default(),
                },
            }
        }
    }

    struct Harness {
        controller: ObservatoryController,
        scope: SharedScope,
        recorder: Arc<Recorder>,
        tx: mpsc::Sender<ObsMessage>,
    }

    fn harness(targets: Vec<Target>, setup: Setup) -> Harness {
        let scope = SharedScope::default();
        let (tx, rx) = mpsc::channel(16);
        let devices = Devices {
            mount: Box::new(TestMount {
                info: info("mount"),
                scope: scope.clone(),
                bias: setup.bias,
                park_fails: setup.park_fails,
            }),
            camera: Box::new(TestCamera {
                info: info("camera"),
                scope: scope.clone(),
                hook: setup
                    .camera_hook
                    .map(|(n, message)| (n, message, tx.clone())),
                slow_from: setup.slow_from,
            }),
            solver: Box::new(TestSolver {
                info: info("solver"),
                scope: scope.clone(),
                stuck_at: setup.stuck_at,
            }),
        };
        let scheduler = TargetScheduler::new(
            SchedulerKind::Dispatch,
            VisibilityCalculator::new(SiteContext::default()),
            Catalog::from_targets(targets).unwrap(),
            setup.target_retry,
        );
        let mut controller = ObservatoryController::new(
            ObservationStateMachine::new(TransitionTable::simple()),
            scheduler,
            devices,
            rx,
            setup.config,
        )
        .with_clock(night);
        let recorder = Arc::new(Recorder::default());
        controller.register_listener(recorder.clone());
        Harness {
            controller,
            scope,
            recorder,
            tx,
        }
    }

    async fn step_until(
        controller: &mut ObservatoryController,
        done: impl Fn(&ObservatoryController) -> bool,
    ) {
        for _ in 0..30 {
            if done(controller) {
                return;
            }
            controller.step().await.unwrap();
        }
        panic!("condition not reached, stuck in {}", controller.machine().state());
    }

    fn in_state(state: ObservationState) -> impl Fn(&ObservatoryController) -> bool {
        move |c| c.machine().state() == state
    }

    fn unsafe_weather() -> ObsMessage {
        ObsMessage::Safety(SafetySignal {
            kind: SafetyKind::Weather,
            safe: false,
        })
    }

    fn two_targets() -> Vec<Target> {
        vec![
            Target::new("high", at_altitude(45.0)).with_exposure(1.0, 2),
            Target::new("low", at_altitude(10.0)),
        ]
    }

    #[tokio::test]
    async fn test_full_run_observes_visible_target_and_parks() {
        let mut h = harness(two_targets(), Setup::default());
        time::timeout(Duration::from_secs(5), h.controller.run())
            .await
            .unwrap()
            .unwrap();

        use ObservationState as S;
        assert_eq!(
            *h.recorder.transitions.lock().unwrap(),
            vec![
                (S::Parked, S::Scheduling),
                (S::Scheduling, S::Slewing),
                (S::Slewing, S::PointingRefinement),
                (S::PointingRefinement, S::Tracking),
                (S::Tracking, S::Observing),
                (S::Observing, S::Analyzing),
                (S::Analyzing, S::Scheduling),
                (S::Scheduling, S::Parked),
            ]
        );
        assert_eq!(
            *h.recorder.observed.lock().unwrap(),
            vec![("high".to_string(), 1)]
        );
        assert_eq!(h.controller.scheduler().target("low").unwrap().observation_count, 0);

        let scope = h.scope.lock().unwrap();
        // One pointing frame plus two science exposures.
        assert_eq!(scope.captures, 3);
        assert_eq!(scope.commands, vec!["unpark", "slew", "track", "park"]);
        assert!(matches!(
            h.recorder.outcomes.lock().unwrap()[0],
            PointingOutcome::Converged { iterations: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_unsafe_during_exposures_holds_without_counting() {
        let setup = Setup {
            camera_hook: Some((2, unsafe_weather())),
            config: ControllerConfig {
                exit_when_done: false,
                ..Setup::default().config
            },
            ..Setup::default()
        };
        let targets = vec![Target::new("high", at_altitude(45.0)).with_exposure(1.0, 3)];
        let mut h = harness(targets, setup);

        step_until(&mut h.controller, in_state(ObservationState::SafetyHold)).await;

        assert!(h
            .recorder
            .saw(ObservationState::Observing, ObservationState::SafetyHold));
        assert_eq!(h.controller.machine().target(), None);
        assert_eq!(h.controller.scheduler().target("high").unwrap().observation_count, 0);
        assert!(!h.controller.snapshot().safe);
        {
            let scope = h.scope.lock().unwrap();
            // The third exposure never started.
            assert_eq!(scope.captures, 2);
            assert!(scope.commands.contains(&"stop"));
            assert!(!scope.commands.contains(&"park"));
        }

        h.tx.send(ObsMessage::Safety(SafetySignal {
            kind: SafetyKind::Weather,
            safe: true,
        }))
        .await
        .unwrap();
        h.controller.step().await.unwrap();
        assert!(h
            .recorder
            .saw(ObservationState::SafetyHold, ObservationState::Scheduling));
        assert_eq!(h.controller.machine().state(), ObservationState::Scheduling);
    }

    #[tokio::test]
    async fn test_unsafe_signal_cuts_exposure_short() {
        let setup = Setup {
            camera_hook: Some((2, unsafe_weather())),
            slow_from: Some(2),
            config: ControllerConfig {
                exit_when_done: false,
                ..Setup::default().config
            },
            ..Setup::default()
        };
        let targets = vec![Target::new("high", at_altitude(45.0)).with_exposure(1.0, 2)];
        let mut h = harness(targets, setup);
        step_until(&mut h.controller, in_state(ObservationState::Observing)).await;

        // The second capture is the first science frame and never finishes.
        time::timeout(Duration::from_secs(1), h.controller.step())
            .await
            .unwrap()
            .unwrap();
        h.controller.step().await.unwrap();

        assert_eq!(h.controller.machine().state(), ObservationState::SafetyHold);
        assert_eq!(h.controller.scheduler().target("high").unwrap().observation_count, 0);
        assert_eq!(h.scope.lock().unwrap().captures, 2);
    }

    #[tokio::test]
    async fn test_shutdown_parks_and_exits() {
        let setup = Setup {
            config: ControllerConfig {
                exit_when_done: false,
                ..Setup::default().config
            },
            ..Setup::default()
        };
        let mut h = harness(two_targets(), setup);
        step_until(&mut h.controller, in_state(ObservationState::Tracking)).await;

        h.tx.send(ObsMessage::Shutdown).await.unwrap();
        assert_eq!(h.controller.step().await.unwrap(), StepOutcome::Continue);
        assert_eq!(h.controller.machine().state(), ObservationState::Parked);
        assert!(h
            .recorder
            .saw(ObservationState::Tracking, ObservationState::Parking));
        assert!(h
            .recorder
            .saw(ObservationState::Parking, ObservationState::Parked));
        assert_eq!(h.controller.step().await.unwrap(), StepOutcome::Exit);
        assert_eq!(h.scope.lock().unwrap().commands.last(), Some(&"park"));
    }

    #[tokio::test]
    async fn test_failed_pointing_excludes_target() {
        let nominal = at_altitude(45.0);
        let setup = Setup {
            stuck_at: Some(nominal.shifted(0.0, 1.0)),
            target_retry: TargetRetryPolicy::new(Duration::from_secs(600), 1),
            ..Setup::default()
        };
        let mut h = harness(vec![Target::new("high", nominal)], setup);
        time::timeout(Duration::from_secs(5), h.controller.run())
            .await
            .unwrap()
            .unwrap();

        assert!(h.controller.scheduler().is_excluded("high"));
        assert_eq!(h.controller.scheduler().target("high").unwrap().observation_count, 0);
        assert!(matches!(
            h.recorder.outcomes.lock().unwrap()[0],
            PointingOutcome::Exhausted { iterations: 3, .. }
        ));
        assert!(h
            .recorder
            .saw(ObservationState::PointingRefinement, ObservationState::Scheduling));
        assert_eq!(h.controller.machine().state(), ObservationState::Parked);
        assert_eq!(h.scope.lock().unwrap().captures, 3);
    }

    #[tokio::test]
    async fn test_pointing_iteration_published_while_refining() {
        let nominal = at_altitude(45.0);
        let setup = Setup {
            stuck_at: Some(nominal.shifted(0.0, 1.0)),
            ..Setup::default()
        };
        let mut h = harness(vec![Target::new("high", nominal)], setup);
        step_until(&mut h.controller, |c| {
            c.machine().state() == ObservationState::PointingRefinement
        })
        .await;
        h.controller.step().await.unwrap();

        let seen = h.recorder.pointing_iterations.lock().unwrap().clone();
        for iteration in 1..=3 {
            assert!(seen.contains(&iteration), "iteration {} not published", iteration);
        }
    }

    #[tokio::test]
    async fn test_idle_run_starts_once_target_rises() {
        let setup = Setup {
            config: ControllerConfig {
                exit_when_done: false,
                ..Setup::default().config
            },
            ..Setup::default()
        };
        // Four hours before transit the target sits near 21°, below the 30° limit.
        CLOCK_OFFSET_HOURS.store(-4, Ordering::SeqCst);
        let mut h = harness(vec![Target::new("high", at_altitude(45.0))], setup);
        h.controller = h.controller.with_clock(shifted_night);

        for _ in 0..3 {
            assert_eq!(h.controller.step().await.unwrap(), StepOutcome::Idle);
        }
        assert_eq!(h.controller.machine().state(), ObservationState::Parked);
        assert!(h.controller.snapshot().run_active);
        assert!(h.scope.lock().unwrap().commands.is_empty());

        CLOCK_OFFSET_HOURS.store(0, Ordering::SeqCst);
        h.controller.step().await.unwrap();
        assert_eq!(h.controller.machine().state(), ObservationState::Scheduling);

        let recorder = h.recorder.clone();
        step_until(&mut h.controller, move |_| {
            !recorder.observed.lock().unwrap().is_empty()
        })
        .await;
        step_until(&mut h.controller, in_state(ObservationState::Parked)).await;
        // Nothing left to observe, but the run stays armed.
        assert!(h.controller.snapshot().run_active);
        assert_eq!(h.controller.step().await.unwrap(), StepOutcome::Idle);
    }

    #[tokio::test]
    async fn test_grace_expiry_parks_then_resumes_when_safe() {
        let setup = Setup {
            camera_hook: Some((1, unsafe_weather())),
            config: ControllerConfig {
                safety_grace: Duration::ZERO,
                exit_when_done: false,
                ..Setup::default().config
            },
            ..Setup::default()
        };
        let mut h = harness(two_targets(), setup);
        let recorder = h.recorder.clone();
        step_until(&mut h.controller, move |_| {
            recorder.saw(ObservationState::SafetyHold, ObservationState::Parked)
        })
        .await;
        assert_eq!(h.controller.machine().state(), ObservationState::Parked);
        assert!(h.scope.lock().unwrap().commands.contains(&"park"));

        // Still unsafe: stays parked.
        assert_eq!(h.controller.step().await.unwrap(), StepOutcome::Idle);
        assert_eq!(h.controller.machine().state(), ObservationState::Parked);

        h.tx.send(ObsMessage::Safety(SafetySignal {
            kind: SafetyKind::Weather,
            safe: true,
        }))
        .await
        .unwrap();
        h.controller.step().await.unwrap();
        assert_eq!(h.controller.machine().state(), ObservationState::Scheduling);
    }

    #[tokio::test]
    async fn test_skip_override_reschedules_without_penalty() {
        let setup = Setup {
            config: ControllerConfig {
                exit_when_done: false,
                ..Setup::default().config
            },
            ..Setup::default()
        };
        let mut h = harness(two_targets(), setup);
        step_until(&mut h.controller, in_state(ObservationState::Tracking)).await;

        h.tx.send(ObsMessage::Override(OverrideAction::Skip))
            .await
            .unwrap();
        h.controller.step().await.unwrap();

        assert!(h
            .recorder
            .saw(ObservationState::Tracking, ObservationState::Scheduling));
        assert!(!h.controller.scheduler().is_excluded("high"));
        // Nothing else is up, so the same target is picked again.
        assert_eq!(h.controller.machine().state(), ObservationState::Slewing);
        assert_eq!(h.controller.machine().target(), Some("high"));
    }

    #[tokio::test]
    async fn test_operator_park_waits_for_resume() {
        let setup = Setup {
            config: ControllerConfig {
                exit_when_done: false,
                ..Setup::default().config
            },
            ..Setup::default()
        };
        let mut h = harness(two_targets(), setup);
        step_until(&mut h.controller, in_state(ObservationState::Slewing)).await;

        h.tx.send(ObsMessage::Override(OverrideAction::Park))
            .await
            .unwrap();
        h.controller.step().await.unwrap();
        assert_eq!(h.controller.machine().state(), ObservationState::Parked);
        assert!(!h.controller.snapshot().run_active);

        h.tx.send(ObsMessage::Override(OverrideAction::Resume))
            .await
            .unwrap();
        assert_eq!(h.controller.step().await.unwrap(), StepOutcome::Continue);
        assert_eq!(h.controller.machine().state(), ObservationState::Scheduling);
    }

    #[tokio::test]
    async fn test_stuck_parking_is_fatal() {
        let setup = Setup {
            park_fails: true,
            config: ControllerConfig {
                exit_when_done: false,
                ..Setup::default().config
            },
            ..Setup::default()
        };
        let mut h = harness(two_targets(), setup);
        h.controller.step().await.unwrap();
        h.tx.send(ObsMessage::Shutdown).await.unwrap();

        let mut result = Ok(StepOutcome::Continue);
        for _ in 0..=STALL_LIMIT {
            result = h.controller.step().await;
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(
            result,
            Err(ObsError::Stalled {
                state: ObservationState::Parking,
                attempts: STALL_LIMIT,
            })
        ));
    }
}
