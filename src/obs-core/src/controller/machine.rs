// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Observation state machine.
//!
//! States and events are plain tags; which event moves which state where is
//! decided entirely by the [`TransitionTable`]. The machine additionally owns
//! the in-progress target marker and the pointing iteration counter.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::table::TransitionTable;

/// Nightly sequence states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ObservationState {
    #[default]
    Parked,
    Scheduling,
    Slewing,
    PointingRefinement,
    Tracking,
    Observing,
    Analyzing,
    Parking,
    SafetyHold,
}

impl ObservationState {
    pub const ALL: [ObservationState; 9] = [
        Self::Parked,
        Self::Scheduling,
        Self::Slewing,
        Self::PointingRefinement,
        Self::Tracking,
        Self::Observing,
        Self::Analyzing,
        Self::Parking,
        Self::SafetyHold,
    ];

    /// States in which a target must be in progress.
    pub fn requires_target(&self) -> bool {
        matches!(
            self,
            Self::Slewing
                | Self::PointingRefinement
                | Self::Tracking
                | Self::Observing
                | Self::Analyzing
        )
    }

    /// States an unsafe signal must interrupt.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Parked | Self::Parking | Self::SafetyHold)
    }
}

impl fmt::Display for ObservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parked => "Parked",
            Self::Scheduling => "Scheduling",
            Self::Slewing => "Slewing",
            Self::PointingRefinement => "PointingRefinement",
            Self::Tracking => "Tracking",
            Self::Observing => "Observing",
            Self::Analyzing => "Analyzing",
            Self::Parking => "Parking",
            Self::SafetyHold => "SafetyHold",
        };
        f.write_str(name)
    }
}

/// Transition table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Start,
    TargetSelected,
    NoTarget,
    SlewComplete,
    Converged,
    PointingFailed,
    TrackingStable,
    ExposuresComplete,
    AnalysisComplete,
    Fault,
    Skip,
    Unsafe,
    Safe,
    GraceExpired,
    Park,
    ParkComplete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Events fed to the machine by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ObsEvent {
    /// Run started (or resumed) with safe conditions.
    Start,
    /// Scheduler picked a target; it becomes the in-progress target.
    TargetSelected(String),
    NoTarget,
    SlewComplete,
    Converged,
    /// Pointing exhausted or aborted.
    PointingFailed,
    TrackingStable,
    ExposuresComplete,
    AnalysisComplete,
    /// Hardware failure that survived the retry policy.
    Fault(String),
    /// Operator asked to drop the current target.
    Skip,
    Unsafe,
    Safe,
    GraceExpired,
    /// Shutdown or operator park request.
    Park,
    ParkComplete,
}

impl ObsEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Start => EventKind::Start,
            Self::TargetSelected(_) => EventKind::TargetSelected,
            Self::NoTarget => EventKind::NoTarget,
            Self::SlewComplete => EventKind::SlewComplete,
            Self::Converged => EventKind::Converged,
            Self::PointingFailed => EventKind::PointingFailed,
            Self::TrackingStable => EventKind::TrackingStable,
            Self::ExposuresComplete => EventKind::ExposuresComplete,
            Self::AnalysisComplete => EventKind::AnalysisComplete,
            Self::Fault(_) => EventKind::Fault,
            Self::Skip => EventKind::Skip,
            Self::Unsafe => EventKind::Unsafe,
            Self::Safe => EventKind::Safe,
            Self::GraceExpired => EventKind::GraceExpired,
            Self::Park => EventKind::Park,
            Self::ParkComplete => EventKind::ParkComplete,
        }
    }
}

/// A completed state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub previous: ObservationState,
    pub current: ObservationState,
    pub event: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Target involved: the one just selected, or the one being worked on.
    pub target: Option<String>,
    /// Target whose in-progress mark this transition cleared.
    pub released: Option<String>,
}

/// Read-only view of the machine published to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationSnapshot {
    pub state: ObservationState,
    pub target: Option<String>,
    pub pointing_iteration: u32,
    pub transition_count: u64,
    pub safe: bool,
    pub run_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl Default for ObservationSnapshot {
    fn default() -> Self {
        Self {
            state: ObservationState::Parked,
            target: None,
            pointing_iteration: 0,
            transition_count: 0,
            safe: true,
            run_active: false,
            updated_at: Utc::now(),
        }
    }
}

pub struct ObservationStateMachine {
    table: TransitionTable,
    state: ObservationState,
    target: Option<String>,
    pointing_iteration: u32,
    transition_count: u64,
}

impl ObservationStateMachine {
    /// New machine in `Parked`, driven by `table`.
    pub fn new(table: TransitionTable) -> Self {
        Self {
            table,
            state: ObservationState::Parked,
            target: None,
            pointing_iteration: 0,
            transition_count: 0,
        }
    }

    pub fn state(&self) -> ObservationState {
        self.state
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// The in-progress target, if any.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn pointing_iteration(&self) -> u32 {
        self.pointing_iteration
    }

    pub fn set_pointing_iteration(&mut self, iteration: u32) {
        self.pointing_iteration = iteration;
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Whether `event` would cause a transition from the current state.
    pub fn accepts(&self, event: EventKind) -> bool {
        self.table.lookup(self.state, event).is_some()
    }

    /// Apply an event. Returns the transition taken, or `None` if the table
    /// has no entry for the current state and event.
    pub fn process_event(&mut self, event: ObsEvent) -> Option<Transition> {
        let next = self.table.lookup(self.state, event.kind())?;
        let previous = self.state;
        let kind = event.kind();

        if let ObsEvent::TargetSelected(id) = event {
            self.target = Some(id);
            self.pointing_iteration = 0;
        }
        let target = self.target.clone();
        let released = if next.requires_target() {
            None
        } else {
            self.pointing_iteration = 0;
            self.target.take()
        };

        self.state = next;
        self.transition_count += 1;
        Some(Transition {
            previous,
            current: next,
            event: kind,
            timestamp: Utc::now(),
            target,
            released,
        })
    }

    pub fn snapshot(&self, safe: bool, run_active: bool) -> ObservationSnapshot {
        ObservationSnapshot {
            state: self.state,
            target: self.target.clone(),
            pointing_iteration: self.pointing_iteration,
            transition_count: self.transition_count,
            safe,
            run_active,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> ObservationStateMachine {
        ObservationStateMachine::new(TransitionTable::simple())
    }

    fn advance(sm: &mut ObservationStateMachine, events: Vec<ObsEvent>) -> Vec<ObservationState> {
        events
            .into_iter()
            .map(|e| sm.process_event(e).expect("transition").current)
            .collect()
    }

    #[test]
    fn test_initial_state() {
        let sm = machine();
        assert_eq!(sm.state(), ObservationState::Parked);
        assert!(sm.target().is_none());
        assert_eq!(sm.transition_count(), 0);
    }

    #[test]
    fn test_full_observation_cycle() {
        let mut sm = machine();
        let states = advance(
            &mut sm,
            vec![
                ObsEvent::Start,
                ObsEvent::TargetSelected("M42".into()),
                ObsEvent::SlewComplete,
                ObsEvent::Converged,
                ObsEvent::TrackingStable,
                ObsEvent::ExposuresComplete,
            ],
        );
        assert_eq!(
            states,
            vec![
                ObservationState::Scheduling,
                ObservationState::Slewing,
                ObservationState::PointingRefinement,
                ObservationState::Tracking,
                ObservationState::Observing,
                ObservationState::Analyzing,
            ]
        );
        assert_eq!(sm.target(), Some("M42"));

        let done = sm.process_event(ObsEvent::AnalysisComplete).unwrap();
        assert_eq!(done.current, ObservationState::Scheduling);
        assert_eq!(done.target.as_deref(), Some("M42"));
        assert_eq!(done.released.as_deref(), Some("M42"));
        assert!(sm.target().is_none());
        assert_eq!(sm.transition_count(), 7);
    }

    #[test]
    fn test_unknown_transition_is_ignored() {
        let mut sm = machine();
        assert!(sm.process_event(ObsEvent::Converged).is_none());
        assert!(sm.process_event(ObsEvent::TargetSelected("x".into())).is_none());
        assert!(sm.target().is_none());
        assert_eq!(sm.state(), ObservationState::Parked);
    }

    #[test]
    fn test_unsafe_releases_target() {
        let mut sm = machine();
        advance(
            &mut sm,
            vec![
                ObsEvent::Start,
                ObsEvent::TargetSelected("M31".into()),
                ObsEvent::SlewComplete,
            ],
        );
        sm.set_pointing_iteration(2);
        let t = sm.process_event(ObsEvent::Unsafe).unwrap();
        assert_eq!(t.previous, ObservationState::PointingRefinement);
        assert_eq!(t.current, ObservationState::SafetyHold);
        assert_eq!(t.released.as_deref(), Some("M31"));
        assert!(sm.target().is_none());
        assert_eq!(sm.pointing_iteration(), 0);

        assert_eq!(
            sm.process_event(ObsEvent::Safe).unwrap().current,
            ObservationState::Scheduling
        );
    }

    #[test]
    fn test_park_from_any_active_state() {
        for events in [
            vec![ObsEvent::Start],
            vec![ObsEvent::Start, ObsEvent::TargetSelected("a".into())],
            vec![ObsEvent::Start, ObsEvent::Unsafe],
        ] {
            let mut sm = machine();
            advance(&mut sm, events);
            assert_eq!(
                sm.process_event(ObsEvent::Park).unwrap().current,
                ObservationState::Parking
            );
            assert!(sm.target().is_none());
            assert_eq!(
                sm.process_event(ObsEvent::ParkComplete).unwrap().current,
                ObservationState::Parked
            );
        }
    }

    #[test]
    fn test_target_only_in_target_states() {
        let mut sm = machine();
        let events = vec![
            ObsEvent::Start,
            ObsEvent::TargetSelected("a".into()),
            ObsEvent::SlewComplete,
            ObsEvent::PointingFailed,
            ObsEvent::TargetSelected("b".into()),
            ObsEvent::Fault("slew timed out".into()),
            ObsEvent::NoTarget,
        ];
        for event in events {
            sm.process_event(event);
            assert_eq!(sm.state().requires_target(), sm.target().is_some());
        }
        assert_eq!(sm.state(), ObservationState::Parked);
    }

    #[test]
    fn test_snapshot_serializes_state_name() {
        let sm = machine();
        let json = serde_json::to_value(sm.snapshot(true, false)).unwrap();
        assert_eq!(json["state"], "Parked");
        assert_eq!(json["target"], serde_json::Value::Null);
    }
}
