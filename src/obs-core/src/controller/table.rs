// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Named `(state, event) -> state` tables.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::ObsError;

use super::machine::{EventKind, ObservationState};

/// One row of a transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: ObservationState,
    pub event: EventKind,
    pub to: ObservationState,
}

const fn rule(from: ObservationState, event: EventKind, to: ObservationState) -> TransitionRule {
    TransitionRule { from, event, to }
}

use EventKind as E;
use ObservationState as S;

const SIMPLE_RULES: &[TransitionRule] = &[
    rule(S::Parked, E::Start, S::Scheduling),
    rule(S::Scheduling, E::TargetSelected, S::Slewing),
    rule(S::Scheduling, E::NoTarget, S::Parked),
    rule(S::Slewing, E::SlewComplete, S::PointingRefinement),
    rule(S::Slewing, E::Fault, S::Scheduling),
    rule(S::Slewing, E::Skip, S::Scheduling),
    rule(S::PointingRefinement, E::Converged, S::Tracking),
    rule(S::PointingRefinement, E::PointingFailed, S::Scheduling),
    rule(S::PointingRefinement, E::Skip, S::Scheduling),
    rule(S::Tracking, E::TrackingStable, S::Observing),
    rule(S::Tracking, E::Fault, S::Scheduling),
    rule(S::Tracking, E::Skip, S::Scheduling),
    rule(S::Observing, E::ExposuresComplete, S::Analyzing),
    rule(S::Observing, E::Fault, S::Scheduling),
    rule(S::Observing, E::Skip, S::Scheduling),
    rule(S::Analyzing, E::AnalysisComplete, S::Scheduling),
    rule(S::SafetyHold, E::Safe, S::Scheduling),
    rule(S::SafetyHold, E::GraceExpired, S::Parked),
    rule(S::Parking, E::ParkComplete, S::Parked),
];

pub const SIMPLE_STATE_TABLE: &str = "simple_state_table";

/// Names accepted by [`TransitionTable::by_name`].
pub const AVAILABLE_TABLES: &[&str] = &[SIMPLE_STATE_TABLE];

#[derive(Debug, Clone)]
pub struct TransitionTable {
    name: String,
    rules: HashMap<(ObservationState, EventKind), ObservationState>,
}

impl TransitionTable {
    pub fn from_rules(name: impl Into<String>, rules: &[TransitionRule]) -> Self {
        Self {
            name: name.into(),
            rules: rules.iter().map(|r| ((r.from, r.event), r.to)).collect(),
        }
    }

    /// The nightly sequence table. Every active state is preempted by
    /// `Unsafe`, and every state short of `Parking`/`Parked` accepts `Park`.
    pub fn simple() -> Self {
        let mut table = Self::from_rules(SIMPLE_STATE_TABLE, SIMPLE_RULES);
        for state in ObservationState::ALL {
            if state.is_active() {
                table
                    .rules
                    .insert((state, EventKind::Unsafe), ObservationState::SafetyHold);
            }
            if !matches!(state, S::Parked | S::Parking) {
                table
                    .rules
                    .insert((state, EventKind::Park), ObservationState::Parking);
            }
        }
        table
    }

    /// Resolve a configured table name.
    pub fn by_name(name: &str) -> Result<Self, ObsError> {
        match name.trim() {
            SIMPLE_STATE_TABLE => Ok(Self::simple()),
            other => Err(ObsError::UnknownStateTable(
                other.to_string(),
                AVAILABLE_TABLES.join(", "),
            )),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lookup(&self, state: ObservationState, event: EventKind) -> Option<ObservationState> {
        self.rules.get(&(state, event)).copied()
    }

    fn reachable_from(&self, start: ObservationState) -> HashSet<ObservationState> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(state) = queue.pop_front() {
            for (&(from, _), &to) in &self.rules {
                if from == state && seen.insert(to) {
                    queue.push_back(to);
                }
            }
        }
        seen
    }

    /// Check the structural guarantees the controller relies on.
    pub fn validate(&self) -> Result<(), ObsError> {
        let from_parked = self.reachable_from(S::Parked);
        for state in ObservationState::ALL {
            if !from_parked.contains(&state) {
                return Err(ObsError::UnreachableState {
                    table: self.name.clone(),
                    state,
                });
            }
            if state.is_active() && self.lookup(state, E::Unsafe) != Some(S::SafetyHold) {
                return Err(ObsError::MissingTransition {
                    table: self.name.clone(),
                    state,
                    event: E::Unsafe,
                });
            }
            if !matches!(state, S::Parked | S::Parking)
                && self.lookup(state, E::Park) != Some(S::Parking)
            {
                return Err(ObsError::MissingTransition {
                    table: self.name.clone(),
                    state,
                    event: E::Park,
                });
            }
            let reachable = self.reachable_from(state);
            if !reachable.contains(&S::Parked) {
                return Err(ObsError::NoRouteToParked {
                    table: self.name.clone(),
                    state,
                });
            }
            for required in [S::SafetyHold, S::Parking] {
                if !reachable.contains(&required) {
                    return Err(ObsError::MissingTransition {
                        table: self.name.clone(),
                        state,
                        event: if required == S::SafetyHold {
                            E::Unsafe
                        } else {
                            E::Park
                        },
                    });
                }
            }
        }
        Ok(())
    }
}
