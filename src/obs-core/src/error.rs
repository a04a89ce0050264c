// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use thiserror::Error;

use crate::controller::machine::{EventKind, ObservationState};

/// Errors raised while assembling the controller at startup.
#[derive(Debug, Error)]
pub enum ObsError {
    #[error("unknown state table '{0}' (available: {1})")]
    UnknownStateTable(String, String),

    #[error("state table '{table}': {state} is not reachable from Parked")]
    UnreachableState {
        table: String,
        state: ObservationState,
    },

    #[error("state table '{table}': {state} has no {event} transition")]
    MissingTransition {
        table: String,
        state: ObservationState,
        event: EventKind,
    },

    #[error("state table '{table}': Parked cannot be reached from {state}")]
    NoRouteToParked {
        table: String,
        state: ObservationState,
    },

    #[error("unknown scheduler type '{0}' (expected dispatch or priority)")]
    UnknownScheduler(String),

    #[error("controller stalled in {state} after {attempts} attempts")]
    Stalled {
        state: ObservationState,
        attempts: u32,
    },
}
