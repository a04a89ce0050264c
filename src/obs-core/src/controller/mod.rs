// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Observation controller components.
//!
//! The state machine and its transition table, the single consuming loop
//! that drives it, event notification and the operational policies.

pub mod events;
pub mod executor;
pub mod machine;
pub mod policies;
pub mod runner;
pub mod table;

pub use events::{ListenerId, ObsEventEmitter, ObsListener};
pub use executor::{execute_with_retry, MountCommand};
pub use machine::{
    EventKind, ObsEvent, ObservationSnapshot, ObservationState, ObservationStateMachine,
    Transition,
};
pub use policies::{
    AdaptivePolling, ExponentialBackoff, FixedPolling, NoRetry, PollingPolicy, RetryPolicy,
    TargetRetryPolicy,
};
pub use runner::{ControllerConfig, Devices, ObservatoryController, StepOutcome, STALL_LIMIT};
pub use table::{TransitionRule, TransitionTable, AVAILABLE_TABLES, SIMPLE_STATE_TABLE};
