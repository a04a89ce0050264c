// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Typed messages delivered to the controller's inbound queue.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyKind {
    Weather,
    Horizon,
}

impl fmt::Display for SafetyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Weather => write!(f, "weather"),
            Self::Horizon => write!(f, "horizon"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetySignal {
    pub kind: SafetyKind,
    pub safe: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    /// Park and stay parked until resumed.
    Park,
    /// Start a new run from `Parked`.
    Resume,
    /// Drop the current target and pick another.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObsMessage {
    Safety(SafetySignal),
    Shutdown,
    Override(OverrideAction),
}

impl ObsMessage {
    /// Whether this message must interrupt a running action.
    pub fn preempts(&self, status: &SafetyStatus) -> bool {
        match self {
            Self::Safety(signal) => !signal.safe && status.would_become_unsafe(signal),
            Self::Shutdown => true,
            Self::Override(OverrideAction::Park | OverrideAction::Skip) => true,
            Self::Override(OverrideAction::Resume) => false,
        }
    }
}

/// Latest value of every safety condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SafetyStatus {
    pub weather_safe: bool,
    pub horizon_safe: bool,
}

impl Default for SafetyStatus {
    fn default() -> Self {
        Self {
            weather_safe: true,
            horizon_safe: true,
        }
    }
}

impl SafetyStatus {
    pub fn is_safe(&self) -> bool {
        self.weather_safe && self.horizon_safe
    }

    /// Record a signal. Returns true if the overall verdict changed.
    pub fn apply(&mut self, signal: &SafetySignal) -> bool {
        let before = self.is_safe();
        match signal.kind {
            SafetyKind::Weather => self.weather_safe = signal.safe,
            SafetyKind::Horizon => self.horizon_safe = signal.safe,
        }
        before != self.is_safe()
    }

    fn would_become_unsafe(&self, signal: &SafetySignal) -> bool {
        let mut next = *self;
        next.apply(signal);
        !next.is_safe()
    }
}
