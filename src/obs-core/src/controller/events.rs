// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Controller event notification.
//!
//! Listeners receive typed callbacks for state transitions and the other
//! milestones of a run. The gateway bridge is one such listener.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::message::SafetyStatus;
use crate::pointing::{PointingAttempt, PointingOutcome};

use super::machine::{ObservationSnapshot, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// All methods default to no-ops; implement only what you need.
pub trait ObsListener: Send + Sync {
    /// Called after every state transition with the post-transition snapshot.
    fn on_state_change(&self, _transition: &Transition, _snapshot: &ObservationSnapshot) {}

    fn on_pointing_attempt(&self, _target: &str, _attempt: &PointingAttempt) {}

    fn on_pointing_outcome(&self, _target: &str, _outcome: &PointingOutcome) {}

    /// Called once a target's observation count has been incremented.
    fn on_target_observed(&self, _target: &str, _observation_count: u32) {}

    fn on_safety_change(&self, _status: &SafetyStatus) {}

    /// Called whenever externally visible state changes, transitions included.
    fn on_snapshot(&self, _snapshot: &ObservationSnapshot) {}
}

pub struct ObsEventEmitter {
    listeners: Vec<(ListenerId, Arc<dyn ObsListener>)>,
}

impl Default for ObsEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl ObsEventEmitter {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    pub fn register(&mut self, listener: Arc<dyn ObsListener>) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.push((id, listener));
        id
    }

    pub fn unregister(&mut self, id: ListenerId) {
        self.listeners.retain(|(lid, _)| *lid != id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn notify_state_change(&self, transition: &Transition, snapshot: &ObservationSnapshot) {
        for (_, listener) in &self.listeners {
            listener.on_state_change(transition, snapshot);
        }
    }

    pub fn notify_pointing_attempt(&self, target: &str, attempt: &PointingAttempt) {
        for (_, listener) in &self.listeners {
            listener.on_pointing_attempt(target, attempt);
        }
    }

    pub fn notify_pointing_outcome(&self, target: &str, outcome: &PointingOutcome) {
        for (_, listener) in &self.listeners {
            listener.on_pointing_outcome(target, outcome);
        }
    }

    pub fn notify_target_observed(&self, target: &str, observation_count: u32) {
        for (_, listener) in &self.listeners {
            listener.on_target_observed(target, observation_count);
        }
    }

    pub fn notify_safety_change(&self, status: &SafetyStatus) {
        for (_, listener) in &self.listeners {
            listener.on_safety_change(status);
        }
    }

    pub fn notify_snapshot(&self, snapshot: &ObservationSnapshot) {
        for (_, listener) in &self.listeners {
            listener.on_snapshot(snapshot);
        }
    }
}
