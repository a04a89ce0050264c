// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Target selection.
//!
//! The scheduler owns the catalog and the per-target run history. Selection
//! is side-effect free; the controller reports outcomes back through
//! [`TargetScheduler::record_observation`] and
//! [`TargetScheduler::record_failure`].

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::catalog::Catalog;
use crate::controller::policies::TargetRetryPolicy;
use crate::error::ObsError;
use crate::sky::VisibilityCalculator;
use crate::target::Target;

/// Ranking strategy applied to visible targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerKind {
    /// Rank by merit (altitude and priority).
    #[default]
    Dispatch,
    /// Rank by priority alone; altitude only gates visibility.
    Priority,
}

impl FromStr for SchedulerKind {
    type Err = ObsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dispatch" => Ok(Self::Dispatch),
            "priority" => Ok(Self::Priority),
            _ => Err(ObsError::UnknownScheduler(s.to_string())),
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatch => write!(f, "dispatch"),
            Self::Priority => write!(f, "priority"),
        }
    }
}

/// Why an acquisition attempt did not produce an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Pointing never converged.
    Exhausted,
    /// Camera or solver failed during pointing.
    Aborted,
    /// Slew, tracking or exposure failure after retries.
    HardwareFault,
}

/// What happens to a target after a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailureVerdict {
    Cooldown {
        until: Option<DateTime<Utc>>,
        failures: u32,
    },
    Excluded {
        failures: u32,
    },
}

#[derive(Debug, Clone, Default)]
struct TargetHistory {
    consecutive_failures: u32,
    last_failure: Option<DateTime<Utc>>,
    excluded: bool,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    index: usize,
    score: f64,
    observations: u32,
}

impl Candidate {
    /// Higher score first, then fewer observations, then catalog order.
    fn outranks(&self, other: &Candidate) -> bool {
        match self.score.total_cmp(&other.score) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match self.observations.cmp(&other.observations) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => self.index < other.index,
            },
        }
    }
}

pub struct TargetScheduler {
    kind: SchedulerKind,
    visibility: VisibilityCalculator,
    targets: Vec<Target>,
    history: Vec<TargetHistory>,
    retry: TargetRetryPolicy,
}

impl TargetScheduler {
    pub fn new(
        kind: SchedulerKind,
        visibility: VisibilityCalculator,
        catalog: Catalog,
        retry: TargetRetryPolicy,
    ) -> Self {
        let targets = catalog.into_targets();
        let history = vec![TargetHistory::default(); targets.len()];
        Self {
            kind,
            visibility,
            targets,
            history,
            retry,
        }
    }

    pub fn kind(&self) -> SchedulerKind {
        self.kind
    }

    pub fn visibility(&self) -> &VisibilityCalculator {
        &self.visibility
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn target(&self, id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.id == id)
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.targets.iter().position(|t| t.id == id)
    }

    fn cooldown_until(&self, last_failure: DateTime<Utc>) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.retry.cooldown)
            .ok()
            .and_then(|d| last_failure.checked_add_signed(d))
    }

    fn cooling_down(&self, history: &TargetHistory, now: &DateTime<Utc>) -> bool {
        match history.last_failure {
            Some(last) => match self.cooldown_until(last) {
                Some(until) => *now < until,
                None => true,
            },
            None => false,
        }
    }

    /// Highest-ranked visible target that still needs observations, or
    /// `None` when nothing qualifies.
    pub fn next_target(&self, now: &DateTime<Utc>, in_progress: Option<&str>) -> Option<Target> {
        let mut best: Option<Candidate> = None;
        for (index, (target, history)) in self.targets.iter().zip(&self.history).enumerate() {
            if target.is_complete() || history.excluded || in_progress == Some(target.id.as_str())
            {
                continue;
            }
            if self.cooling_down(history, now) {
                continue;
            }
            let visibility = self.visibility.evaluate(target, now);
            if !visibility.is_visible {
                debug!(
                    "{} not visible (alt {:.1}°, sun {:.1}°)",
                    target.id, visibility.altitude_deg, visibility.sun_altitude_deg
                );
                continue;
            }
            let score = match self.kind {
                SchedulerKind::Dispatch => visibility.merit,
                SchedulerKind::Priority => target.priority,
            };
            let candidate = Candidate {
                index,
                score,
                observations: target.observation_count,
            };
            if best.map_or(true, |b| candidate.outranks(&b)) {
                best = Some(candidate);
            }
        }
        best.map(|c| self.targets[c.index].clone())
    }

    /// Count a completed observation. Returns the new count.
    pub fn record_observation(&mut self, id: &str) -> Option<u32> {
        let index = self.index_of(id)?;
        let history = &mut self.history[index];
        history.consecutive_failures = 0;
        history.last_failure = None;
        let target = &mut self.targets[index];
        target.observation_count += 1;
        Some(target.observation_count)
    }

    /// Record a failed acquisition and apply the retry policy.
    pub fn record_failure(
        &mut self,
        id: &str,
        now: DateTime<Utc>,
        kind: FailureKind,
    ) -> Option<FailureVerdict> {
        let index = self.index_of(id)?;
        let until = self.cooldown_until(now);
        let max_failures = self.retry.max_failures;
        let history = &mut self.history[index];
        history.consecutive_failures += 1;
        history.last_failure = Some(now);
        debug!(
            "{} failed ({:?}), {} consecutive",
            id, kind, history.consecutive_failures
        );
        if history.consecutive_failures >= max_failures {
            history.excluded = true;
            return Some(FailureVerdict::Excluded {
                failures: history.consecutive_failures,
            });
        }
        Some(FailureVerdict::Cooldown {
            until,
            failures: history.consecutive_failures,
        })
    }

    pub fn is_excluded(&self, id: &str) -> bool {
        self.index_of(id)
            .map(|i| self.history[i].excluded)
            .unwrap_or(false)
    }

    /// Earliest time a target currently held back by cooldown becomes
    /// eligible again.
    pub fn next_cooldown_expiry(&self, now: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.targets
            .iter()
            .zip(&self.history)
            .filter(|(t, h)| !t.is_complete() && !h.excluded)
            .filter_map(|(_, h)| h.last_failure.and_then(|last| self.cooldown_until(last)))
            .filter(|until| until > now)
            .min()
    }

    /// Targets that still need observations and are not excluded.
    pub fn remaining(&self) -> usize {
        self.targets
            .iter()
            .zip(&self.history)
            .filter(|(t, h)| !t.is_complete() && !h.excluded)
            .count()
    }
}
