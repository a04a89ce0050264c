// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Closed-loop pointing refinement.
//!
//! After the coarse slew the loop repeatedly takes a short exposure, plate
//! solves it and compares the solved field centre with the nominal target.
//! While the residual is above threshold it moves the commanded position by
//! the negative of the residual and tries again, up to `max_iterations`
//! captures.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::controller::executor::{execute_with_retry, MountCommand};
use crate::controller::policies::RetryPolicy;
use crate::device::{Camera, DeviceError, Mount, PlateSolver};
use crate::sky::EquatorialCoord;
use crate::DynResult;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointingConfig {
    /// Maximum acceptable error, degrees.
    pub threshold_deg: f64,
    /// Exposure time of the pointing frames.
    pub exptime_secs: f64,
    pub max_iterations: u32,
    pub solve_timeout: Option<Duration>,
}

impl Default for PointingConfig {
    fn default() -> Self {
        Self {
            threshold_deg: 0.05,
            exptime_secs: 30.0,
            max_iterations: 3,
            solve_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// One capture/solve/compare cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PointingAttempt {
    pub iteration: u32,
    pub commanded: EquatorialCoord,
    pub measured: EquatorialCoord,
    pub error_deg: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    Capture(String),
    Solve(String),
    Slew(String),
    /// A queued message needs the controller's attention.
    Preempted(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture(e) => write!(f, "capture failed: {}", e),
            Self::Solve(e) => write!(f, "solve failed: {}", e),
            Self::Slew(e) => write!(f, "corrective slew failed: {}", e),
            Self::Preempted(why) => write!(f, "preempted: {}", why),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PointingOutcome {
    Converged { error_deg: f64, iterations: u32 },
    Exhausted { last_error_deg: f64, iterations: u32 },
    Aborted { reason: AbortReason, iterations: u32 },
}

impl PointingOutcome {
    pub fn iterations(&self) -> u32 {
        match self {
            Self::Converged { iterations, .. }
            | Self::Exhausted { iterations, .. }
            | Self::Aborted { iterations, .. } => *iterations,
        }
    }

    pub fn is_preempted(&self) -> bool {
        matches!(
            self,
            Self::Aborted {
                reason: AbortReason::Preempted(_),
                ..
            }
        )
    }
}

impl fmt::Display for PointingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged {
                error_deg,
                iterations,
            } => write!(
                f,
                "converged to {:.4}° after {} iteration(s)",
                error_deg, iterations
            ),
            Self::Exhausted {
                last_error_deg,
                iterations,
            } => write!(
                f,
                "exhausted after {} iteration(s), last error {:.4}°",
                iterations, last_error_deg
            ),
            Self::Aborted { reason, iterations } => {
                write!(f, "aborted after {} iteration(s): {}", iterations, reason)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointingReport {
    pub outcome: PointingOutcome,
    pub attempts: Vec<PointingAttempt>,
}

/// Consulted before every capture. Returning `Some(reason)` stops the loop.
pub trait Checkpoint: Send {
    fn interrupt(&mut self) -> Option<String>;

    /// Capture number `iteration` is about to start.
    fn iteration_started(&mut self, _iteration: u32) {}
}

/// A checkpoint that never interrupts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCheckpoint;

impl Checkpoint for NoCheckpoint {
    fn interrupt(&mut self) -> Option<String> {
        None
    }
}

pub struct PointingLoop<'a> {
    mount: &'a mut dyn Mount,
    camera: &'a mut dyn Camera,
    solver: &'a mut dyn PlateSolver,
    retry: &'a dyn RetryPolicy,
}

impl<'a> PointingLoop<'a> {
    pub fn new(
        mount: &'a mut dyn Mount,
        camera: &'a mut dyn Camera,
        solver: &'a mut dyn PlateSolver,
        retry: &'a dyn RetryPolicy,
    ) -> Self {
        Self {
            mount,
            camera,
            solver,
            retry,
        }
    }

    /// Slew to the nominal position.
    pub async fn coarse_slew(&mut self, nominal: &EquatorialCoord) -> Result<(), DeviceError> {
        execute_with_retry(&mut *self.mount, MountCommand::SlewTo(*nominal), self.retry).await
    }

    /// Coarse slew followed by refinement.
    pub async fn acquire(
        &mut self,
        nominal: &EquatorialCoord,
        config: &PointingConfig,
        checkpoint: &mut dyn Checkpoint,
    ) -> PointingReport {
        if let Err(e) = self.coarse_slew(nominal).await {
            return PointingReport {
                outcome: PointingOutcome::Aborted {
                    reason: AbortReason::Slew(e.to_string()),
                    iterations: 0,
                },
                attempts: Vec::new(),
            };
        }
        self.refine(nominal, config, checkpoint).await
    }

    async fn solve(
        &mut self,
        image: &crate::device::ImageHandle,
        timeout: Option<Duration>,
    ) -> DynResult<EquatorialCoord> {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.solver.solve(image)).await {
                Ok(result) => result,
                Err(_) => Err(format!("no solution within {:?}", limit).into()),
            },
            None => self.solver.solve(image).await,
        }
    }

    /// Iterate capture, solve and correct, assuming the mount already sits
    /// at (or near) `nominal`.
    pub async fn refine(
        &mut self,
        nominal: &EquatorialCoord,
        config: &PointingConfig,
        checkpoint: &mut dyn Checkpoint,
    ) -> PointingReport {
        let mut attempts = Vec::new();
        let mut commanded = *nominal;
        let mut last_error_deg = f64::INFINITY;
        let aborted = |reason, iterations, attempts| PointingReport {
            outcome: PointingOutcome::Aborted { reason, iterations },
            attempts,
        };

        for iteration in 1..=config.max_iterations {
            if let Some(why) = checkpoint.interrupt() {
                return aborted(AbortReason::Preempted(why), iteration - 1, attempts);
            }
            checkpoint.iteration_started(iteration);

            let image = match self.camera.capture(config.exptime_secs).await {
                Ok(image) => image,
                Err(e) => return aborted(AbortReason::Capture(e.to_string()), iteration, attempts),
            };
            let measured = match self.solve(&image, config.solve_timeout).await {
                Ok(coord) => coord,
                Err(e) => return aborted(AbortReason::Solve(e.to_string()), iteration, attempts),
            };

            let error_deg = measured.separation_deg(nominal);
            let attempt = PointingAttempt {
                iteration,
                commanded,
                measured,
                error_deg,
            };
            debug!(
                "Pointing iteration {}: commanded {}, measured {}, error {:.4}°",
                iteration, commanded, measured, error_deg
            );
            attempts.push(attempt);
            last_error_deg = error_deg;

            if error_deg <= config.threshold_deg {
                return PointingReport {
                    outcome: PointingOutcome::Converged {
                        error_deg,
                        iterations: iteration,
                    },
                    attempts,
                };
            }

            let (d_ra, d_dec) = nominal.offset_to(&measured);
            commanded = commanded.shifted(-d_ra, -d_dec);
            if let Err(e) =
                execute_with_retry(&mut *self.mount, MountCommand::SlewTo(commanded), self.retry)
                    .await
            {
                return aborted(AbortReason::Slew(e.to_string()), iteration, attempts);
            }
        }

        PointingReport {
            outcome: PointingOutcome::Exhausted {
                last_error_deg,
                iterations: config.max_iterations,
            },
            attempts,
        }
    }
}
