// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Mount command execution with retries.

use std::fmt;

use tokio::time;
use tracing::warn;

use crate::device::{DeviceError, Mount};
use crate::sky::EquatorialCoord;

use super::policies::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MountCommand {
    SlewTo(EquatorialCoord),
    StartTracking,
    Stop,
    Park,
    Unpark,
}

impl fmt::Display for MountCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SlewTo(coord) => write!(f, "slew to {}", coord),
            Self::StartTracking => write!(f, "start tracking"),
            Self::Stop => write!(f, "stop"),
            Self::Park => write!(f, "park"),
            Self::Unpark => write!(f, "unpark"),
        }
    }
}

/// Run `command`, retrying transient failures as `retry` allows.
pub async fn execute_with_retry(
    mount: &mut dyn Mount,
    command: MountCommand,
    retry: &dyn RetryPolicy,
) -> Result<(), DeviceError> {
    let max = retry.max_attempts().max(1);
    let mut attempt = 0;
    loop {
        let result = match command {
            MountCommand::SlewTo(coord) => mount.slew_to(coord).await,
            MountCommand::StartTracking => mount.start_tracking().await,
            MountCommand::Stop => mount.stop().await,
            MountCommand::Park => mount.park().await,
            MountCommand::Unpark => mount.unpark().await,
        };
        let err = match result {
            Ok(()) => return Ok(()),
            Err(e) => DeviceError::classify(e.as_ref()),
        };
        if !retry.should_retry(attempt, &err) {
            return Err(err);
        }
        let delay = retry.delay(attempt);
        warn!(
            "Retrying {} (attempt {} of {}, delay {:?}): {}",
            command,
            attempt + 1,
            max,
            delay,
            err
        );
        time::sleep(delay).await;
        attempt += 1;
    }
}
