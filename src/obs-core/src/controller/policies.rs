// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Operational policies: device command retries, safety polling cadence and
//! the per-target failure budget.

use std::time::Duration;

use crate::device::DeviceError;

/// Policy for retrying failed device commands.
pub trait RetryPolicy: Send + Sync {
    /// Whether attempt number `attempt` (zero based) may be followed by another.
    fn should_retry(&self, attempt: u32, error: &DeviceError) -> bool;

    fn delay(&self, attempt: u32) -> Duration;

    fn max_attempts(&self) -> u32;
}

/// Doubling delay between attempts, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Defaults suited to mount and camera links.
    pub fn default_device() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::default_device()
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32, error: &DeviceError) -> bool {
        attempt + 1 < self.max_attempts && error.is_transient()
    }

    fn delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Single attempt, no retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _attempt: u32, _error: &DeviceError) -> bool {
        false
    }

    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }

    fn max_attempts(&self) -> u32 {
        1
    }
}

/// How often to read a safety monitor.
pub trait PollingPolicy: Send + Sync {
    fn interval(&self, currently_safe: bool) -> Duration;
}

/// Polls faster while conditions are unsafe so recovery is noticed quickly.
#[derive(Debug, Clone)]
pub struct AdaptivePolling {
    safe_interval: Duration,
    unsafe_interval: Duration,
}

impl AdaptivePolling {
    pub fn new(safe_interval: Duration, unsafe_interval: Duration) -> Self {
        Self {
            safe_interval,
            unsafe_interval,
        }
    }

    pub fn default_weather() -> Self {
        Self {
            safe_interval: Duration::from_secs(30),
            unsafe_interval: Duration::from_secs(10),
        }
    }
}

impl Default for AdaptivePolling {
    fn default() -> Self {
        Self::default_weather()
    }
}

impl PollingPolicy for AdaptivePolling {
    fn interval(&self, currently_safe: bool) -> Duration {
        if currently_safe {
            self.safe_interval
        } else {
            self.unsafe_interval
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixedPolling {
    interval: Duration,
}

impl FixedPolling {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl PollingPolicy for FixedPolling {
    fn interval(&self, _currently_safe: bool) -> Duration {
        self.interval
    }
}

/// Failure budget for a single target within one run.
///
/// After a failed acquisition the target sits out `cooldown`; after
/// `max_failures` consecutive failures it is excluded until the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetRetryPolicy {
    pub cooldown: Duration,
    pub max_failures: u32,
}

impl TargetRetryPolicy {
    pub fn new(cooldown: Duration, max_failures: u32) -> Self {
        Self {
            cooldown,
            max_failures: max_failures.max(1),
        }
    }
}

impl Default for TargetRetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(600), 3)
    }
}
