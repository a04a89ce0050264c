// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use serde::Serialize;

use crate::sky::EquatorialCoord;

/// Exposures taken once a target is acquired and tracking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExposurePlan {
    pub exptime_secs: f64,
    pub count: u32,
}

impl Default for ExposurePlan {
    fn default() -> Self {
        Self {
            exptime_secs: 120.0,
            count: 1,
        }
    }
}

/// A catalog entry together with its run-time observation count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub id: String,
    pub coord: EquatorialCoord,
    pub priority: f64,
    pub exposure: ExposurePlan,
    pub observation_count: u32,
    pub min_observations: u32,
    pub max_observations: u32,
}

impl Target {
    pub fn new(id: impl Into<String>, coord: EquatorialCoord) -> Self {
        Self {
            id: id.into(),
            coord,
            priority: 1.0,
            exposure: ExposurePlan::default(),
            observation_count: 0,
            min_observations: 1,
            max_observations: 1,
        }
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_exposure(mut self, exptime_secs: f64, count: u32) -> Self {
        self.exposure = ExposurePlan {
            exptime_secs,
            count,
        };
        self
    }

    pub fn with_observations(mut self, min: u32, max: u32) -> Self {
        self.min_observations = min;
        self.max_observations = max;
        self
    }

    pub fn is_complete(&self) -> bool {
        self.observation_count >= self.max_observations
    }

    pub fn below_minimum(&self) -> bool {
        self.observation_count < self.min_observations
    }
}
