// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Target observability and merit.

use chrono::{DateTime, Utc};

use super::ephemeris::{altitude_deg, sun_position};
use super::{EquatorialCoord, SiteContext};
use crate::target::Target;

/// Result of evaluating one target at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Visibility {
    pub is_visible: bool,
    /// `f64::NEG_INFINITY` when not visible.
    pub merit: f64,
    pub altitude_deg: f64,
    pub sun_altitude_deg: f64,
}

/// Merit of a visible target.
///
/// Non-decreasing in both altitude and priority. Targets that have not yet
/// reached their minimum observation count get one extra `priority`.
pub fn merit(altitude_deg: f64, priority: f64, below_minimum: bool) -> f64 {
    let base = priority * (1.0 + altitude_deg.to_radians().sin());
    if below_minimum {
        base + priority
    } else {
        base
    }
}

#[derive(Debug, Clone)]
pub struct VisibilityCalculator {
    site: SiteContext,
}

impl VisibilityCalculator {
    pub fn new(site: SiteContext) -> Self {
        Self { site }
    }

    pub fn site(&self) -> &SiteContext {
        &self.site
    }

    pub fn altitude_deg(&self, coord: &EquatorialCoord, time: &DateTime<Utc>) -> f64 {
        altitude_deg(coord, self.site.latitude_deg, self.site.longitude_deg, time)
    }

    pub fn sun_altitude_deg(&self, time: &DateTime<Utc>) -> f64 {
        self.altitude_deg(&sun_position(time), time)
    }

    /// True while the sun is below the twilight horizon.
    pub fn is_dark(&self, time: &DateTime<Utc>) -> bool {
        self.sun_altitude_deg(time) < self.site.twilight_horizon_deg
    }

    pub fn evaluate_coord(
        &self,
        coord: &EquatorialCoord,
        priority: f64,
        below_minimum: bool,
        time: &DateTime<Utc>,
    ) -> Visibility {
        let altitude = self.altitude_deg(coord, time);
        let sun_altitude = self.sun_altitude_deg(time);
        let is_visible =
            altitude > self.site.horizon_deg && sun_altitude < self.site.twilight_horizon_deg;
        Visibility {
            is_visible,
            merit: if is_visible {
                merit(altitude, priority, below_minimum)
            } else {
                f64::NEG_INFINITY
            },
            altitude_deg: altitude,
            sun_altitude_deg: sun_altitude,
        }
    }

    pub fn evaluate(&self, target: &Target, time: &DateTime<Utc>) -> Visibility {
        self.evaluate_coord(
            &target.coord,
            target.priority,
            target.below_minimum(),
            time,
        )
    }
}
