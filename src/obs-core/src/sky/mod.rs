// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Celestial coordinates, site description and the small amount of
//! spherical astronomy the controller needs.

pub mod ephemeris;
pub mod visibility;

use std::fmt;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

pub use visibility::{Visibility, VisibilityCalculator};

/// Right ascension / declination pair, both in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquatorialCoord {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

impl EquatorialCoord {
    /// Build a coordinate, folding RA into `[0, 360)`.
    pub fn new(ra_deg: f64, dec_deg: f64) -> Self {
        Self {
            ra_deg: ra_deg.rem_euclid(360.0),
            dec_deg,
        }
    }

    pub fn from_hours(ra_hours: f64, dec_deg: f64) -> Self {
        Self::new(ra_hours * 15.0, dec_deg)
    }

    /// Great-circle distance to `other` in degrees.
    ///
    /// Haversine form; stays accurate for sub-arcsecond separations.
    pub fn separation_deg(&self, other: &EquatorialCoord) -> f64 {
        let dec1 = self.dec_deg.to_radians();
        let dec2 = other.dec_deg.to_radians();
        let half_ddec = (dec2 - dec1) / 2.0;
        let half_dra = (other.ra_deg - self.ra_deg).to_radians() / 2.0;
        let hav = half_ddec.sin().powi(2) + dec1.cos() * dec2.cos() * half_dra.sin().powi(2);
        (2.0 * hav.sqrt().min(1.0).asin()).to_degrees()
    }

    /// Per-axis offset `other - self` in degrees, RA wrapped to `(-180, 180]`.
    pub fn offset_to(&self, other: &EquatorialCoord) -> (f64, f64) {
        (
            wrap_signed_deg(other.ra_deg - self.ra_deg),
            other.dec_deg - self.dec_deg,
        )
    }

    /// Coordinate moved by the given per-axis offsets. A declination
    /// pushed past a pole is folded back and RA flips by 180°.
    pub fn shifted(&self, d_ra_deg: f64, d_dec_deg: f64) -> Self {
        let ra = self.ra_deg + d_ra_deg;
        let dec = wrap_signed_deg(self.dec_deg + d_dec_deg);
        if dec > 90.0 {
            Self::new(ra + 180.0, 180.0 - dec)
        } else if dec < -90.0 {
            Self::new(ra + 180.0, -180.0 - dec)
        } else {
            Self::new(ra, dec)
        }
    }
}

impl fmt::Display for EquatorialCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RA {:.4}° Dec {:+.4}°", self.ra_deg, self.dec_deg)
    }
}

/// Wrap an angle in degrees into `(-180, 180]`.
pub fn wrap_signed_deg(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

/// Observatory location and horizon limits for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiteContext {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub elevation_m: f64,
    /// Minimum target altitude.
    pub horizon_deg: f64,
    /// The sun must be below this altitude for observing.
    pub twilight_horizon_deg: f64,
    pub utc_offset_hours: f64,
}

impl SiteContext {
    /// Wall-clock time at the site, used for log lines only.
    pub fn local_time(&self, time: DateTime<Utc>) -> DateTime<FixedOffset> {
        let offset_secs = (self.utc_offset_hours * 3600.0).round() as i32;
        let offset = FixedOffset::east_opt(offset_secs).unwrap_or_else(|| Utc.fix());
        time.with_timezone(&offset)
    }
}

impl Default for SiteContext {
    fn default() -> Self {
        Self {
            latitude_deg: 0.0,
            longitude_deg: 0.0,
            elevation_m: 0.0,
            horizon_deg: 30.0,
            twilight_horizon_deg: -18.0,
            utc_offset_hours: 0.0,
        }
    }
}
