// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Sidereal time, horizontal altitude and a low-precision solar position.

use astro::angle::limit_to_two_PI;
use astro::coords::alt_frm_eq;
use astro::time::{julian_day, mn_sidr, CalType, Date};
use chrono::{DateTime, Datelike, Timelike, Utc};

use super::EquatorialCoord;

const SIDEREAL_RATE: f64 = 1.002_737_909_35;
const J2000: f64 = 2_451_545.0;

fn julian_day_at_midnight(time: &DateTime<Utc>) -> f64 {
    let date = time.date_naive();
    julian_day(&Date {
        year: date.year() as i16,
        month: date.month() as u8,
        decimal_day: date.day() as f64,
        cal_type: CalType::Gregorian,
    })
}

fn utc_hours(time: &DateTime<Utc>) -> f64 {
    let t = time.time();
    (t.num_seconds_from_midnight() as f64 + t.nanosecond() as f64 * 1e-9) / 3600.0
}

/// Julian day including the fraction of the UTC day.
pub fn julian_day_utc(time: &DateTime<Utc>) -> f64 {
    julian_day_at_midnight(time) + utc_hours(time) / 24.0
}

/// Greenwich mean sidereal time in radians, `[0, 2π)`.
pub fn greenwich_sidereal_rad(time: &DateTime<Utc>) -> f64 {
    let jd = julian_day_at_midnight(time);
    let gmst_hours = mn_sidr(jd).to_degrees() / 15.0 + utc_hours(time) * SIDEREAL_RATE;
    limit_to_two_PI((gmst_hours * 15.0).to_radians())
}

/// Local mean sidereal time in degrees, `[0, 360)`.
pub fn local_sidereal_deg(longitude_deg: f64, time: &DateTime<Utc>) -> f64 {
    (greenwich_sidereal_rad(time).to_degrees() + longitude_deg).rem_euclid(360.0)
}

/// Altitude of `coord` above the mathematical horizon, in degrees.
pub fn altitude_deg(
    coord: &EquatorialCoord,
    latitude_deg: f64,
    longitude_deg: f64,
    time: &DateTime<Utc>,
) -> f64 {
    // Longitude positive east.
    let hour_angle =
        greenwich_sidereal_rad(time) + longitude_deg.to_radians() - coord.ra_deg.to_radians();
    alt_frm_eq(
        hour_angle,
        coord.dec_deg.to_radians(),
        latitude_deg.to_radians(),
    )
    .to_degrees()
}

/// Apparent solar position, good to about 0.01°.
pub fn sun_position(time: &DateTime<Utc>) -> EquatorialCoord {
    let n = julian_day_utc(time) - J2000;
    let mean_longitude = (280.460 + 0.985_647_4 * n).rem_euclid(360.0);
    let mean_anomaly = (357.528 + 0.985_600_3 * n).rem_euclid(360.0).to_radians();
    let ecliptic_longitude = (mean_longitude
        + 1.915 * mean_anomaly.sin()
        + 0.020 * (2.0 * mean_anomaly).sin())
    .to_radians();
    let obliquity = (23.439 - 0.000_000_4 * n).to_radians();

    let ra = (obliquity.cos() * ecliptic_longitude.sin()).atan2(ecliptic_longitude.cos());
    let dec = (obliquity.sin() * ecliptic_longitude.sin()).asin();
    EquatorialCoord::new(ra.to_degrees(), dec.to_degrees())
}
