// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Target catalog loading.
//!
//! A catalog is a TOML document holding a `[[targets]]` array:
//!
//! ```toml
//! [[targets]]
//! id = "M42"
//! ra_hours = 5.588
//! dec_deg = -5.39
//! priority = 1.5
//! exptime_secs = 120.0
//! exposures = 4
//! min_observations = 1
//! max_observations = 2
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::sky::EquatorialCoord;
use crate::target::{ExposurePlan, Target};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {0}: {1}")]
    Read(PathBuf, String),

    #[error("failed to parse catalog: {0}")]
    Parse(String),

    #[error("catalog contains no targets")]
    Empty,

    #[error("duplicate target id '{0}'")]
    DuplicateId(String),

    #[error("target '{id}': {reason}")]
    InvalidEntry { id: String, reason: String },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogEntry {
    id: String,
    ra_deg: Option<f64>,
    ra_hours: Option<f64>,
    dec_deg: f64,
    #[serde(default = "default_priority")]
    priority: f64,
    #[serde(default = "default_exptime_secs")]
    exptime_secs: f64,
    #[serde(default = "default_exposures")]
    exposures: u32,
    #[serde(default = "default_min_observations")]
    min_observations: u32,
    #[serde(default = "default_max_observations")]
    max_observations: u32,
}

fn default_priority() -> f64 {
    1.0
}

fn default_exptime_secs() -> f64 {
    ExposurePlan::default().exptime_secs
}

fn default_exposures() -> u32 {
    ExposurePlan::default().count
}

fn default_min_observations() -> u32 {
    1
}

fn default_max_observations() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    targets: Vec<CatalogEntry>,
}

impl CatalogEntry {
    fn into_target(self) -> Result<Target, CatalogError> {
        let invalid = |reason: String| CatalogError::InvalidEntry {
            id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty".into()));
        }
        let coord = match (self.ra_deg, self.ra_hours) {
            (Some(_), Some(_)) => {
                return Err(invalid("set either ra_deg or ra_hours, not both".into()))
            }
            (None, None) => return Err(invalid("missing ra_deg or ra_hours".into())),
            (Some(ra), None) if (0.0..360.0).contains(&ra) => EquatorialCoord::new(ra, self.dec_deg),
            (None, Some(ra)) if (0.0..24.0).contains(&ra) => {
                EquatorialCoord::from_hours(ra, self.dec_deg)
            }
            _ => return Err(invalid("right ascension out of range".into())),
        };
        if !(-90.0..=90.0).contains(&self.dec_deg) {
            return Err(invalid(format!("dec_deg {} out of range", self.dec_deg)));
        }
        if !self.priority.is_finite() || self.priority < 0.0 {
            return Err(invalid("priority must be a non-negative number".into()));
        }
        if self.exptime_secs.is_nan() || self.exptime_secs <= 0.0 {
            return Err(invalid("exptime_secs must be > 0".into()));
        }
        if self.exposures == 0 {
            return Err(invalid("exposures must be >= 1".into()));
        }
        if self.max_observations == 0 {
            return Err(invalid("max_observations must be >= 1".into()));
        }
        if self.min_observations > self.max_observations {
            return Err(invalid(
                "min_observations must not exceed max_observations".into(),
            ));
        }

        Ok(Target {
            id: self.id,
            coord,
            priority: self.priority,
            exposure: ExposurePlan {
                exptime_secs: self.exptime_secs,
                count: self.exposures,
            },
            observation_count: 0,
            min_observations: self.min_observations,
            max_observations: self.max_observations,
        })
    }
}

/// Loaded, validated target list in file order.
#[derive(Debug, Clone)]
pub struct Catalog {
    targets: Vec<Target>,
}

impl Catalog {
    pub fn from_targets(targets: Vec<Target>) -> Result<Self, CatalogError> {
        if targets.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut seen = HashSet::new();
        for target in &targets {
            if !seen.insert(target.id.as_str()) {
                return Err(CatalogError::DuplicateId(target.id.clone()));
            }
        }
        Ok(Self { targets })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CatalogError> {
        let doc: CatalogDocument =
            toml::from_str(content).map_err(|e| CatalogError::Parse(e.to_string()))?;
        let targets = doc
            .targets
            .into_iter()
            .map(CatalogEntry::into_target)
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_targets(targets)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Read(path.to_path_buf(), e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn into_targets(self) -> Vec<Target> {
        self.targets
    }
}
