// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Section-keyed loading of `obs-rs.toml`.

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "obs-rs.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config file {0}: {1}")]
    ParseError(PathBuf, String),

    #[error("Config file {0} has no [{1}] section")]
    MissingSection(PathBuf, &'static str),
}

/// Default locations, most specific first: working directory, then the
/// user config directory, then `/etc`.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("obs-rs").join(CONFIG_FILE_NAME));
    }
    paths.push(PathBuf::from("/etc/obs-rs").join(CONFIG_FILE_NAME));
    paths
}

fn parse_error(path: &Path, err: impl std::fmt::Display) -> ConfigError {
    ConfigError::ParseError(path.to_path_buf(), err.to_string())
}

fn parse_section<T: DeserializeOwned>(
    path: &Path,
    content: &str,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    let table: toml::Table = toml::from_str(content).map_err(|e| parse_error(path, e))?;
    let Some(section) = table.get(key) else {
        return Ok(None);
    };
    // Round-trip through text so that #[serde(default)] applies per field.
    let section_toml = toml::to_string(section).map_err(|e| parse_error(path, e))?;
    toml::from_str::<T>(&section_toml)
        .map(Some)
        .map_err(|e| parse_error(path, e))
}

fn load_section_from_file<T: DeserializeOwned>(
    path: &Path,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;
    parse_section(path, &content, key)
}

/// A struct stored under one `[<section_key>]` of `obs-rs.toml`.
pub trait ConfigFile: Sized + Default + DeserializeOwned {
    fn section_key() -> &'static str;

    /// Load from an explicit path. The section must be present.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        load_section_from_file::<Self>(path, Self::section_key())?
            .ok_or_else(|| ConfigError::MissingSection(path.to_path_buf(), Self::section_key()))
    }

    /// Parse a document already in memory; `origin` is used in errors only.
    fn load_from_str(origin: &Path, content: &str) -> Result<Self, ConfigError> {
        parse_section::<Self>(origin, content, Self::section_key())?
            .ok_or_else(|| ConfigError::MissingSection(origin.to_path_buf(), Self::section_key()))
    }

    /// First file on the search path that carries the section, or defaults
    /// with `None` when there is none.
    fn load_from_default_paths() -> Result<(Self, Option<PathBuf>), ConfigError> {
        for path in config_search_paths() {
            if !path.exists() {
                continue;
            }
            if let Some(cfg) = load_section_from_file::<Self>(&path, Self::section_key())? {
                return Ok((cfg, Some(path)));
            }
            debug!(
                "{} has no [{}] section, skipping",
                path.display(),
                Self::section_key()
            );
        }
        Ok((Self::default(), None))
    }
}
