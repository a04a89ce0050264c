// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration file support for obs-server.
//!
//! Config is loaded from the `[obs-server]` section of `obs-rs.toml`.
//! Default search order:
//! 1. Path specified via `--config` CLI argument
//! 2. `./obs-rs.toml`
//! 3. `~/.config/obs-rs/obs-rs.toml`
//! 4. `/etc/obs-rs/obs-rs.toml`

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use obs_app::ConfigFile;
use obs_core::controller::AVAILABLE_TABLES;
use obs_core::SchedulerKind;

pub const SECTION_KEY: &str = "obs-server";

/// Top-level server configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub general: GeneralConfig,
    pub site: SiteConfig,
    pub mount: MountConfig,
    pub camera: DeviceConfig,
    pub solver: SolverConfig,
    pub weather: WeatherConfig,
    pub pointing: PointingSection,
    pub scheduler: SchedulerConfig,
    pub state_machine: StateMachineConfig,
    pub messaging: MessagingConfig,
    pub behavior: BehaviorConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Observatory name, used in log lines
    pub name: Option<String>,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: Option<String>,
}

/// Observatory location and horizon limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Decimal degrees, north positive
    pub latitude: f64,
    /// Decimal degrees, east positive
    pub longitude: f64,
    pub elevation_m: f64,
    /// Minimum altitude for a target to count as visible
    pub horizon_deg: f64,
    /// Sun altitude below which observing may start
    pub twilight_horizon_deg: f64,
    pub utc_offset_hours: f64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            elevation_m: 0.0,
            horizon_deg: 30.0,
            twilight_horizon_deg: -18.0,
            utc_offset_hours: 0.0,
        }
    }
}

/// Driver selection shared by the camera section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub driver: String,
    pub model: Option<String>,
    pub port: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            driver: "simulator".to_string(),
            model: None,
            port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub driver: String,
    pub model: Option<String>,
    pub port: Option<String>,
    /// Simulator only: systematic pointing error
    pub sim_bias_ra_deg: f64,
    pub sim_bias_dec_deg: f64,
    pub sim_slew_rate_deg_per_sec: f64,
    /// Simulator only: scale applied to slew, exposure and solve times
    pub sim_time_scale: f64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            driver: "simulator".to_string(),
            model: None,
            port: None,
            sim_bias_ra_deg: 0.08,
            sim_bias_dec_deg: -0.04,
            sim_slew_rate_deg_per_sec: 4.0,
            sim_time_scale: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub driver: String,
    /// Give up on a frame after this long; 0 disables the limit
    pub timeout_secs: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            driver: "simulator".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    /// Driver name; the weather monitor is disabled when empty
    pub driver: String,
    /// Driver specific; the simulator treats it as a flag file path
    pub port: Option<String>,
    /// Poll interval while conditions are safe
    pub poll_interval_ms: u64,
    /// Poll interval while conditions are unsafe
    pub unsafe_poll_interval_ms: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            driver: "simulator".to_string(),
            port: None,
            poll_interval_ms: 30_000,
            unsafe_poll_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PointingSection {
    /// Convergence threshold in degrees
    pub threshold: f64,
    /// Exposure time of pointing frames in seconds
    pub exptime: f64,
    pub max_iterations: u32,
}

impl Default for PointingSection {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            exptime: 30.0,
            max_iterations: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Ranking strategy: "dispatch" or "priority"
    #[serde(rename = "type")]
    pub scheduler_type: String,
    /// Target catalog (TOML with a [[targets]] array)
    pub catalog: PathBuf,
    pub exhausted_cooldown_secs: u64,
    pub max_target_failures: u32,
    /// Upper bound on waits for darkness or cooldown expiry
    pub idle_retry_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_type: SchedulerKind::default().to_string(),
            catalog: PathBuf::from("targets.toml"),
            exhausted_cooldown_secs: 600,
            max_target_failures: 3,
            idle_retry_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMachineConfig {
    pub table: String,
    /// How long to hold before parking while conditions stay unsafe
    pub safety_grace_secs: u64,
    pub checkpoint_interval_ms: u64,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            table: obs_core::controller::SIMPLE_STATE_TABLE.to_string(),
            safety_grace_secs: 900,
            checkpoint_interval_ms: 500,
        }
    }
}

/// Messaging gateway listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub enabled: bool,
    pub listen: IpAddr,
    pub port: u16,
    pub auth: AuthConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            port: 6500,
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Valid tokens (empty = no auth required)
    pub tokens: Vec<String>,
}

/// Retry behavior for device commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 500,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        validate_log_level(self.general.log_level.as_deref())?;
        self.validate_site()?;

        validate_driver("[mount].driver", &self.mount.driver)?;
        validate_driver("[camera].driver", &self.camera.driver)?;
        validate_driver("[solver].driver", &self.solver.driver)?;
        if !self.mount.sim_slew_rate_deg_per_sec.is_finite()
            || self.mount.sim_slew_rate_deg_per_sec <= 0.0
        {
            return Err("[mount].sim_slew_rate_deg_per_sec must be > 0".to_string());
        }
        if !self.mount.sim_time_scale.is_finite() || self.mount.sim_time_scale < 0.0 {
            return Err("[mount].sim_time_scale must be >= 0".to_string());
        }
        if !self.weather.driver.trim().is_empty()
            && (self.weather.poll_interval_ms == 0 || self.weather.unsafe_poll_interval_ms == 0)
        {
            return Err("[weather] poll intervals must be > 0".to_string());
        }

        if !self.pointing.threshold.is_finite() || self.pointing.threshold <= 0.0 {
            return Err("[pointing].threshold must be > 0".to_string());
        }
        if !self.pointing.exptime.is_finite() || self.pointing.exptime <= 0.0 {
            return Err("[pointing].exptime must be > 0".to_string());
        }
        if self.pointing.max_iterations == 0 {
            return Err("[pointing].max_iterations must be >= 1".to_string());
        }

        SchedulerKind::from_str(&self.scheduler.scheduler_type)
            .map_err(|e| format!("[scheduler].type: {}", e))?;
        if self.scheduler.catalog.as_os_str().is_empty() {
            return Err("[scheduler].catalog must be set".to_string());
        }
        if self.scheduler.max_target_failures == 0 {
            return Err("[scheduler].max_target_failures must be >= 1".to_string());
        }
        if self.scheduler.idle_retry_secs == 0 {
            return Err("[scheduler].idle_retry_secs must be > 0".to_string());
        }

        if !AVAILABLE_TABLES.contains(&self.state_machine.table.as_str()) {
            return Err(format!(
                "[state_machine].table '{}' is unknown (available: {})",
                self.state_machine.table,
                AVAILABLE_TABLES.join(", ")
            ));
        }
        if self.state_machine.checkpoint_interval_ms == 0 {
            return Err("[state_machine].checkpoint_interval_ms must be > 0".to_string());
        }

        if self.messaging.enabled && self.messaging.port == 0 {
            return Err("[messaging].port must be > 0 when messaging is enabled".to_string());
        }
        if self.messaging.auth.tokens.iter().any(|t| t.trim().is_empty()) {
            return Err("[messaging.auth].tokens must not contain empty tokens".to_string());
        }

        if self.behavior.max_retries == 0 {
            return Err("[behavior].max_retries must be > 0".to_string());
        }
        if self.behavior.retry_base_delay_ms == 0 {
            return Err("[behavior].retry_base_delay_ms must be > 0".to_string());
        }
        Ok(())
    }

    fn validate_site(&self) -> Result<(), String> {
        let site = &self.site;
        if !(-90.0..=90.0).contains(&site.latitude) {
            return Err("[site].latitude must be in range -90..=90".to_string());
        }
        if !(-180.0..=180.0).contains(&site.longitude) {
            return Err("[site].longitude must be in range -180..=180".to_string());
        }
        if !(-90.0..90.0).contains(&site.horizon_deg) {
            return Err("[site].horizon_deg must be in range -90..90".to_string());
        }
        if !(-90.0..=0.0).contains(&site.twilight_horizon_deg) {
            return Err("[site].twilight_horizon_deg must be in range -90..=0".to_string());
        }
        if !(-14.0..=14.0).contains(&site.utc_offset_hours) {
            return Err("[site].utc_offset_hours must be in range -14..=14".to_string());
        }
        Ok(())
    }

    /// Example configuration wrapped under the `[obs-server]` header.
    pub fn example_toml() -> String {
        #[derive(Serialize)]
        struct Wrapper {
            #[serde(rename = "obs-server")]
            inner: ServerConfig,
        }
        let example = ServerConfig {
            general: GeneralConfig {
                name: Some("Backyard Observatory".to_string()),
                log_level: Some("info".to_string()),
            },
            site: SiteConfig {
                latitude: 52.2297,
                longitude: 21.0122,
                elevation_m: 110.0,
                utc_offset_hours: 1.0,
                ..SiteConfig::default()
            },
            weather: WeatherConfig {
                port: Some("/tmp/obs-rs-unsafe".to_string()),
                ..WeatherConfig::default()
            },
            messaging: MessagingConfig {
                auth: AuthConfig {
                    tokens: vec!["change-me".to_string()],
                },
                ..MessagingConfig::default()
            },
            ..ServerConfig::default()
        };
        toml::to_string_pretty(&Wrapper { inner: example }).unwrap_or_default()
    }
}

fn validate_log_level(level: Option<&str>) -> Result<(), String> {
    match level {
        None | Some("trace" | "debug" | "info" | "warn" | "error") => Ok(()),
        Some(level) => Err(format!(
            "[general].log_level '{}' is invalid (expected one of: trace, debug, info, warn, error)",
            level
        )),
    }
}

fn validate_driver(path: &str, driver: &str) -> Result<(), String> {
    if driver.trim().is_empty() {
        return Err(format!("{} must not be empty", path));
    }
    Ok(())
}

impl ConfigFile for ServerConfig {
    fn section_key() -> &'static str {
        SECTION_KEY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.site.horizon_deg, 30.0);
        assert_eq!(config.site.twilight_horizon_deg, -18.0);
        assert_eq!(config.mount.driver, "simulator");
        assert_eq!(config.pointing.threshold, 0.05);
        assert_eq!(config.pointing.exptime, 30.0);
        assert_eq!(config.pointing.max_iterations, 3);
        assert_eq!(config.scheduler.scheduler_type, "dispatch");
        assert_eq!(config.scheduler.exhausted_cooldown_secs, 600);
        assert_eq!(config.scheduler.max_target_failures, 3);
        assert_eq!(config.state_machine.table, "simple_state_table");
        assert!(config.messaging.enabled);
        assert_eq!(config.messaging.port, 6500);
        assert!(config.messaging.auth.tokens.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_section() {
        let toml_str = r#"
[obs-server.site]
latitude = 37.34
longitude = -121.64
horizon_deg = 25.0

[obs-server.scheduler]
type = "priority"
catalog = "/srv/obs/targets.toml"

[obs-server.messaging.auth]
tokens = ["dome-key"]
"#;
        let config = ServerConfig::load_from_str(Path::new("test"), toml_str).unwrap();
        assert_eq!(config.site.latitude, 37.34);
        assert_eq!(config.site.horizon_deg, 25.0);
        assert_eq!(config.site.twilight_horizon_deg, -18.0);
        assert_eq!(config.scheduler.scheduler_type, "priority");
        assert_eq!(
            config.scheduler.catalog,
            PathBuf::from("/srv/obs/targets.toml")
        );
        assert_eq!(config.messaging.auth.tokens, vec!["dome-key".to_string()]);
        assert_eq!(config.messaging.port, 6500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_example_toml_round_trips() {
        let example = ServerConfig::example_toml();
        assert!(example.contains("[obs-server"));
        let config = ServerConfig::load_from_str(Path::new("example"), &example).unwrap();
        assert_eq!(config.general.name.as_deref(), Some("Backyard Observatory"));
        assert_eq!(config.site.latitude, 52.2297);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_site() {
        let mut config = ServerConfig::default();
        config.site.latitude = 91.0;
        assert!(config.validate().unwrap_err().contains("[site].latitude"));

        let mut config = ServerConfig::default();
        config.site.twilight_horizon_deg = 5.0;
        assert!(config
            .validate()
            .unwrap_err()
            .contains("[site].twilight_horizon_deg"));
    }

    #[test]
    fn test_validate_rejects_unknown_names() {
        let mut config = ServerConfig::default();
        config.scheduler.scheduler_type = "random".to_string();
        assert!(config.validate().unwrap_err().contains("[scheduler].type"));

        let mut config = ServerConfig::default();
        config.state_machine.table = "fancy_table".to_string();
        assert!(config.validate().unwrap_err().contains("fancy_table"));
    }

    #[test]
    fn test_validate_rejects_empty_driver() {
        let mut config = ServerConfig::default();
        config.camera.driver = "  ".to_string();
        assert_eq!(
            config.validate().unwrap_err(),
            "[camera].driver must not be empty"
        );
    }

    #[test]
    fn test_validate_rejects_bad_pointing() {
        let mut config = ServerConfig::default();
        config.pointing.threshold = 0.0;
        assert!(config.validate().unwrap_err().contains("[pointing].threshold"));

        let mut config = ServerConfig::default();
        config.pointing.max_iterations = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .contains("[pointing].max_iterations"));
    }

    #[test]
    fn test_validate_rejects_empty_token_and_log_level() {
        let mut config = ServerConfig::default();
        config.messaging.auth.tokens = vec!["  ".to_string()];
        assert!(config.validate().unwrap_err().contains("[messaging.auth]"));

        let mut config = ServerConfig::default();
        config.general.log_level = Some("loud".to_string());
        assert!(config.validate().unwrap_err().contains("log_level"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obs-rs.toml");
        std::fs::write(&path, "[obs-server.messaging]\nport = 6600\n").unwrap();
        let config = ServerConfig::load_from_file(&path).unwrap();
        assert_eq!(config.messaging.port, 6600);
        assert!(config.messaging.enabled);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: ServerConfig = toml::from_str("[pointing]\nthreshold = 0.02\n").unwrap();
        assert_eq!(config.pointing.threshold, 0.02);
        assert_eq!(config.pointing.max_iterations, 3);
        assert_eq!(config.behavior.max_retries, 3);
    }
}
