// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Simulated observatory for development and testing.
//!
//! The mount, camera and solver share one [`SimulatedSky`]: the mount lands
//! off by a fixed bias, the camera records where the telescope really points
//! for every frame, and the solver reports that position back. No hardware
//! required.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time;
use tracing::debug;
use uuid::Uuid;

use obs_core::{
    Camera, Device, DeviceError, DeviceFuture, DeviceInfo, EquatorialCoord, ImageHandle, Mount,
    PlateSolver, SafetyMonitor,
};

use crate::{DeviceAccess, RegistrationContext};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatorSettings {
    /// Where the mount really ends up relative to the commanded position.
    pub bias_ra_deg: f64,
    pub bias_dec_deg: f64,
    pub slew_rate_deg_per_sec: f64,
    /// Multiplier applied to every simulated delay; 0 makes everything instant.
    pub time_scale: f64,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            bias_ra_deg: 0.08,
            bias_dec_deg: -0.04,
            slew_rate_deg_per_sec: 4.0,
            time_scale: 0.0,
        }
    }
}

#[derive(Debug, Default)]
struct SkyState {
    pointing: Option<EquatorialCoord>,
    parked: bool,
    tracking: bool,
    frames: HashMap<Uuid, EquatorialCoord>,
}

/// State shared by the simulated devices of one registry.
#[derive(Debug)]
pub struct SimulatedSky {
    settings: SimulatorSettings,
    state: Mutex<SkyState>,
}

impl SimulatedSky {
    pub fn new(settings: SimulatorSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(SkyState {
                parked: true,
                ..SkyState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SkyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True telescope position, `None` while parked.
    pub fn pointing(&self) -> Option<EquatorialCoord> {
        self.lock().pointing
    }

    pub fn is_parked(&self) -> bool {
        self.lock().parked
    }

    pub fn is_tracking(&self) -> bool {
        self.lock().tracking
    }

    fn scaled(&self, secs: f64) -> Duration {
        let secs = secs * self.settings.time_scale;
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }

    async fn pause(&self, secs: f64) {
        let delay = self.scaled(secs);
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
    }
}

fn device_info(driver: &str, access: &DeviceAccess, default_model: &str) -> DeviceInfo {
    DeviceInfo {
        driver: driver.to_string(),
        model: access
            .model
            .clone()
            .unwrap_or_else(|| default_model.to_string()),
        port: access.port.clone(),
    }
}

pub struct SimMount {
    info: DeviceInfo,
    sky: Arc<SimulatedSky>,
}

impl SimMount {
    pub fn new(sky: Arc<SimulatedSky>, access: &DeviceAccess) -> Self {
        Self {
            info: device_info("simulator", access, "sim-mount"),
            sky,
        }
    }
}

impl Device for SimMount {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

impl Mount for SimMount {
    fn slew_to<'a>(&'a mut self, coord: EquatorialCoord) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            let distance = {
                let state = self.sky.lock();
                if state.parked {
                    return Err(DeviceError::rejected("mount is parked").into());
                }
                state
                    .pointing
                    .map(|p| p.separation_deg(&coord))
                    .unwrap_or(90.0)
            };
            let rate = self.sky.settings.slew_rate_deg_per_sec.max(f64::EPSILON);
            self.sky.pause(distance / rate).await;

            let s = self.sky.settings;
            let landed = coord.shifted(s.bias_ra_deg, s.bias_dec_deg);
            debug!("Simulated slew to {} landed at {}", coord, landed);
            let mut state = self.sky.lock();
            state.pointing = Some(landed);
            state.tracking = false;
            Ok(())
        })
    }

    fn start_tracking<'a>(&'a mut self) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.sky.lock();
            if state.pointing.is_none() {
                return Err(DeviceError::rejected("no position to track").into());
            }
            state.tracking = true;
            Ok(())
        })
    }

    fn park<'a>(&'a mut self) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            self.sky.pause(5.0).await;
            let mut state = self.sky.lock();
            state.pointing = None;
            state.tracking = false;
            state.parked = true;
            Ok(())
        })
    }

    fn unpark<'a>(&'a mut self) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            self.sky.lock().parked = false;
            Ok(())
        })
    }

    fn stop<'a>(&'a mut self) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            self.sky.lock().tracking = false;
            Ok(())
        })
    }
}

pub struct SimCamera {
    info: DeviceInfo,
    sky: Arc<SimulatedSky>,
}

impl SimCamera {
    pub fn new(sky: Arc<SimulatedSky>, access: &DeviceAccess) -> Self {
        Self {
            info: device_info("simulator", access, "sim-camera"),
            sky,
        }
    }
}

impl Device for SimCamera {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

impl Camera for SimCamera {
    fn capture<'a>(&'a mut self, exptime_secs: f64) -> DeviceFuture<'a, ImageHandle> {
        Box::pin(async move {
            self.sky.pause(exptime_secs).await;
            let image = ImageHandle::new(exptime_secs);
            let mut state = self.sky.lock();
            if let Some(pointing) = state.pointing {
                state.frames.insert(image.id, pointing);
            }
            Ok(image)
        })
    }
}

/// Solves any frame the simulated camera took while the mount was unparked.
pub struct SimSolver {
    info: DeviceInfo,
    sky: Arc<SimulatedSky>,
}

impl SimSolver {
    pub fn new(sky: Arc<SimulatedSky>, access: &DeviceAccess) -> Self {
        Self {
            info: device_info("simulator", access, "sim-solver"),
            sky,
        }
    }
}

impl Device for SimSolver {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

impl PlateSolver for SimSolver {
    fn solve<'a>(&'a mut self, image: &'a ImageHandle) -> DeviceFuture<'a, EquatorialCoord> {
        Box::pin(async move {
            self.sky.pause(2.0).await;
            match self.sky.lock().frames.remove(&image.id) {
                Some(coord) => Ok(coord),
                None => Err(format!("no stars found in frame {}", image.id).into()),
            }
        })
    }
}

/// Reports unsafe while a flag file exists. With no file configured it is
/// always safe.
pub struct FlagFileWeather {
    info: DeviceInfo,
    flag: Option<PathBuf>,
}

impl FlagFileWeather {
    pub fn new(access: &DeviceAccess) -> Self {
        Self {
            info: device_info("simulator", access, "flag-file"),
            flag: access.port.as_ref().map(PathBuf::from),
        }
    }
}

impl Device for FlagFileWeather {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

impl SafetyMonitor for FlagFileWeather {
    fn is_safe<'a>(&'a mut self) -> DeviceFuture<'a, bool> {
        Box::pin(async move {
            let Some(flag) = &self.flag else {
                return Ok(true);
            };
            let present = tokio::fs::try_exists(flag).await?;
            Ok(!present)
        })
    }
}

pub(crate) fn register(context: &mut RegistrationContext, sky: Arc<SimulatedSky>) {
    let mount_sky = sky.clone();
    context.mounts.register("simulator", move |access| {
        let mount: Box<dyn Mount> = Box::new(SimMount::new(mount_sky.clone(), access));
        Ok(mount)
    });
    let camera_sky = sky.clone();
    context.cameras.register("simulator", move |access| {
        let camera: Box<dyn Camera> = Box::new(SimCamera::new(camera_sky.clone(), access));
        Ok(camera)
    });
    context.solvers.register("simulator", move |access| {
        let solver: Box<dyn PlateSolver> = Box::new(SimSolver::new(sky.clone(), access));
        Ok(solver)
    });
    context.weather.register("simulator", |access| {
        let weather: Box<dyn SafetyMonitor> = Box::new(FlagFileWeather::new(access));
        Ok(weather)
    });
}
