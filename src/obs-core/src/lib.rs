// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod catalog;
pub mod controller;
pub mod device;
pub mod error;
pub mod message;
pub mod pointing;
pub mod scheduler;
pub mod sky;
pub mod target;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use catalog::{Catalog, CatalogError};
pub use device::{
    Camera, Device, DeviceError, DeviceErrorKind, DeviceFuture, DeviceInfo, ImageHandle, Mount,
    PlateSolver, SafetyMonitor,
};
pub use error::ObsError;
pub use message::{ObsMessage, OverrideAction, SafetyKind, SafetySignal};
pub use pointing::{PointingConfig, PointingLoop, PointingOutcome};
pub use scheduler::{SchedulerKind, TargetScheduler};
pub use sky::{EquatorialCoord, SiteContext};
pub use target::{ExposurePlan, Target};
