// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Capability traits for the observatory hardware the controller drives.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::sky::EquatorialCoord;
use crate::DynResult;

/// Boxed future returned by every device operation.
pub type DeviceFuture<'a, T> = Pin<Box<dyn Future<Output = DynResult<T>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceErrorKind {
    Timeout,
    Communication,
    Rejected,
    NotSupported,
}

/// Error a driver reports for a failed command.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: DeviceErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn communication(message: impl Into<String>) -> Self {
        Self {
            kind: DeviceErrorKind::Communication,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: DeviceErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn not_supported(operation: &str) -> Self {
        Self {
            kind: DeviceErrorKind::NotSupported,
            message: format!("{} not supported", operation),
        }
    }

    /// Timeouts and link errors are worth retrying; rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            DeviceErrorKind::Timeout | DeviceErrorKind::Communication
        )
    }

    /// Recover a `DeviceError` from a boxed driver error. Errors of any other
    /// type are treated as communication failures.
    pub fn classify(err: &(dyn std::error::Error + Send + Sync + 'static)) -> Self {
        match err.downcast_ref::<DeviceError>() {
            Some(e) => e.clone(),
            None => Self::communication(err.to_string()),
        }
    }
}

fn unsupported<'a, T: Send + 'a>(operation: &str) -> DeviceFuture<'a, T> {
    let err = DeviceError::not_supported(operation);
    Box::pin(std::future::ready(Err(
        Box::new(err) as Box<dyn std::error::Error + Send + Sync>
    )))
}

/// Static description of a driver instance.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub driver: String,
    pub model: String,
    pub port: Option<String>,
}

pub trait Device {
    fn info(&self) -> &DeviceInfo;
}

/// Telescope mount.
pub trait Mount: Device + Send {
    /// Slew to `coord`. Resolves once the mount reports the slew complete.
    fn slew_to<'a>(&'a mut self, coord: EquatorialCoord) -> DeviceFuture<'a, ()>;

    /// Start sidereal tracking and resolve once it is stable.
    fn start_tracking<'a>(&'a mut self) -> DeviceFuture<'a, ()>;

    fn park<'a>(&'a mut self) -> DeviceFuture<'a, ()>;

    fn unpark<'a>(&'a mut self) -> DeviceFuture<'a, ()> {
        Box::pin(std::future::ready(Ok(())))
    }

    /// Halt any motion, including tracking.
    fn stop<'a>(&'a mut self) -> DeviceFuture<'a, ()> {
        unsupported("stop")
    }
}

/// Reference to a captured frame. Pixel data stays with the camera driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageHandle {
    pub id: Uuid,
    pub exptime_secs: f64,
    pub captured_at: DateTime<Utc>,
    pub path: Option<PathBuf>,
}

impl ImageHandle {
    pub fn new(exptime_secs: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            exptime_secs,
            captured_at: Utc::now(),
            path: None,
        }
    }
}

pub trait Camera: Device + Send {
    fn capture<'a>(&'a mut self, exptime_secs: f64) -> DeviceFuture<'a, ImageHandle>;
}

/// Astrometric solver; returns the field centre of a captured image.
pub trait PlateSolver: Device + Send {
    fn solve<'a>(&'a mut self, image: &'a ImageHandle) -> DeviceFuture<'a, EquatorialCoord>;
}

/// Weather station or any other source of a go/no-go safety reading.
pub trait SafetyMonitor: Device + Send {
    fn is_safe<'a>(&'a mut self) -> DeviceFuture<'a, bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DeviceError::timeout("slew").is_transient());
        assert!(DeviceError::communication("eof").is_transient());
        assert!(!DeviceError::rejected("below limit").is_transient());
        assert!(!DeviceError::not_supported("stop").is_transient());
    }

    #[test]
    fn test_classify_boxed_errors() {
        let boxed: Box<dyn std::error::Error + Send + Sync> =
            Box::new(DeviceError::rejected("limit"));
        assert_eq!(
            DeviceError::classify(boxed.as_ref()).kind,
            DeviceErrorKind::Rejected
        );

        let other: Box<dyn std::error::Error + Send + Sync> = "serial port closed".into();
        let classified = DeviceError::classify(other.as_ref());
        assert_eq!(classified.kind, DeviceErrorKind::Communication);
        assert_eq!(classified.message, "serial port closed");
    }
}
