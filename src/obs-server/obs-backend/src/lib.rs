// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Driver registry for the device families the controller needs.

use std::collections::HashMap;
use std::sync::Arc;

use obs_app::normalize_name;
use obs_core::{Camera, DynResult, Mount, PlateSolver, SafetyMonitor};

pub mod simulator;

pub use simulator::{SimulatedSky, SimulatorSettings};

/// How to reach one device. Drivers ignore the fields they have no use for.
#[derive(Debug, Clone, Default)]
pub struct DeviceAccess {
    pub port: Option<String>,
    pub model: Option<String>,
}

pub type Factory<T> = Arc<dyn Fn(&DeviceAccess) -> DynResult<Box<T>> + Send + Sync>;

/// Named factories for one device family.
pub struct FactoryMap<T: ?Sized> {
    family: &'static str,
    factories: HashMap<String, Factory<T>>,
}

impl<T: ?Sized> Clone for FactoryMap<T> {
    fn clone(&self) -> Self {
        Self {
            family: self.family,
            factories: self.factories.clone(),
        }
    }
}

impl<T: ?Sized> FactoryMap<T> {
    fn new(family: &'static str) -> Self {
        Self {
            family,
            factories: HashMap::new(),
        }
    }

    /// Register a factory under a stable driver name (e.g. "simulator").
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&DeviceAccess) -> DynResult<Box<T>> + Send + Sync + 'static,
    {
        self.factories.insert(normalize_name(name), Arc::new(factory));
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.contains_key(&normalize_name(name))
    }

    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn build(&self, name: &str, access: &DeviceAccess) -> DynResult<Box<T>> {
        let factory = self.factories.get(&normalize_name(name)).ok_or_else(|| {
            format!(
                "Unknown {} driver: {} (available: {})",
                self.family,
                name,
                self.registered().join(", ")
            )
        })?;
        factory(access)
    }
}

/// Context for registering and instantiating device drivers.
#[derive(Clone)]
pub struct RegistrationContext {
    pub mounts: FactoryMap<dyn Mount>,
    pub cameras: FactoryMap<dyn Camera>,
    pub solvers: FactoryMap<dyn PlateSolver>,
    pub weather: FactoryMap<dyn SafetyMonitor>,
}

impl RegistrationContext {
    pub fn new() -> Self {
        Self {
            mounts: FactoryMap::new("mount"),
            cameras: FactoryMap::new("camera"),
            solvers: FactoryMap::new("solver"),
            weather: FactoryMap::new("weather"),
        }
    }
}

impl Default for RegistrationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Register every built-in driver. The simulator drivers built from one
/// context share a single simulated sky.
pub fn register_builtin_backends_on(
    context: &mut RegistrationContext,
    settings: SimulatorSettings,
) {
    simulator::register(context, Arc::new(SimulatedSky::new(settings)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use obs_core::{Device, DeviceInfo, DeviceFuture};

    struct NullMount {
        info: DeviceInfo,
    }

    impl Device for NullMount {
        fn info(&self) -> &DeviceInfo {
            &self.info
        }
    }

    impl Mount for NullMount {
        fn slew_to<'a>(&'a mut self, _coord: obs_core::EquatorialCoord) -> DeviceFuture<'a, ()> {
            Box::pin(std::future::ready(Ok(())))
        }

        fn start_tracking<'a>(&'a mut self) -> DeviceFuture<'a, ()> {
            Box::pin(std::future::ready(Ok(())))
        }

        fn park<'a>(&'a mut self) -> DeviceFuture<'a, ()> {
            Box::pin(std::future::ready(Ok(())))
        }
    }

    fn null_mount(access: &DeviceAccess) -> DynResult<Box<dyn Mount>> {
        Ok(Box::new(NullMount {
            info: DeviceInfo {
                driver: "null".into(),
                model: access.model.clone().unwrap_or_default(),
                port: access.port.clone(),
            },
        }))
    }

    #[test]
    fn test_register_and_build_normalizes_names() {
        let mut context = RegistrationContext::new();
        context.mounts.register("Null-Mount", null_mount);
        assert!(context.mounts.is_registered("nullmount"));
        assert!(context.mounts.is_registered("NULL_MOUNT"));
        assert!(!context.cameras.is_registered("nullmount"));

        let access = DeviceAccess {
            port: Some("/dev/ttyUSB0".into()),
            model: Some("EQ6".into()),
        };
        let mount = context.mounts.build("null-mount", &access).unwrap();
        assert_eq!(mount.info().model, "EQ6");
        assert_eq!(mount.info().port.as_deref(), Some("/dev/ttyUSB0"));
    }

    #[test]
    fn test_unknown_driver_lists_available() {
        let mut context = RegistrationContext::new();
        context.mounts.register("null", null_mount);
        let err = context
            .mounts
            .build("lx200", &DeviceAccess::default())
            .err()
            .unwrap();
        let message = err.to_string();
        assert!(message.contains("Unknown mount driver: lx200"));
        assert!(message.contains("null"));
    }

    #[test]
    fn test_builtin_simulator_registered_for_every_family() {
        let mut context = RegistrationContext::new();
        register_builtin_backends_on(&mut context, SimulatorSettings::default());
        assert!(context.mounts.is_registered("simulator"));
        assert!(context.cameras.is_registered("simulator"));
        assert!(context.solvers.is_registered("simulator"));
        assert!(context.weather.is_registered("simulator"));
    }
}
