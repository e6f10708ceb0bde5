//! Platform bus: matches described devices to drivers and drives their
//! probe/remove lifecycle.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use tracing::{debug, info, warn};

use crate::chrdev::CharDevRegistry;
use crate::device::SamplingDevice;
use crate::device_tree::HardwareDescription;
use crate::error::{Error, Result};
use crate::gpio::GpioBackend;

/// Compatible string of the spice rack node.
pub const COMPATIBLE: &str = "geoffreyjensen,fsr";

pub const DRIVER_NAME: &str = "fsr_spice_rack";

/// What a driver gets to work with while probing and removing.
#[derive(Clone)]
pub struct DriverContext {
    pub registry: Arc<CharDevRegistry>,
    pub gpio: Arc<dyn GpioBackend>,
}

pub trait PlatformDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Compatible strings this driver binds to.
    fn compatible(&self) -> &[&str];

    fn probe(&self, ctx: &DriverContext, description: &dyn HardwareDescription) -> Result<()>;

    fn remove(&self, ctx: &DriverContext, path: &str) -> Result<()>;

    fn matches(&self, description: &dyn HardwareDescription) -> bool {
        let compatible = description.compatible();
        self.compatible()
            .iter()
            .any(|c| compatible.iter().any(|d| d == c))
    }
}

/// Driver for the one spice rack a system can have.
#[derive(Default)]
pub struct SpiceRackDriver {
    device: Mutex<Option<(String, SamplingDevice)>>,
}

impl SpiceRackDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node name of the bound device, if any.
    pub fn node_name(&self) -> Option<String> {
        self.device
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(_, device)| device.node_name().to_string())
    }
}

impl PlatformDriver for SpiceRackDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn compatible(&self) -> &[&str] {
        &[COMPATIBLE]
    }

    fn probe(&self, ctx: &DriverContext, description: &dyn HardwareDescription) -> Result<()> {
        debug!(node = %description.path(), "probe");
        let mut slot = self.device.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((path, _)) = slot.as_ref() {
            return Err(Error::AlreadyBound(path.clone()));
        }

        let device = SamplingDevice::attach(ctx.registry.clone(), ctx.gpio.clone(), description)?;
        *slot = Some((description.path(), device));
        Ok(())
    }

    fn remove(&self, _ctx: &DriverContext, path: &str) -> Result<()> {
        debug!(node = path, "remove");
        let mut slot = self.device.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some((bound, device)) if bound == path => {
                device.detach();
                Ok(())
            }
            other => {
                *slot = other;
                Err(Error::NotBound(path.to_string()))
            }
        }
    }
}

/// Tracks registered drivers and which device each node is bound to.
pub struct Platform {
    ctx: DriverContext,
    drivers: Mutex<Vec<Arc<dyn PlatformDriver>>>,
    bound: Mutex<BTreeMap<String, Arc<dyn PlatformDriver>>>,
}

impl Platform {
    pub fn new(ctx: DriverContext) -> Self {
        Platform {
            ctx,
            drivers: Mutex::new(Vec::new()),
            bound: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn context(&self) -> &DriverContext {
        &self.ctx
    }

    pub fn register_driver(&self, driver: Arc<dyn PlatformDriver>) {
        info!(driver = driver.name(), "registered driver");
        self.drivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(driver);
    }

    /// Probes the first driver matching `description`.
    ///
    /// Returns `Ok(false)` when no registered driver is compatible.
    pub fn device_added(&self, description: &dyn HardwareDescription) -> Result<bool> {
        let path = description.path();
        if self.bound().contains_key(&path) {
            return Err(Error::AlreadyBound(path));
        }

        let driver = self
            .drivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|d| d.matches(description))
            .cloned();

        let Some(driver) = driver else {
            debug!(node = %path, "no matching driver");
            return Ok(false);
        };

        driver.probe(&self.ctx, description)?;
        self.bound().insert(path, driver);
        Ok(true)
    }

    pub fn device_removed(&self, path: &str) -> Result<()> {
        let driver = self
            .bound()
            .remove(path)
            .ok_or_else(|| Error::NotBound(path.to_string()))?;
        driver.remove(&self.ctx, path)
    }

    /// Removes every device bound to the driver `name`, then the driver.
    pub fn unregister_driver(&self, name: &str) -> Result<()> {
        let paths: Vec<String> = self
            .bound()
            .iter()
            .filter(|(_, d)| d.name() == name)
            .map(|(p, _)| p.clone())
            .collect();

        let mut result = Ok(());
        for path in paths {
            if let Err(e) = self.device_removed(&path) {
                warn!(node = %path, error = %e, "remove failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        self.drivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|d| d.name() != name);
        info!(driver = name, "unregistered driver");
        result
    }

    /// Paths of all bound nodes.
    pub fn bound_devices(&self) -> Vec<String> {
        self.bound().keys().cloned().collect()
    }

    fn bound(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Arc<dyn PlatformDriver>>> {
        self.bound.lock().unwrap_or_else(|e| e.into_inner())
    }
}
