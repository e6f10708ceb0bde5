//! The spice rack character device.
//!
//! [`SamplingDevice::attach`] resolves the three lines and registers the
//! node `fsr_gpio_0`. Every read of that node samples the lines and returns
//! one byte with line `n` in bit `n`. Dropping the device (or calling
//! [`SamplingDevice::detach`]) removes the node again.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use tracing::{debug, error, info};

use crate::chrdev::{CharDevRegistry, DeviceNumber, FileOperations, RegistryError, UserBuffer};
use crate::device_tree::HardwareDescription;
use crate::error::{Error, RegistrationError, RegistrationStep, Result};
use crate::gpio::{GpioBackend, GpioError, Level};
use crate::line::{self, LineSet, LINE_NAMES};

/// Name the device numbers are registered under.
pub const REGION_NAME: &str = "fsr_spice_rack";

pub const CLASS_NAME: &str = "fsr_gpio";

/// Only one rack is supported, so its node always has index 0.
pub const NODE_INDEX: u32 = 0;

pub fn node_name(index: u32) -> String {
    format!("{}_{}", CLASS_NAME, index)
}

/// The state shared by all sessions of the device.
struct Sampler {
    node: String,
    lines: Mutex<LineSet>,
    gpio: Arc<dyn GpioBackend>,
    /// Set under the `lines` lock once the device is torn down; sessions
    /// opened before that fail from then on.
    detached: AtomicBool,
}

impl Sampler {
    /// Samples all lines while holding the line lock, so concurrent readers
    /// each get a whole snapshot.
    fn sample(&self) -> Result<u8> {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if self.detached.load(Ordering::SeqCst) {
            return Err(Error::Detached(self.node.clone()));
        }
        let ids = lines.ids();
        let levels = self.gpio.get_values(&ids)?;
        let levels: [Level; 3] = levels.try_into().map_err(|got: Vec<Level>| {
            GpioError::ShortRead {
                expected: ids.len(),
                got: got.len(),
            }
        })?;
        Ok(lines.record(levels))
    }
}

impl FileOperations for Sampler {
    fn open(&self) -> Result<()> {
        debug!("open");
        if self.detached.load(Ordering::SeqCst) {
            return Err(Error::Detached(self.node.clone()));
        }
        Ok(())
    }

    /// Transfers at most one byte and reports how many were written.
    fn read(&self, buf: &mut dyn UserBuffer) -> Result<usize> {
        let value = self.sample()?;
        debug!(value, requested = buf.len(), "read");
        if buf.is_empty() {
            return Ok(0);
        }
        Ok(buf.copy_to_user(&[value])?)
    }

    fn release(&self) {
        debug!("release");
    }
}

/// An attached spice rack.
pub struct SamplingDevice {
    sampler: Arc<Sampler>,
    registry: Arc<CharDevRegistry>,
    devno: DeviceNumber,
    node: String,
}

impl SamplingDevice {
    /// Resolves the lines of `description` and registers the device node.
    ///
    /// If any step fails, everything acquired before it is released again
    /// and no node is left behind.
    pub fn attach(
        registry: Arc<CharDevRegistry>,
        gpio: Arc<dyn GpioBackend>,
        description: &dyn HardwareDescription,
    ) -> Result<Self> {
        debug!(node = %description.path(), "attaching");

        let lines = line::resolve(description, LINE_NAMES)?;
        let node = node_name(NODE_INDEX);
        let sampler = Arc::new(Sampler {
            node: node.clone(),
            lines: Mutex::new(lines),
            gpio,
            detached: AtomicBool::new(false),
        });

        let registration = |step: RegistrationStep, source: RegistryError| {
            error!(%step, error = %source, "registration failed");
            Error::from(RegistrationError { step, source })
        };

        debug!("beginning character device registration");
        let devno = registry
            .alloc_chrdev_region(0, 1, REGION_NAME)
            .map_err(|e| registration(RegistrationStep::ChrdevRegion, e))?;
        debug!(major = devno.major, minor = devno.minor, "device numbers allocated");

        if let Err(e) = registry.class_create(CLASS_NAME) {
            registry.unregister_chrdev_region(devno, 1);
            return Err(registration(RegistrationStep::Class, e));
        }

        if let Err(e) = registry.device_create(CLASS_NAME, devno, &node) {
            registry.class_destroy(CLASS_NAME);
            registry.unregister_chrdev_region(devno, 1);
            return Err(registration(RegistrationStep::Node, e));
        }

        if let Err(e) = registry.cdev_add(devno, 1, sampler.clone()) {
            registry.device_destroy(CLASS_NAME, devno);
            registry.class_destroy(CLASS_NAME);
            registry.unregister_chrdev_region(devno, 1);
            return Err(registration(RegistrationStep::Cdev, e));
        }

        info!(%node, %devno, "spice rack attached");
        Ok(SamplingDevice {
            sampler,
            registry,
            devno,
            node,
        })
    }

    /// Removes the node and gives back the device numbers.
    pub fn detach(self) {
        drop(self);
    }

    pub fn node_name(&self) -> &str {
        &self.node
    }

    pub fn device_number(&self) -> DeviceNumber {
        self.devno
    }

    /// A copy of the lines, including the levels seen by the last read.
    pub fn lines(&self) -> LineSet {
        self.sampler
            .lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Samples the lines without going through a session.
    pub fn sample(&self) -> Result<u8> {
        self.sampler.sample()
    }
}

impl Drop for SamplingDevice {
    fn drop(&mut self) {
        self.registry.cdev_del(self.devno, 1);
        self.registry.device_destroy(CLASS_NAME, self.devno);
        self.registry.class_destroy(CLASS_NAME);
        self.registry.unregister_chrdev_region(self.devno, 1);

        // waits for an in-flight sample, so nothing re-exports after release
        {
            let _lines = self.sampler.lines.lock().unwrap_or_else(|e| e.into_inner());
            self.sampler.detached.store(true, Ordering::SeqCst);
        }
        self.sampler.gpio.release();
        info!(node = %self.node, "spice rack detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_tree::StaticDescription;
    use crate::gpio::{LineId, MemoryGpio};
    use crate::gpio::Level::{High, Low};

    const IDS: [LineId; 3] = [LineId(17), LineId(27), LineId(22)];

    fn rack() -> StaticDescription {
        StaticDescription::new("/fsr")
            .with_gpio("spice1-gpio", 17)
            .with_gpio("spice2-gpio", 27)
            .with_gpio("spice3-gpio", 22)
    }

    fn setup() -> (Arc<CharDevRegistry>, Arc<MemoryGpio>, SamplingDevice) {
        let registry = Arc::new(CharDevRegistry::new());
        let gpio = Arc::new(MemoryGpio::with_lines(&IDS));
        let device = SamplingDevice::attach(registry.clone(), gpio.clone(), &rack()).unwrap();
        (registry, gpio, device)
    }

    fn set(gpio: &MemoryGpio, levels: [Level; 3]) {
        gpio.set_all(&[(IDS[0], levels[0]), (IDS[1], levels[1]), (IDS[2], levels[2])]);
    }

    #[test]
    fn test_read_encodes_lines() {
        let (registry, gpio, _device) = setup();
        let mut file = registry.open("fsr_gpio_0").unwrap();

        for (levels, expected) in [
            ([High, Low, High], 5u8),
            ([Low, Low, Low], 0),
            ([High, High, High], 7),
            ([High, Low, Low], 1),
            ([Low, High, Low], 2),
            ([Low, Low, High], 4),
        ] {
            set(&gpio, levels);
            let mut buf = [0xffu8; 1];
            assert_eq!(file.read(&mut buf).unwrap(), 1);
            assert_eq!(buf[0], expected);
        }
    }

    #[test]
    fn test_read_reports_bytes_written() {
        let (registry, gpio, _device) = setup();
        set(&gpio, [Low, High, High]);

        let mut file = registry.open("fsr_gpio_0").unwrap();
        let mut buf = [0xaau8; 8];
        assert_eq!(file.read(&mut buf).unwrap(), 1);
        assert_eq!(buf, [6, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa]);
    }

    #[test]
    fn test_zero_length_read_still_samples() {
        let (registry, gpio, device) = setup();
        set(&gpio, [High, High, Low]);
        let mut file = registry.open("fsr_gpio_0").unwrap();

        let before = gpio.samples();
        assert_eq!(file.read(&mut []).unwrap(), 0);
        assert_eq!(gpio.samples(), before + 1);
        assert_eq!(device.lines().lines()[1].last_value(), Some(High));
    }

    #[test]
    fn test_attach_registers_node() {
        let (registry, _gpio, device) = setup();
        assert_eq!(device.node_name(), "fsr_gpio_0");
        assert_eq!(registry.nodes(), vec!["fsr_gpio_0".to_string()]);
        assert_eq!(registry.classes(), vec!["fsr_gpio".to_string()]);
        assert_eq!(
            registry.region_name(device.device_number().major).as_deref(),
            Some("fsr_spice_rack")
        );
    }

    #[test]
    fn test_session_fails_after_detach() {
        let (registry, gpio, device) = setup();
        set(&gpio, [High, High, High]);
        let mut file = registry.open("fsr_gpio_0").unwrap();

        device.detach();
        let before = gpio.samples();
        let mut buf = [0u8; 1];
        assert!(matches!(file.read(&mut buf), Err(Error::Detached(node)) if node == "fsr_gpio_0"));
        assert_eq!(buf[0], 0);
        assert_eq!(gpio.samples(), before);
        assert!(registry.nodes().is_empty());
    }

    #[test]
    fn test_sample_failure_is_reported() {
        let registry = Arc::new(CharDevRegistry::new());
        let gpio = Arc::new(MemoryGpio::with_lines(&IDS[..2]));
        let device = SamplingDevice::attach(registry, gpio, &rack()).unwrap();

        assert!(matches!(
            device.sample(),
            Err(Error::Sample(GpioError::UnknownLine { line: LineId(22) }))
        ));
    }
}
