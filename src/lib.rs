//! Userspace driver for a force-sensor spice rack.
//!
//! Three GPIO lines, named `spice1-gpio` to `spice3-gpio` in the device tree,
//! report whether a jar sits on each sensor. The driver publishes them as the
//! character device `fsr_gpio_0`; every read returns one byte with line `n`
//! in bit `n`.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use fsr_spice_rack::{
//!     chrdev::CharDevRegistry,
//!     device_tree::StaticDescription,
//!     gpio::{Level, LineId, MemoryGpio},
//!     platform::{DriverContext, Platform, SpiceRackDriver, COMPATIBLE},
//! };
//!
//! let gpio = Arc::new(MemoryGpio::with_lines(&[LineId(17), LineId(27), LineId(22)]));
//! gpio.set(LineId(17), Level::High);
//!
//! let platform = Platform::new(DriverContext {
//!     registry: Arc::new(CharDevRegistry::new()),
//!     gpio: gpio.clone(),
//! });
//! platform.register_driver(Arc::new(SpiceRackDriver::new()));
//!
//! let rack = StaticDescription::new("/fsr")
//!     .with_compatible(COMPATIBLE)
//!     .with_gpio("spice1-gpio", 17)
//!     .with_gpio("spice2-gpio", 27)
//!     .with_gpio("spice3-gpio", 22);
//! platform.device_added(&rack).unwrap();
//!
//! let mut file = platform.context().registry.open("fsr_gpio_0").unwrap();
//! let mut buf = [0u8; 1];
//! file.read(&mut buf).unwrap();
//! assert_eq!(buf[0], 1);
//! ```

pub mod chrdev;
pub mod config;
pub mod device;
pub mod device_tree;
pub mod error;
pub mod gpio;
pub mod line;
pub mod platform;
pub mod tracing;

pub use device::SamplingDevice;
pub use error::{Error, Result};
