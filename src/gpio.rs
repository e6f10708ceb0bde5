use std::{
    collections::HashMap,
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, warn};

/// Location of the legacy GPIO interface relative to the sysfs mount.
static GPIO_CLASS_DIR: &str = "class/gpio";

/// Specifies the level of a GPIO line.
///
/// * `Low` - 0
/// * `High` - 1
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Level {
    Low = 0,
    High = 1,
}

impl From<bool> for Level {
    fn from(value: bool) -> Self {
        if value {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl From<Level> for bool {
    fn from(value: Level) -> Self {
        matches!(value, Level::High)
    }
}

/// Global GPIO number of a resolved line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineId(pub u32);

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpio{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum GpioError {
    #[error("{line}: I/O error on {path}: {source}")]
    Io {
        line: LineId,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{line}: unexpected value {value:?}")]
    UnexpectedValue { line: LineId, value: String },

    #[error("{line}: timed out waiting for export")]
    ExportTimeout { line: LineId },

    #[error("{line}: no such line")]
    UnknownLine { line: LineId },

    #[error("backend returned {got} levels for {expected} lines")]
    ShortRead { expected: usize, got: usize },
}

/// Source of line levels.
///
/// Implementations must be shareable between the sessions of a device.
pub trait GpioBackend: Send + Sync {
    /// Returns the current level of `line`.
    fn get_value(&self, line: LineId) -> Result<Level, GpioError>;

    /// Returns the levels of `lines`, in order.
    ///
    /// The default samples one line after the other. Backends that can take a
    /// snapshot of several lines at once should override this.
    fn get_values(&self, lines: &[LineId]) -> Result<Vec<Level>, GpioError> {
        lines.iter().map(|line| self.get_value(*line)).collect()
    }

    /// Gives back whatever the backend acquired on behalf of the caller.
    fn release(&self) {}
}

/// Reads lines through `/sys/class/gpio`.
///
/// Lines that are not exported yet are exported as inputs on first use, and
/// only those are unexported again by [`GpioBackend::release`].
pub struct SysfsGpio {
    gpio_dir: PathBuf,
    export_timeout: Duration,
    exported: Mutex<Vec<LineId>>,
}

impl SysfsGpio {
    /// Creates a backend rooted at the given sysfs mount, normally `/sys`.
    pub fn new(sysfs_root: impl AsRef<Path>) -> Self {
        SysfsGpio {
            gpio_dir: sysfs_root.as_ref().join(GPIO_CLASS_DIR),
            export_timeout: Duration::from_secs(1),
            exported: Mutex::new(Vec::new()),
        }
    }

    /// Sets how long to wait for the kernel to create an exported line.
    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    fn line_dir(&self, line: LineId) -> PathBuf {
        self.gpio_dir.join(line.to_string())
    }

    fn export_gpio(&self, line: LineId) -> Result<(), GpioError> {
        let value_path = self.line_dir(line).join("value");
        if value_path.exists() {
            return Ok(());
        }

        debug!(%line, "exporting");
        write_file(line, &self.gpio_dir.join("export"), &line.0.to_string())?;

        let start = Instant::now();
        while !value_path.exists() {
            if start.elapsed() >= self.export_timeout {
                return Err(GpioError::ExportTimeout { line });
            }
            thread::sleep(Duration::from_millis(10));
        }

        write_file(line, &self.line_dir(line).join("direction"), "in")?;
        self.exported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line);

        Ok(())
    }

    fn unexport_gpio(&self, line: LineId) -> Result<(), GpioError> {
        if self.line_dir(line).exists() {
            write_file(line, &self.gpio_dir.join("unexport"), &line.0.to_string())?;
        }
        Ok(())
    }

    fn read_value(&self, line: LineId) -> Result<Level, GpioError> {
        let path = self.line_dir(line).join("value");
        let value = fs::read_to_string(&path).map_err(|source| GpioError::Io {
            line,
            path: path.clone(),
            source,
        })?;

        match value.trim() {
            "0" => Ok(Level::Low),
            "1" => Ok(Level::High),
            other => Err(GpioError::UnexpectedValue {
                line,
                value: other.to_string(),
            }),
        }
    }
}

impl GpioBackend for SysfsGpio {
    fn get_value(&self, line: LineId) -> Result<Level, GpioError> {
        self.export_gpio(line)?;
        self.read_value(line)
    }

    fn release(&self) {
        let exported: Vec<LineId> = self
            .exported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        for line in exported {
            debug!(%line, "unexporting");
            if let Err(e) = self.unexport_gpio(line) {
                warn!(%line, error = %e, "failed to unexport");
            }
        }
    }
}

fn write_file(line: LineId, path: &Path, contents: &str) -> Result<(), GpioError> {
    let io_err = |source| GpioError::Io {
        line,
        path: path.to_path_buf(),
        source,
    };

    let mut f = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(io_err)?;
    f.write_all(contents.as_bytes()).map_err(io_err)
}

/// In-memory lines, for simulation and tests.
///
/// Every call to [`GpioBackend::get_values`] reads all requested lines under
/// one lock, and counts as a single sample.
#[derive(Default)]
pub struct MemoryGpio {
    levels: Mutex<HashMap<LineId, Level>>,
    samples: AtomicUsize,
}

impl MemoryGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates lines with the given ids, all low.
    pub fn with_lines(lines: &[LineId]) -> Self {
        let gpio = Self::new();
        for line in lines {
            gpio.set(*line, Level::Low);
        }
        gpio
    }

    pub fn set(&self, line: LineId, level: Level) {
        self.levels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(line, level);
    }

    /// Sets several lines at once, so no reader sees a mix of old and new.
    pub fn set_all(&self, levels: &[(LineId, Level)]) {
        let mut map = self.levels.lock().unwrap_or_else(|e| e.into_inner());
        for (line, level) in levels {
            map.insert(*line, *level);
        }
    }

    /// Number of samples taken so far.
    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

impl GpioBackend for MemoryGpio {
    fn get_value(&self, line: LineId) -> Result<Level, GpioError> {
        self.get_values(&[line]).map(|levels| levels[0])
    }

    fn get_values(&self, lines: &[LineId]) -> Result<Vec<Level>, GpioError> {
        let map = self.levels.lock().unwrap_or_else(|e| e.into_inner());
        self.samples.fetch_add(1, Ordering::SeqCst);
        lines
            .iter()
            .map(|line| {
                map.get(line)
                    .copied()
                    .ok_or(GpioError::UnknownLine { line: *line })
            })
            .collect()
    }
}
