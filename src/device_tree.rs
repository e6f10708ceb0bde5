//! Hardware description of the spice rack.
//!
//! The rack is described by a device-tree node such as
//!
//! ```text
//! fsr {
//!     compatible = "geoffreyjensen,fsr";
//!     spice1-gpio = <&gpio 17 0>;
//!     spice2-gpio = <&gpio 27 0>;
//!     spice3-gpio = <&gpio 22 0>;
//! };
//! ```
//!
//! and read back through the flattened tree the kernel exposes under
//! `/proc/device-tree`. Every property is a file, every node a directory.
//! GPIO references are turned into global line numbers the same way the
//! kernel does: the phandle picks the controller node, the controller's
//! platform device is looked up in sysfs to learn its `base`, and the offset
//! from the specifier is added to it.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::gpio::LineId;

/// Where platform devices show up, relative to the sysfs mount.
static SYSFS_PREFIXES: [&str; 3] = ["devices", "devices/platform", "devices/platform/soc"];

/// Default `#gpio-cells` when the controller does not say.
const DEFAULT_GPIO_CELLS: usize = 2;

#[derive(Error, Debug)]
pub enum DescriptionError {
    #[error("property {0} not found")]
    MissingProperty(String),

    #[error("property {property} is malformed: {reason}")]
    MalformedProperty { property: String, reason: String },

    #[error("no specifier at index {index} in {property}")]
    NoSuchIndex { property: String, index: usize },

    #[error("no node with phandle {0:#x}")]
    UnknownPhandle(u32),

    #[error("node {0} is not a gpio-controller")]
    NotAController(String),

    #[error("cannot find GPIO chip {0} in sysfs")]
    ChipNotFound(String),

    #[error("offset {offset} is out of range for {chip} ({ngpio} lines)")]
    OffsetOutOfRange { chip: String, offset: u32, ngpio: u32 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A source of named GPIO references for one device.
pub trait HardwareDescription {
    /// Path identifying the described node, used in logs and errors.
    fn path(&self) -> String;

    /// Compatible strings of the node, most specific first.
    fn compatible(&self) -> Vec<String>;

    /// Resolves the `index`-th GPIO of `property` to a global line number.
    fn named_gpio(&self, property: &str, index: usize) -> Result<LineId, DescriptionError>;
}

/// A node in a flattened device tree on disk.
#[derive(Debug, Clone)]
pub struct DeviceTreeNode {
    dt_root: PathBuf,
    node: PathBuf,
    sysfs_root: PathBuf,
}

impl DeviceTreeNode {
    /// Opens `node_path` (relative to `dt_root`, leading `/` allowed).
    pub fn open(
        dt_root: impl AsRef<Path>,
        node_path: impl AsRef<Path>,
        sysfs_root: impl AsRef<Path>,
    ) -> Result<Self, DescriptionError> {
        let relative = node_path
            .as_ref()
            .strip_prefix("/")
            .unwrap_or(node_path.as_ref());
        let node = dt_root.as_ref().join(relative);
        if !node.is_dir() {
            return Err(DescriptionError::Io {
                path: node,
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }

        Ok(DeviceTreeNode {
            dt_root: dt_root.as_ref().to_path_buf(),
            node,
            sysfs_root: sysfs_root.as_ref().to_path_buf(),
        })
    }

    fn read_property(&self, dir: &Path, name: &str) -> Result<Vec<u8>, DescriptionError> {
        let path = dir.join(name);
        fs::read(&path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => DescriptionError::MissingProperty(name.to_string()),
            _ => DescriptionError::Io { path, source },
        })
    }

    /// Finds the node whose `phandle` (or legacy `linux,phandle`) matches.
    fn find_phandle(&self, phandle: u32) -> Result<PathBuf, DescriptionError> {
        let mut stack = vec![self.dt_root.clone()];
        while let Some(dir) = stack.pop() {
            for name in ["phandle", "linux,phandle"] {
                if let Ok(bytes) = fs::read(dir.join(name)) {
                    if parse_cells(&bytes).ok().and_then(|c| c.first().copied()) == Some(phandle) {
                        return Ok(dir);
                    }
                }
            }
            stack.extend(subnodes(&dir)?);
        }
        Err(DescriptionError::UnknownPhandle(phandle))
    }

    /// Returns `(base, ngpio)` of the chip registered for a controller node.
    fn chip_range(&self, controller: &Path) -> Result<(u32, u32), DescriptionError> {
        let device_name = platform_device_name(controller);

        for prefix in SYSFS_PREFIXES.iter() {
            let gpio_dir = self.sysfs_root.join(prefix).join(&device_name).join("gpio");
            if !gpio_dir.is_dir() {
                continue;
            }

            for chip in read_dir_sorted(&gpio_dir)? {
                let file_name = chip.file_name().and_then(|n| n.to_str()).unwrap_or("");
                // check if the file name starts with "gpiochip"
                if !file_name.starts_with("gpiochip") {
                    continue;
                }
                let base = read_uint(&chip.join("base"))?;
                let ngpio = read_uint(&chip.join("ngpio"))?;
                trace!(device = %device_name, base, ngpio, "found gpio chip");
                return Ok((base, ngpio));
            }
        }

        Err(DescriptionError::ChipNotFound(device_name))
    }
}

impl HardwareDescription for DeviceTreeNode {
    fn path(&self) -> String {
        let relative = self.node.strip_prefix(&self.dt_root).unwrap_or(&self.node);
        format!("/{}", relative.display())
    }

    fn compatible(&self) -> Vec<String> {
        match fs::read(self.node.join("compatible")) {
            Ok(bytes) => parse_string_list(&bytes),
            Err(_) => Vec::new(),
        }
    }

    fn named_gpio(&self, property: &str, index: usize) -> Result<LineId, DescriptionError> {
        let malformed = |reason: &str| DescriptionError::MalformedProperty {
            property: property.to_string(),
            reason: reason.to_string(),
        };

        let cells = parse_cells(&self.read_property(&self.node, property)?)
            .map_err(|_| malformed("length is not a multiple of 4"))?;

        // walk the specifiers; each is a phandle followed by #gpio-cells cells
        let mut pos = 0;
        let mut current = 0;
        while pos < cells.len() {
            let phandle = cells[pos];
            let controller = self.find_phandle(phandle)?;
            if !controller.join("gpio-controller").exists() {
                return Err(DescriptionError::NotAController(
                    controller.display().to_string(),
                ));
            }

            let ncells = match fs::read(controller.join("#gpio-cells")) {
                Ok(bytes) => parse_cells(&bytes)
                    .ok()
                    .and_then(|c| c.first().copied())
                    .ok_or_else(|| malformed("controller has a bad #gpio-cells"))?
                    as usize,
                Err(_) => DEFAULT_GPIO_CELLS,
            };
            if ncells == 0 || pos + 1 + ncells > cells.len() {
                return Err(malformed("truncated GPIO specifier"));
            }

            if current == index {
                let offset = cells[pos + 1];
                let (base, ngpio) = self.chip_range(&controller)?;
                let global = base.checked_add(offset).filter(|_| offset < ngpio);
                let Some(global) = global else {
                    return Err(DescriptionError::OffsetOutOfRange {
                        chip: platform_device_name(&controller),
                        offset,
                        ngpio,
                    });
                };
                debug!(property, offset, base, "resolved GPIO");
                return Ok(LineId(global));
            }

            pos += 1 + ncells;
            current += 1;
        }

        Err(DescriptionError::NoSuchIndex {
            property: property.to_string(),
            index,
        })
    }
}

/// A description given directly as property name to line number.
#[derive(Debug, Clone, Default)]
pub struct StaticDescription {
    path: String,
    compatible: Vec<String>,
    gpios: HashMap<String, Vec<u32>>,
}

impl StaticDescription {
    pub fn new(path: impl Into<String>) -> Self {
        StaticDescription {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_compatible(mut self, compatible: impl Into<String>) -> Self {
        self.compatible.push(compatible.into());
        self
    }

    pub fn with_gpio(mut self, property: impl Into<String>, line: u32) -> Self {
        self.gpios.entry(property.into()).or_default().push(line);
        self
    }
}

impl HardwareDescription for StaticDescription {
    fn path(&self) -> String {
        self.path.clone()
    }

    fn compatible(&self) -> Vec<String> {
        self.compatible.clone()
    }

    fn named_gpio(&self, property: &str, index: usize) -> Result<LineId, DescriptionError> {
        let lines = self
            .gpios
            .get(property)
            .ok_or_else(|| DescriptionError::MissingProperty(property.to_string()))?;
        lines
            .get(index)
            .map(|n| LineId(*n))
            .ok_or(DescriptionError::NoSuchIndex {
                property: property.to_string(),
                index,
            })
    }
}

/// Returns every enabled node under `dt_root` that is compatible with `compat`.
pub fn find_compatible(
    dt_root: impl AsRef<Path>,
    sysfs_root: impl AsRef<Path>,
    compat: &str,
) -> Result<Vec<DeviceTreeNode>, DescriptionError> {
    let dt_root = dt_root.as_ref();
    let mut found = Vec::new();
    let mut stack = vec![dt_root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        if let Ok(bytes) = fs::read(dir.join("compatible")) {
            let enabled = match fs::read(dir.join("status")) {
                Ok(status) => parse_string_list(&status)
                    .first()
                    .map_or(true, |s| s == "okay" || s == "ok"),
                Err(_) => true,
            };
            if enabled && parse_string_list(&bytes).iter().any(|c| c == compat) {
                let relative = dir.strip_prefix(dt_root).unwrap_or(&dir).to_path_buf();
                found.push(DeviceTreeNode::open(dt_root, relative, sysfs_root.as_ref())?);
            }
        }
        stack.extend(subnodes(&dir)?);
    }

    found.sort_by(|a, b| a.node.cmp(&b.node));
    Ok(found)
}

/// Maps a node like `gpio@2200000` to its platform device `2200000.gpio`.
fn platform_device_name(node: &Path) -> String {
    let name = node.file_name().and_then(|n| n.to_str()).unwrap_or("");
    match name.split_once('@') {
        Some((base, addr)) => format!("{}.{}", addr, base),
        None => name.to_string(),
    }
}

fn parse_cells(bytes: &[u8]) -> Result<Vec<u32>, ()> {
    if bytes.len() % 4 != 0 {
        return Err(());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn parse_string_list(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .split('\x00')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_uint(path: &Path) -> Result<u32, DescriptionError> {
    let contents = fs::read_to_string(path).map_err(|source| DescriptionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    contents
        .trim()
        .parse::<u32>()
        .map_err(|e| DescriptionError::Io {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, DescriptionError> {
    let entries = fs::read_dir(dir).map_err(|source| DescriptionError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();
    Ok(paths)
}

fn subnodes(dir: &Path) -> Result<Vec<PathBuf>, DescriptionError> {
    Ok(read_dir_sorted(dir)?
        .into_iter()
        .filter(|p| p.is_dir() && !p.is_symlink())
        .collect())
}
