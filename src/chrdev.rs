//! A small character-device subsystem.
//!
//! Devices register the same way they would with the kernel: reserve a range
//! of device numbers, create a class and a named node in it, then bind a set
//! of [`FileOperations`] to the numbers. Clients open nodes by name and get an
//! [`OpenFile`] session back.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    io::Write,
    ops::RangeInclusive,
    sync::{Arc, Mutex, MutexGuard},
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{CopyFault, Error};

/// Majors handed out by dynamic allocation, highest first.
pub const DYNAMIC_MAJORS: RangeInclusive<u32> = 234..=254;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceNumber {
    pub major: u32,
    pub minor: u32,
}

impl DeviceNumber {
    pub fn new(major: u32, minor: u32) -> Self {
        DeviceNumber { major, minor }
    }
}

impl fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no free dynamic major for {0}")]
    NoFreeMajor(String),

    #[error("device numbers {0} are not allocated")]
    RegionNotAllocated(DeviceNumber),

    #[error("class {0} already exists")]
    ClassExists(String),

    #[error("no such class: {0}")]
    NoSuchClass(String),

    #[error("device node {0} already exists")]
    NodeExists(String),

    #[error("operations already bound to {0}")]
    CdevBusy(DeviceNumber),
}

/// Destination of a read.
pub trait UserBuffer {
    /// Number of bytes the caller asked for.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies as much of `data` as fits and returns how much that was.
    fn copy_to_user(&mut self, data: &[u8]) -> Result<usize, CopyFault>;
}

/// A plain byte slice as read destination.
pub struct SliceBuffer<'a>(pub &'a mut [u8]);

impl UserBuffer for SliceBuffer<'_> {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn copy_to_user(&mut self, data: &[u8]) -> Result<usize, CopyFault> {
        let n = data.len().min(self.0.len());
        self.0[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }
}

/// Forwards reads to a writer, e.g. stdout; write errors become faults.
pub struct WriterBuffer<W> {
    writer: W,
    len: usize,
}

impl<W: Write> WriterBuffer<W> {
    pub fn new(writer: W, len: usize) -> Self {
        WriterBuffer { writer, len }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> UserBuffer for WriterBuffer<W> {
    fn len(&self) -> usize {
        self.len
    }

    fn copy_to_user(&mut self, data: &[u8]) -> Result<usize, CopyFault> {
        let n = data.len().min(self.len);
        let fault = CopyFault {
            requested: self.len,
        };
        self.writer.write_all(&data[..n]).map_err(|_| fault)?;
        self.writer.flush().map_err(|_| fault)?;
        Ok(n)
    }
}

/// Operations a device binds to its numbers.
pub trait FileOperations: Send + Sync {
    fn open(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Fills `buf` and returns the number of bytes transferred.
    fn read(&self, buf: &mut dyn UserBuffer) -> Result<usize, Error>;

    fn release(&self) {}
}

/// A client session on a device node. Closed when dropped.
pub struct OpenFile {
    node: String,
    devno: DeviceNumber,
    ops: Arc<dyn FileOperations>,
}

impl OpenFile {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn device_number(&self) -> DeviceNumber {
        self.devno
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.ops.read(&mut SliceBuffer(buf))
    }

    pub fn read_into(&mut self, buf: &mut dyn UserBuffer) -> Result<usize, Error> {
        self.ops.read(buf)
    }

    pub fn close(self) {}
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        self.ops.release();
    }
}

impl fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFile")
            .field("node", &self.node)
            .field("devno", &self.devno)
            .finish()
    }
}

struct Region {
    name: String,
    first_minor: u32,
    count: u32,
}

struct Node {
    class: String,
    devno: DeviceNumber,
}

#[derive(Default)]
struct RegistryState {
    regions: BTreeMap<u32, Region>,
    classes: BTreeSet<String>,
    nodes: BTreeMap<String, Node>,
    cdevs: HashMap<DeviceNumber, Arc<dyn FileOperations>>,
}

impl RegistryState {
    fn region_contains(&self, devno: DeviceNumber) -> bool {
        self.regions.get(&devno.major).map_or(false, |r| {
            devno.minor >= r.first_minor && devno.minor < r.first_minor + r.count
        })
    }
}

pub struct CharDevRegistry {
    dynamic: RangeInclusive<u32>,
    state: Mutex<RegistryState>,
}

impl Default for CharDevRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CharDevRegistry {
    pub fn new() -> Self {
        Self::with_dynamic_majors(DYNAMIC_MAJORS)
    }

    pub fn with_dynamic_majors(dynamic: RangeInclusive<u32>) -> Self {
        CharDevRegistry {
            dynamic,
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserves `count` minors starting at `first_minor` under a free major.
    pub fn alloc_chrdev_region(
        &self,
        first_minor: u32,
        count: u32,
        name: &str,
    ) -> Result<DeviceNumber, RegistryError> {
        let mut state = self.state();
        let major = self
            .dynamic
            .clone()
            .rev()
            .find(|m| !state.regions.contains_key(m))
            .ok_or_else(|| RegistryError::NoFreeMajor(name.to_string()))?;

        state.regions.insert(
            major,
            Region {
                name: name.to_string(),
                first_minor,
                count,
            },
        );
        debug!(name, major, first_minor, count, "allocated device numbers");
        Ok(DeviceNumber::new(major, first_minor))
    }

    pub fn unregister_chrdev_region(&self, first: DeviceNumber, count: u32) {
        let mut state = self.state();
        match state.regions.get(&first.major) {
            Some(r) if r.first_minor == first.minor && r.count == count => {
                debug!(name = %r.name, %first, count, "released device numbers");
                state.regions.remove(&first.major);
            }
            _ => warn!(%first, count, "trying to free unallocated device numbers"),
        }
    }

    pub fn class_create(&self, name: &str) -> Result<(), RegistryError> {
        if !self.state().classes.insert(name.to_string()) {
            return Err(RegistryError::ClassExists(name.to_string()));
        }
        Ok(())
    }

    pub fn class_destroy(&self, name: &str) {
        let mut state = self.state();
        state.classes.remove(name);
        let before = state.nodes.len();
        state.nodes.retain(|_, node| node.class != name);
        if state.nodes.len() != before {
            warn!(class = name, "destroyed class that still had device nodes");
        }
    }

    pub fn device_create(
        &self,
        class: &str,
        devno: DeviceNumber,
        name: &str,
    ) -> Result<(), RegistryError> {
        let mut state = self.state();
        if !state.classes.contains(class) {
            return Err(RegistryError::NoSuchClass(class.to_string()));
        }
        if state.nodes.contains_key(name) {
            return Err(RegistryError::NodeExists(name.to_string()));
        }
        state.nodes.insert(
            name.to_string(),
            Node {
                class: class.to_string(),
                devno,
            },
        );
        Ok(())
    }

    pub fn device_destroy(&self, class: &str, devno: DeviceNumber) {
        self.state()
            .nodes
            .retain(|_, node| !(node.class == class && node.devno == devno));
    }

    /// Binds `ops` to `count` numbers starting at `first`.
    pub fn cdev_add(
        &self,
        first: DeviceNumber,
        count: u32,
        ops: Arc<dyn FileOperations>,
    ) -> Result<(), RegistryError> {
        let mut state = self.state();
        let numbers: Vec<DeviceNumber> = (0..count)
            .map(|i| DeviceNumber::new(first.major, first.minor + i))
            .collect();

        for devno in &numbers {
            if !state.region_contains(*devno) {
                return Err(RegistryError::RegionNotAllocated(*devno));
            }
            if state.cdevs.contains_key(devno) {
                return Err(RegistryError::CdevBusy(*devno));
            }
        }
        for devno in numbers {
            state.cdevs.insert(devno, ops.clone());
        }
        Ok(())
    }

    pub fn cdev_del(&self, first: DeviceNumber, count: u32) {
        let mut state = self.state();
        for i in 0..count {
            state
                .cdevs
                .remove(&DeviceNumber::new(first.major, first.minor + i));
        }
    }

    /// Opens the node called `name`.
    pub fn open(&self, name: &str) -> Result<OpenFile, Error> {
        let (devno, ops) = {
            let state = self.state();
            let node = state
                .nodes
                .get(name)
                .ok_or_else(|| Error::NoSuchNode(name.to_string()))?;
            let ops = state
                .cdevs
                .get(&node.devno)
                .cloned()
                .ok_or_else(|| Error::NoSuchNode(name.to_string()))?;
            (node.devno, ops)
        };

        ops.open()?;
        Ok(OpenFile {
            node: name.to_string(),
            devno,
            ops,
        })
    }

    /// Names of all device nodes, sorted.
    pub fn nodes(&self) -> Vec<String> {
        self.state().nodes.keys().cloned().collect()
    }

    pub fn classes(&self) -> Vec<String> {
        self.state().classes.iter().cloned().collect()
    }

    pub fn region_allocated(&self, major: u32) -> bool {
        self.state().regions.contains_key(&major)
    }

    /// Name the region holding `major` was registered under.
    pub fn region_name(&self, major: u32) -> Option<String> {
        self.state().regions.get(&major).map(|r| r.name.clone())
    }
}
