//! Error types for the spice rack driver.

use thiserror::Error;

use crate::chrdev::RegistryError;
use crate::device_tree::DescriptionError;
use crate::gpio::GpioError;

/// A named line could not be resolved against the hardware description.
#[derive(Error, Debug)]
#[error("unable to resolve GPIO {name} in {node}: {source}")]
pub struct LineResolutionError {
    pub name: String,
    pub node: String,
    #[source]
    pub source: DescriptionError,
}

/// The attach step that failed while registering with the I/O subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStep {
    ChrdevRegion,
    Class,
    Node,
    Cdev,
}

impl std::fmt::Display for RegistrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RegistrationStep::ChrdevRegion => "allocating device numbers",
            RegistrationStep::Class => "creating device class",
            RegistrationStep::Node => "creating device node",
            RegistrationStep::Cdev => "binding file operations",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
#[error("registration failed while {step}: {source}")]
pub struct RegistrationError {
    pub step: RegistrationStep,
    #[source]
    pub source: RegistryError,
}

/// The destination buffer of a read could not be written.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("bad address: could not copy to user buffer of {requested} bytes")]
pub struct CopyFault {
    pub requested: usize,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    LineResolution(#[from] LineResolutionError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    CopyFault(#[from] CopyFault),

    #[error("failed to sample lines: {0}")]
    Sample(#[from] GpioError),

    #[error("device {0} is already bound")]
    AlreadyBound(String),

    #[error("device {0} is not bound")]
    NotBound(String),

    #[error("no such device node: {0}")]
    NoSuchNode(String),

    #[error("device {0} has been detached")]
    Detached(String),
}

pub type Result<T> = std::result::Result<T, Error>;
