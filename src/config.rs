//! Runtime configuration, read from the environment.

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

/// Where the flattened device tree is exposed by the kernel.
static DEFAULT_DT_ROOT: &str = "/proc/device-tree";

static DEFAULT_SYSFS_ROOT: &str = "/sys";

const DEFAULT_EXPORT_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub dt_root: PathBuf,
    pub sysfs_root: PathBuf,
    pub export_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dt_root: PathBuf::from(DEFAULT_DT_ROOT),
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            export_timeout: Duration::from_millis(DEFAULT_EXPORT_TIMEOUT_MS),
        }
    }
}

impl Config {
    /// Reads `FSR_DT_ROOT`, `FSR_SYSFS_ROOT` and `FSR_EXPORT_TIMEOUT_MS`,
    /// falling back to the defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(root) = lookup("FSR_DT_ROOT") {
            config.dt_root = PathBuf::from(root.trim());
        }
        if let Some(root) = lookup("FSR_SYSFS_ROOT") {
            config.sysfs_root = PathBuf::from(root.trim());
        }
        if let Some(ms) = lookup("FSR_EXPORT_TIMEOUT_MS") {
            let ms: u64 = ms
                .trim()
                .parse()
                .with_context(|| format!("FSR_EXPORT_TIMEOUT_MS={} is not a number", ms))?;
            config.export_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }
}
