//! Attach the spice rack described in the device tree and print its samples.

use std::{io, path::PathBuf, sync::Arc, thread, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;

use fsr_spice_rack::{
    chrdev::{CharDevRegistry, WriterBuffer},
    config::Config,
    device_tree::{self, HardwareDescription},
    gpio::SysfsGpio,
    platform::{DriverContext, Platform, SpiceRackDriver, COMPATIBLE, DRIVER_NAME},
    tracing::{init_stderr, prelude::*},
};

/// Sample the force sensors of a spice rack
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Device tree root (overrides FSR_DT_ROOT)
    #[arg(long)]
    dt_root: Option<PathBuf>,

    /// Sysfs mount point (overrides FSR_SYSFS_ROOT)
    #[arg(long)]
    sysfs_root: Option<PathBuf>,

    /// Number of samples to take
    #[arg(short = 'n', long, default_value_t = 1)]
    samples: usize,

    /// Delay between samples in milliseconds
    #[arg(short = 'i', long, default_value_t = 500)]
    interval_ms: u64,

    /// Write raw bytes to stdout instead of text
    #[arg(long)]
    raw: bool,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_stderr(args.debug);

    let config = apply_overrides(Config::from_env()?, &args);
    debug!(?config, "configuration");

    let gpio = SysfsGpio::new(&config.sysfs_root).with_export_timeout(config.export_timeout);
    let platform = Platform::new(DriverContext {
        registry: Arc::new(CharDevRegistry::new()),
        gpio: Arc::new(gpio),
    });
    platform.register_driver(Arc::new(SpiceRackDriver::new()));

    let nodes = device_tree::find_compatible(&config.dt_root, &config.sysfs_root, COMPATIBLE)
        .with_context(|| format!("scanning {}", config.dt_root.display()))?;
    let Some(node) = first_rack(nodes) else {
        bail!("no {} node found under {}", COMPATIBLE, config.dt_root.display());
    };
    platform
        .device_added(&node)
        .with_context(|| format!("probing {}", node.path()))?;

    let result = sample(&platform, &args);
    platform.unregister_driver(DRIVER_NAME)?;
    result
}

/// Command-line paths win over the environment.
fn apply_overrides(mut config: Config, args: &Args) -> Config {
    if let Some(root) = &args.dt_root {
        config.dt_root = root.clone();
    }
    if let Some(root) = &args.sysfs_root {
        config.sysfs_root = root.clone();
    }
    config
}

/// Only one rack is supported; any further compatible node is skipped.
fn first_rack<T: HardwareDescription>(nodes: Vec<T>) -> Option<T> {
    let mut nodes = nodes.into_iter();
    let first = nodes.next()?;
    for extra in nodes {
        warn!(node = %extra.path(), using = %first.path(), "ignoring additional spice rack");
    }
    Some(first)
}

fn sample(platform: &Platform, args: &Args) -> Result<()> {
    let node = fsr_spice_rack::device::node_name(fsr_spice_rack::device::NODE_INDEX);
    let mut file = platform.context().registry.open(&node)?;

    for i in 0..args.samples {
        if i > 0 {
            thread::sleep(Duration::from_millis(args.interval_ms));
        }

        if args.raw {
            let mut out = WriterBuffer::new(io::stdout().lock(), 1);
            file.read_into(&mut out)?;
        } else {
            let mut buf = [0u8; 1];
            file.read(&mut buf)?;
            println!("{} ({:03b})", buf[0], buf[0]);
        }
    }

    file.close();
    Ok(())
}
