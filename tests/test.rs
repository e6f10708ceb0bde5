use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use fsr_spice_rack::{
    chrdev::{CharDevRegistry, FileOperations, UserBuffer},
    device_tree::{DescriptionError, DeviceTreeNode, StaticDescription},
    error::{CopyFault, Error, RegistrationStep},
    gpio::{Level, LineId, MemoryGpio, SysfsGpio},
    SamplingDevice,
};

const IDS: [LineId; 3] = [LineId(529), LineId(539), LineId(534)];

fn cells(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

fn write_node(root: &Path, path: &str, props: &[(&str, Vec<u8>)]) {
    let dir = root.join(path);
    fs::create_dir_all(&dir).unwrap();
    for (name, value) in props {
        fs::write(dir.join(name), value).unwrap();
    }
}

/// Builds a device tree with a controller at base 512 and a rack node using
/// offsets 17, 27 and 22. `spice3` can be left out.
fn rack_tree(dt: &Path, sysfs: &Path, with_spice3: bool) {
    write_node(
        dt,
        "soc/gpio@fe200000",
        &[
            ("phandle", cells(&[0x1a])),
            ("gpio-controller", Vec::new()),
            ("#gpio-cells", cells(&[2])),
        ],
    );

    let mut props = vec![
        ("compatible", b"geoffreyjensen,fsr\0".to_vec()),
        ("spice1-gpio", cells(&[0x1a, 17, 0])),
        ("spice2-gpio", cells(&[0x1a, 27, 0])),
    ];
    if with_spice3 {
        props.push(("spice3-gpio", cells(&[0x1a, 22, 0])));
    }
    write_node(dt, "fsr", &props);

    let chip = sysfs.join("devices/platform/soc/fe200000.gpio/gpio/gpiochip512");
    fs::create_dir_all(&chip).unwrap();
    fs::write(chip.join("base"), "512\n").unwrap();
    fs::write(chip.join("ngpio"), "58\n").unwrap();

    let class = sysfs.join("class/gpio");
    fs::create_dir_all(&class).unwrap();
    fs::write(class.join("export"), "").unwrap();
    fs::write(class.join("unexport"), "").unwrap();
}

fn set_sysfs_lines(sysfs: &Path, levels: [u8; 3]) {
    for (id, level) in IDS.iter().zip(levels) {
        let dir = sysfs.join(format!("class/gpio/{}", id));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("direction"), "in\n").unwrap();
        fs::write(dir.join("value"), format!("{}\n", level)).unwrap();
    }
}

fn static_rack() -> StaticDescription {
    StaticDescription::new("/fsr")
        .with_gpio("spice1-gpio", IDS[0].0)
        .with_gpio("spice2-gpio", IDS[1].0)
        .with_gpio("spice3-gpio", IDS[2].0)
}

/// Operations that never get read, only used to occupy a device number.
struct IdleOps;

impl FileOperations for IdleOps {
    fn read(&self, _buf: &mut dyn UserBuffer) -> Result<usize, Error> {
        Ok(0)
    }
}

struct FaultyBuffer;

impl UserBuffer for FaultyBuffer {
    fn len(&self) -> usize {
        1
    }

    fn copy_to_user(&mut self, _data: &[u8]) -> Result<usize, CopyFault> {
        Err(CopyFault { requested: 1 })
    }
}

#[test]
fn test_read_from_device_tree_and_sysfs() {
    let dt = tempfile::tempdir().unwrap();
    let sysfs = tempfile::tempdir().unwrap();
    rack_tree(dt.path(), sysfs.path(), true);

    let node = DeviceTreeNode::open(dt.path(), "/fsr", sysfs.path()).unwrap();
    let registry = Arc::new(CharDevRegistry::new());
    let gpio = Arc::new(SysfsGpio::new(sysfs.path()));
    let device = SamplingDevice::attach(registry.clone(), gpio, &node).unwrap();
    assert_eq!(device.lines().ids(), IDS);

    let mut file = registry.open("fsr_gpio_0").unwrap();
    for (levels, expected) in [([1, 0, 1], 5u8), ([0, 0, 0], 0), ([1, 1, 1], 7)] {
        set_sysfs_lines(sysfs.path(), levels);
        let mut buf = [0u8; 1];
        assert_eq!(file.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], expected);
    }
    file.close();

    device.detach();
    assert!(registry.nodes().is_empty());
}

#[test]
fn test_attach_detach_releases_everything() {
    let registry = Arc::new(CharDevRegistry::new());
    let gpio = Arc::new(MemoryGpio::with_lines(&IDS));

    let device = SamplingDevice::attach(registry.clone(), gpio.clone(), &static_rack()).unwrap();
    let first = device.device_number();
    device.detach();

    assert!(registry.nodes().is_empty());
    assert!(registry.classes().is_empty());
    assert!(!registry.region_allocated(first.major));
    assert!(matches!(registry.open("fsr_gpio_0"), Err(Error::NoSuchNode(_))));

    // a second attach gets a usable range again
    let device = SamplingDevice::attach(registry.clone(), gpio, &static_rack()).unwrap();
    assert_eq!(device.device_number(), first);
    let mut file = registry.open("fsr_gpio_0").unwrap();
    let mut buf = [0xffu8; 1];
    assert_eq!(file.read(&mut buf).unwrap(), 1);
    assert_eq!(buf[0], 0);
}

#[test]
fn test_unresolvable_third_line_registers_nothing() {
    let dt = tempfile::tempdir().unwrap();
    let sysfs = tempfile::tempdir().unwrap();
    rack_tree(dt.path(), sysfs.path(), false);

    let node = DeviceTreeNode::open(dt.path(), "/fsr", sysfs.path()).unwrap();
    let registry = Arc::new(CharDevRegistry::new());
    let gpio = Arc::new(SysfsGpio::new(sysfs.path()));

    match SamplingDevice::attach(registry.clone(), gpio, &node) {
        Err(Error::LineResolution(e)) => {
            assert_eq!(e.name, "spice3-gpio");
            assert_eq!(e.node, "/fsr");
            assert!(matches!(e.source, DescriptionError::MissingProperty(_)));
        }
        Err(e) => panic!("Expected LineResolution, got {:?}", e),
        Ok(_) => panic!("Expected LineResolution, got a device"),
    }

    assert!(registry.nodes().is_empty());
    assert!(registry.classes().is_empty());
    assert!(!registry.region_allocated(254));
}

#[test]
fn test_registration_failures_roll_back() {
    let gpio = Arc::new(MemoryGpio::with_lines(&IDS));

    // no device numbers left
    #[allow(clippy::reversed_empty_ranges)]
    let registry = Arc::new(CharDevRegistry::with_dynamic_majors(1..=0));
    match SamplingDevice::attach(registry.clone(), gpio.clone(), &static_rack()) {
        Err(Error::Registration(e)) => assert_eq!(e.step, RegistrationStep::ChrdevRegion),
        _ => panic!("Expected Registration error"),
    }
    assert!(registry.nodes().is_empty());

    // class taken by someone else
    let registry = Arc::new(CharDevRegistry::new());
    registry.class_create("fsr_gpio").unwrap();
    match SamplingDevice::attach(registry.clone(), gpio.clone(), &static_rack()) {
        Err(Error::Registration(e)) => assert_eq!(e.step, RegistrationStep::Class),
        _ => panic!("Expected Registration error"),
    }
    assert!(!registry.region_allocated(254));

    // node name taken in another class
    let registry = Arc::new(CharDevRegistry::new());
    let other = registry.alloc_chrdev_region(0, 1, "other").unwrap();
    registry.class_create("other").unwrap();
    registry.device_create("other", other, "fsr_gpio_0").unwrap();
    match SamplingDevice::attach(registry.clone(), gpio, &static_rack()) {
        Err(Error::Registration(e)) => assert_eq!(e.step, RegistrationStep::Node),
        _ => panic!("Expected Registration error"),
    }
    assert_eq!(registry.classes(), vec!["other".to_string()]);
    assert!(registry.region_allocated(other.major));
    assert!(!registry.region_allocated(other.major - 1));
}

#[test]
fn test_cdev_failure_rolls_back_node_class_and_region() {
    let gpio = Arc::new(MemoryGpio::with_lines(&IDS));
    let registry = Arc::new(CharDevRegistry::with_dynamic_majors(254..=254));

    // leave operations bound to 254:0 after its region was given back
    let stale = registry.alloc_chrdev_region(0, 1, "stale").unwrap();
    registry.cdev_add(stale, 1, Arc::new(IdleOps)).unwrap();
    registry.unregister_chrdev_region(stale, 1);

    match SamplingDevice::attach(registry.clone(), gpio, &static_rack()) {
        Err(Error::Registration(e)) => assert_eq!(e.step, RegistrationStep::Cdev),
        _ => panic!("Expected Registration error"),
    }
    assert!(registry.nodes().is_empty());
    assert!(registry.classes().is_empty());
    assert!(!registry.region_allocated(254));
}

#[test]
fn test_stale_session_after_detach() {
    let dt = tempfile::tempdir().unwrap();
    let sysfs = tempfile::tempdir().unwrap();
    rack_tree(dt.path(), sysfs.path(), true);
    set_sysfs_lines(sysfs.path(), [1, 1, 1]);

    let node = DeviceTreeNode::open(dt.path(), "/fsr", sysfs.path()).unwrap();
    let registry = Arc::new(CharDevRegistry::new());
    let gpio = Arc::new(SysfsGpio::new(sysfs.path()));
    let device = SamplingDevice::attach(registry.clone(), gpio, &node).unwrap();

    let mut file = registry.open("fsr_gpio_0").unwrap();
    device.detach();
    assert!(registry.nodes().is_empty());

    // the old session neither samples nor exports anything again
    fs::remove_dir_all(sysfs.path().join("class/gpio/gpio529")).unwrap();
    let mut buf = [0u8; 1];
    assert!(matches!(file.read(&mut buf), Err(Error::Detached(_))));
    assert_eq!(buf[0], 0);
    let export = fs::read_to_string(sysfs.path().join("class/gpio/export")).unwrap();
    assert_eq!(export, "");
}

#[test]
fn test_concurrent_sessions_see_whole_snapshots() {
    let registry = Arc::new(CharDevRegistry::new());
    let gpio = Arc::new(MemoryGpio::with_lines(&IDS));
    let _device = SamplingDevice::attach(registry.clone(), gpio.clone(), &static_rack()).unwrap();

    let a = registry.open("fsr_gpio_0").unwrap();
    let b = registry.open("fsr_gpio_0").unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let gpio = gpio.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut level = Level::Low;
            while !done.load(Ordering::SeqCst) {
                level = if level == Level::Low { Level::High } else { Level::Low };
                gpio.set_all(&[(IDS[0], level), (IDS[1], level), (IDS[2], level)]);
            }
        })
    };

    let readers: Vec<_> = [a, b]
        .into_iter()
        .map(|mut file| {
            thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..500 {
                    let mut buf = [0u8; 1];
                    assert_eq!(file.read(&mut buf).unwrap(), 1);
                    seen.push(buf[0]);
                }
                seen
            })
        })
        .collect();

    let mut values = Vec::new();
    for reader in readers {
        values.extend(reader.join().unwrap());
    }
    done.store(true, Ordering::SeqCst);
    writer.join().unwrap();

    let torn: Vec<u8> = values.into_iter().filter(|v| *v != 0 && *v != 7).collect();
    assert!(torn.is_empty(), "inconsistent samples: {:?}", torn);
}

#[test]
fn test_copy_fault_is_contained() {
    let registry = Arc::new(CharDevRegistry::new());
    let gpio = Arc::new(MemoryGpio::with_lines(&IDS));
    gpio.set(IDS[2], Level::High);
    let _device = SamplingDevice::attach(registry.clone(), gpio, &static_rack()).unwrap();

    let mut file = registry.open("fsr_gpio_0").unwrap();
    assert!(matches!(
        file.read_into(&mut FaultyBuffer),
        Err(Error::CopyFault(CopyFault { requested: 1 }))
    ));

    // the device keeps working for the next read
    let mut buf = [0u8; 1];
    assert_eq!(file.read(&mut buf).unwrap(), 1);
    assert_eq!(buf[0], 4);
}

#[test]
fn test_zero_length_read() {
    let registry = Arc::new(CharDevRegistry::new());
    let gpio = Arc::new(MemoryGpio::with_lines(&IDS));
    let _device = SamplingDevice::attach(registry.clone(), gpio.clone(), &static_rack()).unwrap();

    let mut file = registry.open("fsr_gpio_0").unwrap();
    let before = gpio.samples();
    assert_eq!(file.read(&mut []).unwrap(), 0);
    assert_eq!(gpio.samples(), before + 1);
}
