// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::os::unix::fs::symlink;

use tempfile::TempDir;

use super::*;

/// Fake `/sys/bus/pci` with a `devices` directory, returned as (tempdir, devices path).
fn fake_bus() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let devices = dir.path().join("devices");
    fs::create_dir_all(&devices).unwrap();
    fs::create_dir_all(dir.path().join("drivers/xdma")).unwrap();
    fs::create_dir_all(dir.path().join("iommu_groups/5")).unwrap();
    (dir, devices)
}

fn add_function(devices: &Path, slot: &str, vendor: &str, device: &str, class: &str) -> PathBuf {
    let path = devices.join(slot);
    fs::create_dir_all(&path).unwrap();
    fs::write(path.join("vendor"), format!("{vendor}\n")).unwrap();
    fs::write(path.join("device"), format!("{device}\n")).unwrap();
    fs::write(path.join("class"), format!("{class}\n")).unwrap();
    path
}

#[test]
fn test_slot_parsing() {
    let slot: PciSlot = "0000:03:00.0".parse().unwrap();
    assert_eq!(
        slot,
        PciSlot {
            domain: 0,
            bus: 3,
            device: 0,
            function: 0
        }
    );
    assert_eq!(slot.to_string(), "0000:03:00.0");

    let short: PciSlot = "81:1f.7".parse().unwrap();
    assert_eq!(short.to_string(), "0000:81:1f.7");

    assert!("0000:03:00".parse::<PciSlot>().is_err());
    assert!("0000:03:00.8".parse::<PciSlot>().is_err());
    assert!("0000:03:20.0".parse::<PciSlot>().is_err());
    assert!("invalid".parse::<PciSlot>().is_err());
}

#[test]
fn test_slot_filter_wildcards() {
    let slot: PciSlot = "0000:03:00.1".parse().unwrap();

    let exact: SlotFilter = "0000:03:00.1".parse().unwrap();
    assert!(exact.matches(&slot));

    let bus_only: SlotFilter = "03:*.*".parse().unwrap();
    assert_eq!(bus_only.bus, Some(3));
    assert_eq!(bus_only.device, None);
    assert!(bus_only.matches(&slot));

    let other_function: SlotFilter = "03:00.0".parse().unwrap();
    assert!(!other_function.matches(&slot));

    assert!("03:40.0".parse::<SlotFilter>().is_err());
    assert!("03:00.9".parse::<SlotFilter>().is_err());
    assert!("zz:00.0".parse::<SlotFilter>().is_err());
}

#[test]
fn test_id_filter() {
    let id = PciId {
        vendor: 0x10ee,
        device: 0x7021,
        class_code: 0x0580,
    };

    let filter: IdFilter = "10ee:7021".parse().unwrap();
    assert!(filter.matches(&id));

    let vendor_only: IdFilter = "10ee:".parse().unwrap();
    assert_eq!(vendor_only.device, None);
    assert!(vendor_only.matches(&id));

    let with_class: IdFilter = "*:*:0200".parse().unwrap();
    assert!(!with_class.matches(&id));

    assert!("10ee".parse::<IdFilter>().is_err());
    assert!("10ee0:7021".parse::<IdFilter>().is_err());
}

#[test]
fn test_scan_and_lookup() {
    let (_dir, devices) = fake_bus();
    add_function(&devices, "0000:03:00.0", "0x10ee", "0x7021", "0x058000");
    add_function(&devices, "0000:00:1f.3", "0x8086", "0xa348", "0x040300");
    fs::create_dir_all(devices.join("not-a-device")).unwrap();

    let all = PciDevice::scan(&devices).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].slot.to_string(), "0000:00:1f.3");
    assert_eq!(all[1].id.vendor, 0x10ee);
    assert_eq!(all[1].id.class_code, 0x0580);

    let filters = vec![PciFilter {
        slot: None,
        id: Some("10ee:7021".parse().unwrap()),
    }];
    let found = PciDevice::lookup(&devices, &filters).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].slot.to_string(), "0000:03:00.0");
}

#[test]
fn test_driver_and_iommu_group() {
    let (dir, devices) = fake_bus();
    let path = add_function(&devices, "0000:03:00.0", "0x10ee", "0x7021", "0x058000");
    let device = PciDevice::from_slot(&devices, "0000:03:00.0".parse().unwrap()).unwrap();

    assert_eq!(device.driver(), None);
    assert!(matches!(device.iommu_group(), Err(PciError::NoIommuGroup(_))));

    symlink(dir.path().join("drivers/xdma"), path.join("driver")).unwrap();
    symlink(dir.path().join("iommu_groups/5"), path.join("iommu_group")).unwrap();

    assert_eq!(device.driver().as_deref(), Some("xdma"));
    assert_eq!(device.iommu_group().unwrap(), 5);
}

#[test]
fn test_bind_driver_writes_override() {
    let (dir, devices) = fake_bus();
    let path = add_function(&devices, "0000:03:00.0", "0x10ee", "0x7021", "0x058000");
    symlink(dir.path().join("drivers/xdma"), path.join("driver")).unwrap();
    let device = PciDevice::from_slot(&devices, "0000:03:00.0".parse().unwrap()).unwrap();

    device.bind_driver("vfio-pci").unwrap();

    assert_eq!(
        fs::read_to_string(dir.path().join("drivers/xdma/unbind")).unwrap(),
        "0000:03:00.0"
    );
    assert_eq!(
        fs::read_to_string(path.join("driver_override")).unwrap(),
        "vfio-pci"
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("drivers_probe")).unwrap(),
        "0000:03:00.0"
    );
}

#[test]
fn test_regions_from_resource_file() {
    let (_dir, devices) = fake_bus();
    let path = add_function(&devices, "0000:03:00.0", "0x10ee", "0x7021", "0x058000");
    fs::write(
        path.join("resource"),
        "0x00000000fb000000 0x00000000fbffffff 0x0000000000040200\n\
         0x0000000000000000 0x0000000000000000 0x0000000000000000\n\
         0x00000000fc000000 0x00000000fc00ffff 0x0000000000040200\n",
    )
    .unwrap();

    let device = PciDevice::from_slot(&devices, "0000:03:00.0".parse().unwrap()).unwrap();
    let regions = device.regions().unwrap();

    assert_eq!(regions.len(), 2);
    assert_eq!(regions[0].index, 0);
    assert_eq!(regions[0].size(), 0x100_0000);
    assert_eq!(regions[1].index, 2);
    assert_eq!(regions[1].start, 0xfc00_0000);
}

fn write_bar_files(path: &Path, config_bar0: u32) {
    fs::write(
        path.join("resource"),
        "0x00000000fb000000 0x00000000fbffffff 0x0000000000040200\n\
         0x0000000000000000 0x0000000000000000 0x0000000000000000\n",
    )
    .unwrap();
    let mut config = vec![0u8; 256];
    config[0x10..0x14].copy_from_slice(&config_bar0.to_le_bytes());
    fs::write(path.join("config"), config).unwrap();
}

#[test]
fn test_rewrite_cleared_bar() {
    let (_dir, devices) = fake_bus();
    let path = add_function(&devices, "0000:03:00.0", "0x10ee", "0x7021", "0x058000");
    write_bar_files(&path, 0);
    let device = PciDevice::from_slot(&devices, "0000:03:00.0".parse().unwrap()).unwrap();

    assert_eq!(device.read_host_bar(0).unwrap(), 0xfb00_0000);
    assert_eq!(device.read_bar(0).unwrap(), 0);

    assert!(device.rewrite_bar(0).unwrap());
    assert_eq!(device.read_bar(0).unwrap(), 0xfb00_0000);
    assert!(!device.rewrite_bar(0).unwrap());

    // Only the BAR0 register changed.
    let config = fs::read(path.join("config")).unwrap();
    assert_eq!(config.len(), 256);
    assert_eq!(&config[0x10..0x14], &[0x00, 0x00, 0x00, 0xfb]);
    assert!(config[0x14..].iter().all(|&b| b == 0));
}

#[test]
fn test_bar_flags_are_ignored() {
    let (_dir, devices) = fake_bus();
    let path = add_function(&devices, "0000:03:00.0", "0x10ee", "0x7021", "0x058000");
    write_bar_files(&path, 0xfb00_000c);
    let device = PciDevice::from_slot(&devices, "0000:03:00.0".parse().unwrap()).unwrap();

    assert!(!device.rewrite_bar(0).unwrap());
    assert_eq!(device.read_bar(0).unwrap(), 0xfb00_000c);
}

#[test]
fn test_unassigned_bar() {
    let (_dir, devices) = fake_bus();
    let path = add_function(&devices, "0000:03:00.0", "0x10ee", "0x7021", "0x058000");
    write_bar_files(&path, 0);
    let device = PciDevice::from_slot(&devices, "0000:03:00.0".parse().unwrap()).unwrap();

    assert!(matches!(
        device.rewrite_bar(1),
        Err(PciError::InvalidBar { bar: 1, .. })
    ));
    assert!(matches!(
        device.read_host_bar(6),
        Err(PciError::InvalidBar { bar: 6, .. })
    ));
    assert_eq!(device.read_bar(1).unwrap(), 0);
}
