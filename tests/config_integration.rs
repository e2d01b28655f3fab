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

use std::fs;
use std::path::PathBuf;

use fpga_iomap::config::{Config, ConfigError};
use fpga_iomap::memory::{Allocator, MemoryError};
use fpga_iomap::MemoryManager;
use serde_json::json;
use tempfile::TempDir;

fn add_function(devices: &std::path::Path, slot: &str, vendor: &str, device: &str) {
    let path = devices.join(slot);
    fs::create_dir_all(&path).unwrap();
    fs::write(path.join("vendor"), vendor).unwrap();
    fs::write(path.join("device"), device).unwrap();
    fs::write(path.join("class"), "0x058000").unwrap();
}

fn write_config(dir: &TempDir, sysfs: &std::path::Path) -> PathBuf {
    let config = json!({
        "vfio": { "dev_path": "/tmp/vfio" },
        "pci": { "sysfs_path": sysfs },
        "devices": [
            { "id": "10ee:7021" },
            { "slot": "0000:05:00.0" }
        ],
        "ips": [
            { "name": "dma_0", "depends_on": ["axi_interconnect_0", "pcie_0"] },
            { "name": "pcie_0", "depends_on": ["axi_interconnect_0"] },
            { "name": "axi_interconnect_0" },
            { "name": "hls_dft_0", "depends_on": ["dma_0"] }
        ],
        "memory_blocks": [
            { "ip": "bram_0", "name": "Mem0", "size": 8192 },
            { "ip": "hls_dft_0", "name": "Reg", "size": 256 }
        ]
    });

    let path = dir.path().join("fpga.json");
    fs::write(&path, config.to_string()).unwrap();
    path
}

#[test]
fn test_load_card_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let sysfs = dir.path().join("devices");
    add_function(&sysfs, "0000:03:00.0", "0x10ee", "0x7021");
    add_function(&sysfs, "0000:04:00.0", "0x8086", "0x1533");
    add_function(&sysfs, "0000:05:00.0", "0x1d0f", "0xf000");

    let config = Config::from_file(&write_config(&dir, &sysfs)).unwrap();

    assert_eq!(config.vfio.dev_path, PathBuf::from("/tmp/vfio"));
    assert_eq!(config.vfio.required_modules.len(), 3);

    let devices = config.matching_devices().unwrap();
    let slots: Vec<String> = devices.iter().map(|d| d.slot.to_string()).collect();
    assert_eq!(slots, vec!["0000:03:00.0", "0000:05:00.0"]);

    let order = config.dependency_graph().evaluation_order();
    assert_eq!(
        order,
        vec!["axi_interconnect_0", "pcie_0", "dma_0", "hls_dft_0"]
    );

    let mut mm = MemoryManager::new();
    let spaces = config.register_memory_blocks(&mut mm);
    assert_eq!(spaces.len(), 2);
    assert_eq!(mm.find_address_space("bram_0/Mem0").unwrap(), spaces[0]);
    assert_eq!(mm.address_space(spaces[1]).unwrap().name(), "hls_dft_0/Reg");

    // Registering twice reuses the existing address spaces.
    assert_eq!(config.register_memory_blocks(&mut mm), spaces);

    let mut allocators = config.memory_block_allocators(&mut mm).unwrap();
    assert_eq!(allocators.len(), 2);
    assert_eq!(allocators[0].address_space(), spaces[0]);
    assert_eq!(allocators[0].available(), 8192);
    assert_eq!(allocators[1].available(), 256);

    let block = allocators[1].allocate_block(&mut mm, 0x40).unwrap();
    let t = mm.get_translation(spaces[1], block.address_space()).unwrap();
    assert_eq!(t.size(), 0x40);
    assert!(matches!(
        allocators[1].allocate_block(&mut mm, 0x100),
        Err(MemoryError::OutOfMemory { .. })
    ));
}

#[test]
fn test_dependency_cycle_is_reported() {
    let config = Config::from_json(
        r#"{
            "ips": [
                { "name": "a", "depends_on": ["b"] },
                { "name": "b", "depends_on": ["a"] },
                { "name": "c" }
            ]
        }"#,
    )
    .unwrap();

    let (order, unresolved) = config.dependency_graph().resolve();
    assert_eq!(order, vec!["c"]);
    assert_eq!(unresolved, vec!["a", "b"]);
}

#[test]
fn test_invalid_filters_are_rejected() {
    let err = Config::from_json(r#"{ "devices": [ { "id": "10ee" } ] }"#).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));

    let err = Config::from_json(r#"{ "devices": [ { "slot": "03:40.0" } ] }"#).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::from_file(&dir.path().join("missing.json")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}
