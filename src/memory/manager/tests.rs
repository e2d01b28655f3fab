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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::*;

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_address_spaces_are_cached_by_name() {
    let mut mm = MemoryManager::new();
    let dma_regs = mm.get_or_create_address_space("DMA Registers");
    let bridge = mm.get_or_create_address_space("PCIe Bridge");

    assert_ne!(dma_regs, bridge);
    assert_eq!(mm.get_or_create_address_space("DMA Registers"), dma_regs);
    assert_eq!(mm.find_address_space("PCIe Bridge").unwrap(), bridge);
    assert_eq!(mm.graph().vertex_count(), 2);
    assert_eq!(
        mm.find_address_space("missing").unwrap_err(),
        MemoryError::AddressSpaceNotFound("missing".to_string())
    );
}

#[test]
fn test_well_known_names() {
    let mut mm = MemoryManager::new();
    let process = mm.process_address_space();
    let block = mm.process_address_space_memory_block("bram_0");

    assert_eq!(mm.address_space(process).unwrap().name(), "process");
    assert_eq!(mm.address_space(block).unwrap().name(), "process/bram_0");
    assert_eq!(
        MemoryManager::slave_address_space_name("hls_dft_0", "Reg"),
        "hls_dft_0/Reg"
    );
}

#[test]
fn test_multi_hop_translation() {
    let mut mm = MemoryManager::new();
    let process = mm.process_address_space();
    let bar0 = mm.get_or_create_address_space("0000:03:00.0/PCI_BAR0");
    let axi = mm.get_or_create_address_space("pcie_0/BAR0");
    let regs = mm.get_or_create_address_space("dma_0/Reg");

    mm.create_mapping(0x7f00_0000_0000, 0, 0x100_0000, "process to vfio", process, bar0)
        .unwrap();
    mm.create_mapping(0, 0x8000_0000, 0x100_0000, "bar to axi", bar0, axi)
        .unwrap();
    mm.create_mapping(0x8001_0000, 0, 0x1000, "axi to regs", axi, regs)
        .unwrap();

    let t = mm.get_translation_from_process(regs).unwrap();
    assert_eq!(t, MemoryTranslation::new(0x7f00_0001_0000, 0, 0x1000));
    assert_eq!(t.local_addr(0x40).unwrap(), 0x7f00_0001_0040);

    assert_eq!(mm.find_path(process, regs).unwrap(), vec![process, bar0, axi, regs]);
}

#[test]
fn test_no_path_is_reported() {
    let mut mm = MemoryManager::new();
    let a = mm.get_or_create_address_space("a");
    let b = mm.get_or_create_address_space("b");

    assert_eq!(
        mm.get_translation(a, b).unwrap_err(),
        MemoryError::NoTranslation { from: a, to: b }
    );
    assert_eq!(mm.get_translation(a, a).unwrap(), MemoryTranslation::identity());
}

#[test]
fn test_disjoint_hop_is_skipped() {
    let mut mm = MemoryManager::new();
    let a = mm.get_or_create_address_space("a");
    let b = mm.get_or_create_address_space("b");
    let c = mm.get_or_create_address_space("c");

    // a -> b lands outside the window of b -> c
    mm.create_mapping(0, 0x10_0000, 0x1000, "dead end", a, b).unwrap();
    mm.create_mapping(0, 0x2000, 0x1000, "b to c", b, c).unwrap();
    assert!(matches!(
        mm.get_translation(a, c),
        Err(MemoryError::NoTranslation { .. })
    ));

    mm.create_mapping(0x4000, 0x0, 0x1000, "usable", a, b).unwrap();
    let t = mm.get_translation(a, c).unwrap();
    assert_eq!(t, MemoryTranslation::new(0x4000, 0x2000, 0x1000));
}

#[test]
fn test_zero_sized_mapping_is_never_traversed() {
    let mut mm = MemoryManager::new();
    let a = mm.get_or_create_address_space("a");
    let b = mm.get_or_create_address_space("b");

    let empty = mm.create_mapping(0x1000, 0, 0, "empty", a, b).unwrap();
    assert_eq!(mm.mapping(empty).unwrap().size(), 0);
    assert_eq!(
        mm.get_translation(a, b).unwrap_err(),
        MemoryError::NoTranslation { from: a, to: b }
    );
}

#[test]
fn test_find_direct_mapping() {
    let mut mm = MemoryManager::new();
    let a = mm.get_or_create_address_space("a");
    let b = mm.get_or_create_address_space("b");
    let c = mm.get_or_create_address_space("c");
    mm.create_mapping(0, 0, 0x10, "a to c", a, c).unwrap();
    let low = mm.create_mapping(0x100, 0, 0x10, "low", a, b).unwrap();
    let high = mm.create_mapping(0x200, 0, 0x10, "high", a, b).unwrap();

    assert_eq!(mm.find_mapping(a, b, |_| true), Some(low));
    assert_eq!(mm.find_mapping(a, b, |m| m.src() == 0x200), Some(high));
    assert_eq!(mm.find_mapping(b, a, |_| true), None);
    assert_eq!(mm.find_mapping(99, a, |_| true), None);
}

#[test]
fn test_remove_address_space_cascades_and_forgets_name() {
    let mut mm = MemoryManager::new();
    let a = mm.get_or_create_address_space("a");
    let b = mm.get_or_create_address_space("b");
    let c = mm.get_or_create_address_space("c");
    mm.create_mapping(0, 0, 0x10, "a to b", a, b).unwrap();
    mm.create_mapping(0, 0, 0x10, "c to b", c, b).unwrap();
    mm.create_mapping(0, 0, 0x10, "a to c", a, c).unwrap();

    mm.remove_address_space(b).unwrap();
    assert_eq!(mm.graph().edge_count(), 1);
    assert_eq!(mm.graph().vertex_edges(c).unwrap().len(), 0);
    assert!(mm.find_address_space("b").is_err());

    let b2 = mm.get_or_create_address_space("b");
    assert_ne!(b2, b);
}

#[test]
fn test_owner_dropped_with_mapping() {
    let mut mm = MemoryManager::new();
    let a = mm.get_or_create_address_space("a");
    let b = mm.get_or_create_address_space("b");

    let dropped = Arc::new(AtomicBool::new(false));
    let mapping = Mapping::new("owned", 0, 0, 0x1000).with_owner(DropFlag(dropped.clone()));
    let id = mm.add_mapping(mapping, a, b).unwrap();

    assert!(mm.mapping(id).unwrap().owner::<DropFlag>().is_some());
    assert!(mm.mapping(id).unwrap().owner::<u32>().is_none());

    drop(mm.remove_mapping(id).unwrap());
    assert!(dropped.load(Ordering::SeqCst));
}

#[test]
fn test_mapping_requires_known_spaces() {
    let mut mm = MemoryManager::new();
    let a = mm.get_or_create_address_space("a");
    assert!(matches!(
        mm.create_mapping(0, 0, 1, "bad", a, 99),
        Err(MemoryError::Graph(_))
    ));
}

#[test]
fn test_global_instance() {
    let mut mm = MemoryManager::global().lock().unwrap();
    let id = mm.get_or_create_address_space("global-test");
    assert_eq!(mm.find_address_space("global-test").unwrap(), id);
}
