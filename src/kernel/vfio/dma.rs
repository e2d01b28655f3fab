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

//! Glue between the kernel mappings and the memory graph.
//!
//! A graph edge is created only after the kernel mapping it describes exists,
//! and removed before that mapping is released.

use tracing::{debug, error, warn};

use super::container::VfioContainer;
use super::device::VfioDevice;
use super::error::Result;
use super::sys::region_name;
use crate::memory::{AddressSpaceId, MappingId, MemoryError, MemoryManager};

/// Address space name of region `index` of `device`, e.g. `0000:03:00.0/PCI_BAR0`.
pub fn region_address_space_name(device: &VfioDevice, index: usize) -> String {
    MemoryManager::slave_address_space_name(device.name(), &region_name(device.is_pci(), index))
}

/// mmap region `index` and record `process -> <device>/<region>`.
///
/// Mapping a region twice returns the edge recorded the first time.
pub fn map_region_into(
    mm: &mut MemoryManager,
    device: &mut VfioDevice,
    index: usize,
) -> Result<MappingId> {
    let size = device.region_size(index)?;
    let addr = device.region_map(index)? as u64;

    let process = mm.process_address_space();
    let name = region_address_space_name(device, index);
    let region = mm.get_or_create_address_space(&name);

    if let Some(existing) = mm.find_mapping(process, region, |m| m.src() == addr) {
        debug!(region = %name, addr, mapping = existing, "region already registered");
        return Ok(existing);
    }

    let mapping = mm.create_mapping(addr, 0, size, "vfio-region", process, region)?;
    debug!(region = %name, addr, size, mapping, "registered region mapping");
    Ok(mapping)
}

/// Make memory block `block` reachable from the device side.
///
/// The block must already be reachable from the process address space and
/// at least `size` bytes long. Its process address is mapped into the IOMMU
/// and `iommu_space -> block` is recorded at the IOVA the container handed out.
pub fn map_memory_block(
    mm: &mut MemoryManager,
    container: &mut VfioContainer,
    block: AddressSpaceId,
    size: u64,
    iommu_space: AddressSpaceId,
) -> Result<(u64, MappingId)> {
    mm.address_space(iommu_space)?;

    let from_process = mm.get_translation_from_process(block)?;
    let vaddr = from_process.local_addr(0)?;
    if size > from_process.size() {
        return Err(MemoryError::OutOfWindow {
            addr: from_process.dst().saturating_add(from_process.size()),
        }
        .into());
    }

    let iova = container.memory_map(vaddr, None, size)?;

    match mm.create_mapping(iova, 0, size, "vfio-d2h", iommu_space, block) {
        Ok(mapping) => {
            debug!(block, vaddr, iova, size, mapping, "mapped memory block for DMA");
            Ok((iova, mapping))
        }
        Err(e) => {
            if let Err(unmap) = container.memory_unmap(iova, size) {
                error!(iova, %unmap, "failed to roll back DMA mapping");
            }
            Err(e.into())
        }
    }
}

/// Drop the graph edge of a DMA mapping, then release the IOMMU mapping.
pub fn unmap_memory_block(
    mm: &mut MemoryManager,
    container: &mut VfioContainer,
    mapping: MappingId,
) -> Result<()> {
    let removed = mm.remove_mapping(mapping)?;

    if let Err(e) = container.memory_unmap(removed.src(), removed.size()) {
        warn!(mapping, iova = removed.src(), "graph edge removed but IOMMU unmap failed");
        return Err(e);
    }

    debug!(mapping, iova = removed.src(), size = removed.size(), "unmapped memory block");
    Ok(())
}
