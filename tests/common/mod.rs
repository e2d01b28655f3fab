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

//! Recording stand-in for the VFIO syscalls.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::ffi::CStr;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use fpga_iomap::kernel::vfio::sys::{
    IrqSet, VfioDeviceInfo, VfioGroupStatus, VfioIommuType1DmaMap, VfioIommuType1DmaUnmap,
    VfioIrqInfo, VfioPciDependentDevice, VfioRegionInfo, VfioSys, VFIO_DEVICE_FLAGS_PCI,
    VFIO_DEVICE_FLAGS_RESET, VFIO_GROUP_FLAGS_CONTAINER_SET, VFIO_GROUP_FLAGS_VIABLE,
    VFIO_IRQ_INFO_EVENTFD, VFIO_REGION_INFO_FLAG_MMAP, VFIO_REGION_INFO_FLAG_READ,
    VFIO_REGION_INFO_FLAG_WRITE, VFIO_TYPE1V2_IOMMU, VFIO_TYPE1_IOMMU,
};
use nix::errno::Errno;

pub const PAGE_SIZE: u64 = 0x1000;
pub const MMAP_BASE: usize = 0x7f00_0000_0000;

#[derive(Debug)]
pub struct MockState {
    pub api_version: i32,
    pub extensions: Vec<u32>,
    pub group_flags: u32,
    pub device_flags: u32,
    pub regions: Vec<(u32, u64)>,
    pub irq_counts: Vec<u32>,
    /// Zero-based index of the eventfd call that fails.
    pub fail_eventfd_at: Option<usize>,
    pub fail_set_irqs: bool,
    pub fail_map_dma: bool,
    pub pci_command: u16,

    pub events: Vec<String>,
    pub open_fds: BTreeSet<RawFd>,
    attached: BTreeSet<RawFd>,
    next_fd: RawFd,
    next_mmap: usize,
    eventfd_calls: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            api_version: 0,
            extensions: vec![VFIO_TYPE1_IOMMU, VFIO_TYPE1V2_IOMMU],
            group_flags: VFIO_GROUP_FLAGS_VIABLE,
            device_flags: VFIO_DEVICE_FLAGS_PCI | VFIO_DEVICE_FLAGS_RESET,
            regions: vec![
                (
                    VFIO_REGION_INFO_FLAG_READ
                        | VFIO_REGION_INFO_FLAG_WRITE
                        | VFIO_REGION_INFO_FLAG_MMAP,
                    0x10000,
                ),
                (VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE, 0x1000),
            ],
            irq_counts: vec![1, 4],
            fail_eventfd_at: None,
            fail_set_irqs: false,
            fail_map_dma: false,
            pci_command: 0,
            events: Vec::new(),
            open_fds: BTreeSet::new(),
            attached: BTreeSet::new(),
            next_fd: 10,
            next_mmap: MMAP_BASE,
            eventfd_calls: 0,
        }
    }
}

impl MockState {
    fn new_fd(&mut self) -> RawFd {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.open_fds.insert(fd);
        fd
    }

    fn record(&mut self, event: String) {
        self.events.push(event);
    }
}

#[derive(Debug, Default)]
pub struct MockVfio {
    state: Mutex<MockState>,
}

impl MockVfio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    pub fn open_fds(&self) -> Vec<RawFd> {
        self.state().open_fds.iter().copied().collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    /// Index of the first event starting with `prefix`.
    pub fn position(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .position(|e| e.starts_with(prefix))
            .unwrap_or_else(|| panic!("no event starting with '{prefix}' in {:?}", self.events()))
    }
}

impl VfioSys for MockVfio {
    fn open(&self, path: &Path) -> Result<RawFd, Errno> {
        let mut state = self.state();
        let fd = state.new_fd();
        state.record(format!("open {} -> {fd}", path.display()));
        Ok(fd)
    }

    fn close(&self, fd: RawFd) -> Result<(), Errno> {
        let mut state = self.state();
        if !state.open_fds.remove(&fd) {
            return Err(Errno::EBADF);
        }
        state.record(format!("close {fd}"));
        Ok(())
    }

    fn page_size(&self) -> u64 {
        PAGE_SIZE
    }

    fn get_api_version(&self, _container: RawFd) -> Result<i32, Errno> {
        Ok(self.state().api_version)
    }

    fn check_extension(&self, _container: RawFd, extension: u32) -> Result<bool, Errno> {
        Ok(self.state().extensions.contains(&extension))
    }

    fn set_iommu(&self, _container: RawFd, iommu_type: u32) -> Result<(), Errno> {
        self.state().record(format!("set_iommu {iommu_type}"));
        Ok(())
    }

    fn iommu_map_dma(&self, _container: RawFd, map: &VfioIommuType1DmaMap) -> Result<(), Errno> {
        let mut state = self.state();
        if state.fail_map_dma {
            return Err(Errno::ENOMEM);
        }
        state.record(format!(
            "map_dma vaddr={:#x} iova={:#x} size={:#x}",
            map.vaddr, map.iova, map.size
        ));
        Ok(())
    }

    fn iommu_unmap_dma(
        &self,
        _container: RawFd,
        unmap: &mut VfioIommuType1DmaUnmap,
    ) -> Result<(), Errno> {
        self.state()
            .record(format!("unmap_dma iova={:#x} size={:#x}", unmap.iova, unmap.size));
        Ok(())
    }

    fn group_get_status(&self, group: RawFd, status: &mut VfioGroupStatus) -> Result<(), Errno> {
        let state = self.state();
        status.flags = state.group_flags;
        if state.attached.contains(&group) {
            status.flags |= VFIO_GROUP_FLAGS_CONTAINER_SET;
        }
        Ok(())
    }

    fn group_set_container(&self, group: RawFd, _container: RawFd) -> Result<(), Errno> {
        let mut state = self.state();
        state.attached.insert(group);
        state.record(format!("set_container {group}"));
        Ok(())
    }

    fn group_unset_container(&self, group: RawFd) -> Result<(), Errno> {
        let mut state = self.state();
        state.attached.remove(&group);
        state.record(format!("unset_container {group}"));
        Ok(())
    }

    fn group_get_device_fd(&self, _group: RawFd, name: &CStr) -> Result<RawFd, Errno> {
        let mut state = self.state();
        let fd = state.new_fd();
        state.record(format!("get_device_fd {} -> {fd}", name.to_string_lossy()));
        Ok(fd)
    }

    fn device_get_info(&self, _device: RawFd, info: &mut VfioDeviceInfo) -> Result<(), Errno> {
        let state = self.state();
        info.flags = state.device_flags;
        info.num_regions = state.regions.len() as u32;
        info.num_irqs = state.irq_counts.len() as u32;
        Ok(())
    }

    fn device_get_region_info(
        &self,
        _device: RawFd,
        region: &mut VfioRegionInfo,
    ) -> Result<(), Errno> {
        let state = self.state();
        let (flags, size) = *state
            .regions
            .get(region.index as usize)
            .ok_or(Errno::EINVAL)?;
        region.flags = flags;
        region.size = size;
        region.offset = u64::from(region.index) << 40;
        Ok(())
    }

    fn device_get_irq_info(&self, _device: RawFd, irq: &mut VfioIrqInfo) -> Result<(), Errno> {
        let state = self.state();
        irq.count = *state
            .irq_counts
            .get(irq.index as usize)
            .ok_or(Errno::EINVAL)?;
        irq.flags = VFIO_IRQ_INFO_EVENTFD;
        Ok(())
    }

    fn device_set_irqs(&self, _device: RawFd, irq_set: &IrqSet) -> Result<(), Errno> {
        let mut state = self.state();
        if state.fail_set_irqs && irq_set.count > 0 {
            return Err(Errno::EINVAL);
        }
        state.record(format!(
            "set_irqs index={} count={}",
            irq_set.index, irq_set.count
        ));
        Ok(())
    }

    fn device_reset(&self, device: RawFd) -> Result<(), Errno> {
        self.state().record(format!("reset {device}"));
        Ok(())
    }

    fn device_get_pci_hot_reset_info(
        &self,
        _device: RawFd,
    ) -> Result<Vec<VfioPciDependentDevice>, Errno> {
        Ok(vec![VfioPciDependentDevice {
            group_id: 7,
            segment: 0,
            bus: 3,
            devfn: 0,
        }])
    }

    fn device_pci_hot_reset(&self, device: RawFd, _group_fds: &[RawFd]) -> Result<(), Errno> {
        self.state().record(format!("hot_reset {device}"));
        Ok(())
    }

    fn mmap(&self, fd: RawFd, offset: u64, len: usize) -> Result<*mut u8, Errno> {
        let mut state = self.state();
        let addr = state.next_mmap;
        state.next_mmap += len.max(PAGE_SIZE as usize);
        state.record(format!("mmap {fd} offset={offset:#x} len={len:#x}"));
        Ok(addr as *mut u8)
    }

    fn munmap(&self, addr: *mut u8, len: usize) -> Result<(), Errno> {
        self.state()
            .record(format!("munmap {:#x} len={len:#x}", addr as usize));
        Ok(())
    }

    fn pread(&self, _fd: RawFd, buf: &mut [u8], _offset: u64) -> Result<usize, Errno> {
        let command = self.state().pci_command.to_le_bytes();
        buf[..2].copy_from_slice(&command);
        Ok(2)
    }

    fn pwrite(&self, _fd: RawFd, buf: &[u8], offset: u64) -> Result<usize, Errno> {
        let mut state = self.state();
        state.pci_command = u16::from_le_bytes([buf[0], buf[1]]);
        state.record(format!("pwrite offset={offset:#x}"));
        Ok(2)
    }

    fn eventfd(&self) -> Result<RawFd, Errno> {
        let mut state = self.state();
        let call = state.eventfd_calls;
        state.eventfd_calls += 1;
        if state.fail_eventfd_at == Some(call) {
            return Err(Errno::EMFILE);
        }
        let fd = state.new_fd();
        state.record(format!("eventfd {fd}"));
        Ok(fd)
    }
}
