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

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use nix::errno::Errno;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info, warn};

use super::error::{syscall, Result, VfioError};
use super::sys::{
    irq_name, region_name, IrqSet, VfioDeviceInfo, VfioIrqInfo, VfioRegionInfo, VfioSys,
    PCI_COMMAND, PCI_COMMAND_MASTER, PCI_COMMAND_MEMORY, VFIO_DEVICE_FLAGS_PCI,
    VFIO_DEVICE_FLAGS_RESET, VFIO_PCI_CONFIG_REGION_INDEX, VFIO_PCI_MSI_IRQ_INDEX,
    VFIO_PCI_OFFSET_SHIFT, VFIO_REGION_INFO_FLAG_MMAP,
};

/// Number of MSI vectors tracked when scanning `/proc/interrupts`.
pub const PCI_MSI_MAX_VECTORS: usize = 32;

const PROC_INTERRUPTS: &str = "/proc/interrupts";

/// `/proc/interrupts` line of a vfio-pci MSI vector, e.g.
/// ` 132:   0   0  IR-PCI-MSI 1572864-edge  vfio-msi[0](0000:03:00.0)`
static VFIO_MSI_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+):.*\bvfio-msi\[(\d+)\]\(([^)]+)\)\s*$").expect("Invalid vfio-msi regex")
});

struct RegionMapping {
    addr: *mut u8,
    len: usize,
}

/// A device file descriptor obtained from a VFIO group.
///
/// Region and IRQ descriptors are queried once when the device is opened.
/// Dropping the device unmaps every mapped region, clears MSI routing,
/// resets the device and closes its descriptor, in that order.
pub struct VfioDevice {
    sys: Arc<dyn VfioSys>,
    name: String,
    fd: RawFd,
    group_fd: RawFd,
    info: VfioDeviceInfo,
    regions: Vec<VfioRegionInfo>,
    irqs: Vec<VfioIrqInfo>,
    mappings: Vec<Option<RegionMapping>>,
    msi_eventfds: Vec<RawFd>,
}

// SAFETY: the raw pointers only describe mappings owned by this device; they
// are never dereferenced here and are released in Drop.
unsafe impl Send for VfioDevice {}

impl std::fmt::Debug for VfioDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfioDevice")
            .field("name", &self.name)
            .field("fd", &self.fd)
            .field("info", &self.info)
            .field("mapped_regions", &self.mappings.iter().filter(|m| m.is_some()).count())
            .field("msi_eventfds", &self.msi_eventfds)
            .finish()
    }
}

impl VfioDevice {
    pub(crate) fn open(sys: Arc<dyn VfioSys>, name: &str, group_fd: RawFd) -> Result<Self> {
        let cname = CString::new(name).map_err(|_| VfioError::Syscall {
            op: "VFIO_GROUP_GET_DEVICE_FD",
            target: name.to_string(),
            errno: Errno::EINVAL,
        })?;

        let fd = sys
            .group_get_device_fd(group_fd, &cname)
            .map_err(syscall("VFIO_GROUP_GET_DEVICE_FD", name))?;

        let (info, regions, irqs) = match Self::query(sys.as_ref(), fd, name) {
            Ok(tables) => tables,
            Err(e) => {
                if let Err(errno) = sys.close(fd) {
                    error!(device = name, fd, %errno, "failed to close device after query error");
                }
                return Err(e);
            }
        };

        debug!(
            device = name,
            fd,
            flags = info.flags,
            regions = regions.len(),
            irqs = irqs.len(),
            "opened VFIO device"
        );

        let mappings = regions.iter().map(|_| None).collect();

        Ok(Self {
            sys,
            name: name.to_string(),
            fd,
            group_fd,
            info,
            regions,
            irqs,
            mappings,
            msi_eventfds: Vec::new(),
        })
    }

    fn query(
        sys: &dyn VfioSys,
        fd: RawFd,
        name: &str,
    ) -> Result<(VfioDeviceInfo, Vec<VfioRegionInfo>, Vec<VfioIrqInfo>)> {
        let mut info = VfioDeviceInfo::new();
        sys.device_get_info(fd, &mut info)
            .map_err(syscall("VFIO_DEVICE_GET_INFO", name))?;

        // Optional regions past the config space (VGA) fail on most devices.
        let num_regions = if info.flags & VFIO_DEVICE_FLAGS_PCI != 0 {
            info.num_regions.min(VFIO_PCI_CONFIG_REGION_INDEX as u32 + 1)
        } else {
            info.num_regions
        };

        let mut regions = Vec::with_capacity(num_regions as usize);
        for index in 0..num_regions {
            let mut region = VfioRegionInfo::new(index);
            sys.device_get_region_info(fd, &mut region)
                .map_err(syscall("VFIO_DEVICE_GET_REGION_INFO", name))?;
            regions.push(region);
        }

        let mut irqs = Vec::with_capacity(info.num_irqs as usize);
        for index in 0..info.num_irqs {
            let mut irq = VfioIrqInfo::new(index);
            sys.device_get_irq_info(fd, &mut irq)
                .map_err(syscall("VFIO_DEVICE_GET_IRQ_INFO", name))?;
            irqs.push(irq);
        }

        Ok((info, regions, irqs))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn info(&self) -> &VfioDeviceInfo {
        &self.info
    }

    pub fn is_pci(&self) -> bool {
        self.info.flags & VFIO_DEVICE_FLAGS_PCI != 0
    }

    pub fn regions(&self) -> &[VfioRegionInfo] {
        &self.regions
    }

    pub fn irqs(&self) -> &[VfioIrqInfo] {
        &self.irqs
    }

    pub fn region(&self, index: usize) -> Result<&VfioRegionInfo> {
        self.regions.get(index).ok_or(VfioError::RegionOutOfRange {
            index,
            count: self.regions.len(),
        })
    }

    pub fn region_size(&self, index: usize) -> Result<u64> {
        Ok(self.region(index)?.size)
    }

    /// Number of vectors of IRQ `index`, zero if the device has no such IRQ.
    pub fn irq_count(&self, index: usize) -> u32 {
        self.irqs.get(index).map_or(0, |irq| irq.count)
    }

    /// Address of region `index` in process memory, if it is mapped.
    pub fn mapped_region(&self, index: usize) -> Option<*mut u8> {
        self.mappings
            .get(index)
            .and_then(|m| m.as_ref())
            .map(|m| m.addr)
    }

    /// Reset the device if it supports `VFIO_DEVICE_RESET`. Returns whether a
    /// reset was issued.
    pub fn reset(&self) -> Result<bool> {
        if self.info.flags & VFIO_DEVICE_FLAGS_RESET == 0 {
            return Ok(false);
        }

        self.sys
            .device_reset(self.fd)
            .map_err(syscall("VFIO_DEVICE_RESET", &self.name))?;
        debug!(device = %self.name, "device reset");
        Ok(true)
    }

    /// Map region `index` into process memory. Mapping an already mapped
    /// region returns the existing address.
    pub fn region_map(&mut self, index: usize) -> Result<*mut u8> {
        let region = *self.region(index)?;

        if let Some(addr) = self.mapped_region(index) {
            return Ok(addr);
        }

        if region.flags & VFIO_REGION_INFO_FLAG_MMAP == 0 {
            return Err(VfioError::RegionNotMappable {
                device: self.name.clone(),
                index,
            });
        }

        let len = region.size as usize;
        let addr = self
            .sys
            .mmap(self.fd, region.offset, len)
            .map_err(syscall("mmap", format!("{}/{}", self.name, region_name(self.is_pci(), index))))?;

        self.mappings[index] = Some(RegionMapping { addr, len });

        debug!(
            device = %self.name,
            region = %region_name(self.is_pci(), index),
            addr = ?addr,
            size = region.size,
            "mapped region"
        );
        Ok(addr)
    }

    /// Unmap region `index`. Returns false if it was not mapped.
    pub fn region_unmap(&mut self, index: usize) -> Result<bool> {
        self.region(index)?;

        let Some(mapping) = self.mappings[index].take() else {
            return Ok(false);
        };

        if let Err(errno) = self.sys.munmap(mapping.addr, mapping.len) {
            self.mappings[index] = Some(mapping);
            return Err(VfioError::Syscall {
                op: "munmap",
                target: format!("{}/{}", self.name, region_name(self.is_pci(), index)),
                errno,
            });
        }

        debug!(device = %self.name, region = index, "unmapped region");
        Ok(true)
    }

    fn require_pci(&self) -> Result<()> {
        if self.is_pci() {
            Ok(())
        } else {
            Err(VfioError::NotPciDevice(self.name.clone()))
        }
    }

    fn config_offset(&self, register: u64) -> u64 {
        let base = self
            .regions
            .get(VFIO_PCI_CONFIG_REGION_INDEX)
            .map_or((VFIO_PCI_CONFIG_REGION_INDEX as u64) << VFIO_PCI_OFFSET_SHIFT, |r| {
                r.offset
            });
        base + register
    }

    /// Enable memory space decoding and bus mastering.
    pub fn pci_enable(&self) -> Result<()> {
        self.require_pci()?;

        let offset = self.config_offset(PCI_COMMAND);
        let mut command = [0u8; 2];
        self.sys
            .pread(self.fd, &mut command, offset)
            .map_err(syscall("pread PCI_COMMAND", &self.name))?;

        let value = u16::from_le_bytes(command) | PCI_COMMAND_MEMORY | PCI_COMMAND_MASTER;
        self.sys
            .pwrite(self.fd, &value.to_le_bytes(), offset)
            .map_err(syscall("pwrite PCI_COMMAND", &self.name))?;

        debug!(device = %self.name, command = value, "enabled PCI device");
        Ok(())
    }

    /// Secondary bus reset of the device and everything sharing its bus.
    pub fn pci_hot_reset(&self) -> Result<()> {
        self.require_pci()?;

        let dependents = self
            .sys
            .device_get_pci_hot_reset_info(self.fd)
            .map_err(syscall("VFIO_DEVICE_GET_PCI_HOT_RESET_INFO", &self.name))?;

        for dep in &dependents {
            let slot = format!(
                "{:04x}:{:02x}:{:02x}.{:x}",
                dep.segment,
                dep.bus,
                dep.devfn >> 3,
                dep.devfn & 0x7
            );
            debug!(device = %self.name, dependent = %slot, group = dep.group_id, "hot reset affects device");
        }

        self.sys
            .device_pci_hot_reset(self.fd, &[self.group_fd])
            .map_err(syscall("VFIO_DEVICE_PCI_HOT_RESET", &self.name))?;

        info!(device = %self.name, dependents = dependents.len(), "PCI hot reset done");
        Ok(())
    }

    /// Route every MSI vector to a fresh eventfd.
    ///
    /// Either all vectors are wired or none: on failure the eventfds created
    /// so far are closed and nothing stays registered.
    pub fn pci_msi_init(&mut self) -> Result<&[RawFd]> {
        self.require_pci()?;

        if !self.msi_eventfds.is_empty() {
            return Ok(&self.msi_eventfds);
        }

        let count = self.irq_count(VFIO_PCI_MSI_IRQ_INDEX) as usize;
        if count == 0 {
            return Err(VfioError::IrqUnavailable {
                device: self.name.clone(),
                index: VFIO_PCI_MSI_IRQ_INDEX,
            });
        }

        let mut eventfds = Vec::with_capacity(count);
        for _ in 0..count {
            match self.sys.eventfd() {
                Ok(fd) => eventfds.push(fd),
                Err(errno) => {
                    self.close_eventfds(&eventfds);
                    return Err(syscall("eventfd", &self.name)(errno));
                }
            }
        }

        let irq_set = IrqSet::trigger_eventfds(VFIO_PCI_MSI_IRQ_INDEX, &eventfds);
        if let Err(errno) = self.sys.device_set_irqs(self.fd, &irq_set) {
            self.close_eventfds(&eventfds);
            return Err(syscall("VFIO_DEVICE_SET_IRQS", &self.name)(errno));
        }

        info!(device = %self.name, vectors = count, "MSI interrupts enabled");
        self.msi_eventfds = eventfds;
        Ok(&self.msi_eventfds)
    }

    /// Clear MSI routing and close the eventfds. Returns the number of
    /// vectors released. If the kernel refuses, routing stays intact.
    pub fn pci_msi_deinit(&mut self) -> Result<usize> {
        if self.msi_eventfds.is_empty() {
            return Ok(0);
        }
        self.require_pci()?;

        self.sys
            .device_set_irqs(self.fd, &IrqSet::disable(VFIO_PCI_MSI_IRQ_INDEX))
            .map_err(syscall("VFIO_DEVICE_SET_IRQS", &self.name))?;

        let eventfds = std::mem::take(&mut self.msi_eventfds);
        self.close_eventfds(&eventfds);

        info!(device = %self.name, vectors = eventfds.len(), "MSI interrupts disabled");
        Ok(eventfds.len())
    }

    /// Eventfds of the MSI vectors, empty until [`Self::pci_msi_init`].
    pub fn msi_eventfds(&self) -> &[RawFd] {
        &self.msi_eventfds
    }

    /// Host IRQ numbers of this device's MSI vectors, indexed by vector.
    pub fn pci_msi_find(&self) -> Result<Vec<Option<u32>>> {
        self.require_pci()?;

        let content = std::fs::read_to_string(PROC_INTERRUPTS).map_err(|source| VfioError::Io {
            path: PROC_INTERRUPTS.into(),
            source,
        })?;
        Ok(parse_msi_interrupts(&content, &self.name))
    }

    fn close_eventfds(&self, eventfds: &[RawFd]) {
        for &fd in eventfds {
            if let Err(errno) = self.sys.close(fd) {
                error!(device = %self.name, fd, %errno, "failed to close eventfd");
            }
        }
    }

    pub fn dump(&self) {
        let pci = self.is_pci();
        info!(
            "VFIO device {}: fd={} flags={:#x} regions={} irqs={}",
            self.name,
            self.fd,
            self.info.flags,
            self.regions.len(),
            self.irqs.len()
        );

        for (index, region) in self.regions.iter().enumerate() {
            info!(
                "  region {} ({}): size={:#x} offset={:#x} flags={:#x} mapped={}",
                index,
                region_name(pci, index),
                region.size,
                region.offset,
                region.flags,
                self.mapped_region(index).is_some()
            );
        }

        for (index, irq) in self.irqs.iter().enumerate() {
            info!(
                "  irq {} ({}): count={} flags={:#x}",
                index,
                irq_name(pci, index),
                irq.count,
                irq.flags
            );
        }
    }
}

impl Drop for VfioDevice {
    fn drop(&mut self) {
        debug!(device = %self.name, "releasing VFIO device");

        for index in 0..self.mappings.len() {
            if let Err(e) = self.region_unmap(index) {
                error!(device = %self.name, region = index, "failed to unmap region: {e}");
            }
        }

        if let Err(e) = self.pci_msi_deinit() {
            error!(device = %self.name, "failed to disable MSI interrupts: {e}");
            let eventfds = std::mem::take(&mut self.msi_eventfds);
            self.close_eventfds(&eventfds);
        }

        if self.is_pci() {
            if let Err(e) = self.pci_hot_reset() {
                warn!(device = %self.name, "PCI hot reset failed: {e}");
            }
        }

        if let Err(e) = self.reset() {
            error!(device = %self.name, "device reset failed: {e}");
        }

        if let Err(errno) = self.sys.close(self.fd) {
            error!(device = %self.name, fd = self.fd, %errno, "failed to close device");
        }
    }
}

/// Map `vfio-msi[<vector>](<device>)` entries of `/proc/interrupts` to IRQ numbers.
pub fn parse_msi_interrupts(content: &str, device: &str) -> Vec<Option<u32>> {
    let mut irqs = vec![None; PCI_MSI_MAX_VECTORS];

    for caps in content.lines().filter_map(|line| VFIO_MSI_REGEX.captures(line)) {
        if &caps[3] != device {
            continue;
        }
        let (Ok(irq), Ok(vector)) = (caps[1].parse::<u32>(), caps[2].parse::<usize>()) else {
            continue;
        };
        if let Some(slot) = irqs.get_mut(vector) {
            *slot = Some(irq);
        }
    }

    irqs
}
