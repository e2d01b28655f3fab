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

//! VFIO user-space ABI (`linux/vfio.h`) and the syscalls issued against it.
//!
//! Structure layouts and request numbers must match the kernel exactly.
//! [`VfioSys`] is the only place where file descriptors are opened, ioctls
//! issued or memory mapped; [`LinuxVfio`] performs the real calls.

use std::ffi::{CStr, CString};
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::errno::Errno;

pub const VFIO_TYPE: u8 = b';';
pub const VFIO_BASE: u8 = 100;

pub const VFIO_API_VERSION: i32 = 0;

// Extensions reported by VFIO_CHECK_EXTENSION
pub const VFIO_TYPE1_IOMMU: u32 = 1;
pub const VFIO_SPAPR_TCE_IOMMU: u32 = 2;
pub const VFIO_TYPE1V2_IOMMU: u32 = 3;
pub const VFIO_DMA_CC_IOMMU: u32 = 4;
pub const VFIO_EEH: u32 = 5;
pub const VFIO_TYPE1_NESTING_IOMMU: u32 = 6;
pub const VFIO_SPAPR_TCE_V2_IOMMU: u32 = 7;
pub const VFIO_NOIOMMU_IOMMU: u32 = 8;
pub const VFIO_UNMAP_ALL: u32 = 9;
pub const VFIO_UPDATE_VADDR: u32 = 10;
pub const VFIO_EXTENSION_COUNT: usize = 11;

pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;
pub const VFIO_GROUP_FLAGS_CONTAINER_SET: u32 = 1 << 1;

pub const VFIO_DEVICE_FLAGS_RESET: u32 = 1 << 0;
pub const VFIO_DEVICE_FLAGS_PCI: u32 = 1 << 1;
pub const VFIO_DEVICE_FLAGS_PLATFORM: u32 = 1 << 2;

pub const VFIO_REGION_INFO_FLAG_READ: u32 = 1 << 0;
pub const VFIO_REGION_INFO_FLAG_WRITE: u32 = 1 << 1;
pub const VFIO_REGION_INFO_FLAG_MMAP: u32 = 1 << 2;
pub const VFIO_REGION_INFO_FLAG_CAPS: u32 = 1 << 3;

pub const VFIO_IRQ_INFO_EVENTFD: u32 = 1 << 0;
pub const VFIO_IRQ_INFO_MASKABLE: u32 = 1 << 1;
pub const VFIO_IRQ_INFO_AUTOMASKED: u32 = 1 << 2;
pub const VFIO_IRQ_INFO_NORESIZE: u32 = 1 << 3;

pub const VFIO_IRQ_SET_DATA_NONE: u32 = 1 << 0;
pub const VFIO_IRQ_SET_DATA_BOOL: u32 = 1 << 1;
pub const VFIO_IRQ_SET_DATA_EVENTFD: u32 = 1 << 2;
pub const VFIO_IRQ_SET_ACTION_MASK: u32 = 1 << 3;
pub const VFIO_IRQ_SET_ACTION_UNMASK: u32 = 1 << 4;
pub const VFIO_IRQ_SET_ACTION_TRIGGER: u32 = 1 << 5;

pub const VFIO_DMA_MAP_FLAG_READ: u32 = 1 << 0;
pub const VFIO_DMA_MAP_FLAG_WRITE: u32 = 1 << 1;

// vfio-pci region indices
pub const VFIO_PCI_BAR0_REGION_INDEX: usize = 0;
pub const VFIO_PCI_BAR5_REGION_INDEX: usize = 5;
pub const VFIO_PCI_ROM_REGION_INDEX: usize = 6;
pub const VFIO_PCI_CONFIG_REGION_INDEX: usize = 7;
pub const VFIO_PCI_VGA_REGION_INDEX: usize = 8;

// vfio-pci IRQ indices
pub const VFIO_PCI_INTX_IRQ_INDEX: usize = 0;
pub const VFIO_PCI_MSI_IRQ_INDEX: usize = 1;
pub const VFIO_PCI_MSIX_IRQ_INDEX: usize = 2;
pub const VFIO_PCI_ERR_IRQ_INDEX: usize = 3;
pub const VFIO_PCI_REQ_IRQ_INDEX: usize = 4;

/// vfio-pci places region `i` at file offset `i << 40`.
pub const VFIO_PCI_OFFSET_SHIFT: u32 = 40;

pub const PCI_COMMAND: u64 = 0x04;
pub const PCI_COMMAND_MEMORY: u16 = 0x2;
pub const PCI_COMMAND_MASTER: u16 = 0x4;

const PCI_REGION_NAMES: [&str; 9] = [
    "PCI_BAR0", "PCI_BAR1", "PCI_BAR2", "PCI_BAR3", "PCI_BAR4", "PCI_BAR5", "PCI_ROM",
    "PCI_CONFIG", "PCI_VGA",
];

const PCI_IRQ_NAMES: [&str; 5] = ["PCI_INTX", "PCI_MSI", "PCI_MSIX", "PCI_ERR", "PCI_REQ"];

pub fn region_name(pci: bool, index: usize) -> String {
    match PCI_REGION_NAMES.get(index) {
        Some(name) if pci => (*name).to_string(),
        _ => format!("region{index}"),
    }
}

pub fn irq_name(pci: bool, index: usize) -> String {
    match PCI_IRQ_NAMES.get(index) {
        Some(name) if pci => (*name).to_string(),
        _ => format!("irq{index}"),
    }
}

pub fn extension_name(extension: u32) -> &'static str {
    match extension {
        VFIO_TYPE1_IOMMU => "Type1",
        VFIO_SPAPR_TCE_IOMMU => "SPAPR TCE",
        VFIO_TYPE1V2_IOMMU => "Type1 v2",
        VFIO_DMA_CC_IOMMU => "DMA CC",
        VFIO_EEH => "EEH",
        VFIO_TYPE1_NESTING_IOMMU => "Type1 nesting",
        VFIO_SPAPR_TCE_V2_IOMMU => "SPAPR TCE v2",
        VFIO_NOIOMMU_IOMMU => "No-IOMMU",
        VFIO_UNMAP_ALL => "Unmap all",
        VFIO_UPDATE_VADDR => "Update vaddr",
        _ => "unknown",
    }
}

fn argsz<T>() -> u32 {
    size_of::<T>() as u32
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VfioGroupStatus {
    pub argsz: u32,
    pub flags: u32,
}

impl VfioGroupStatus {
    pub fn new() -> Self {
        Self {
            argsz: argsz::<Self>(),
            flags: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VfioDeviceInfo {
    pub argsz: u32,
    pub flags: u32,
    pub num_regions: u32,
    pub num_irqs: u32,
    pub cap_offset: u32,
    pub pad: u32,
}

impl VfioDeviceInfo {
    pub fn new() -> Self {
        Self {
            argsz: argsz::<Self>(),
            ..Default::default()
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VfioRegionInfo {
    pub argsz: u32,
    pub flags: u32,
    pub index: u32,
    pub cap_offset: u32,
    pub size: u64,
    pub offset: u64,
}

impl VfioRegionInfo {
    pub fn new(index: u32) -> Self {
        Self {
            argsz: argsz::<Self>(),
            index,
            ..Default::default()
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VfioIrqInfo {
    pub argsz: u32,
    pub flags: u32,
    pub index: u32,
    pub count: u32,
}

impl VfioIrqInfo {
    pub fn new(index: u32) -> Self {
        Self {
            argsz: argsz::<Self>(),
            index,
            ..Default::default()
        }
    }
}

/// Fixed part of `struct vfio_irq_set`; the eventfd array follows it.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VfioIrqSetHeader {
    pub argsz: u32,
    pub flags: u32,
    pub index: u32,
    pub start: u32,
    pub count: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VfioIommuType1DmaMap {
    pub argsz: u32,
    pub flags: u32,
    pub vaddr: u64,
    pub iova: u64,
    pub size: u64,
}

impl VfioIommuType1DmaMap {
    pub fn new(vaddr: u64, iova: u64, size: u64) -> Self {
        Self {
            argsz: argsz::<Self>(),
            flags: VFIO_DMA_MAP_FLAG_READ | VFIO_DMA_MAP_FLAG_WRITE,
            vaddr,
            iova,
            size,
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VfioIommuType1DmaUnmap {
    pub argsz: u32,
    pub flags: u32,
    pub iova: u64,
    pub size: u64,
}

impl VfioIommuType1DmaUnmap {
    pub fn new(iova: u64, size: u64) -> Self {
        Self {
            argsz: argsz::<Self>(),
            flags: 0,
            iova,
            size,
        }
    }
}

/// Fixed part of `struct vfio_pci_hot_reset_info`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VfioPciHotResetInfo {
    pub argsz: u32,
    pub flags: u32,
    pub count: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VfioPciDependentDevice {
    pub group_id: u32,
    pub segment: u16,
    pub bus: u8,
    pub devfn: u8,
}

/// Fixed part of `struct vfio_pci_hot_reset`; the group fd array follows it.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VfioPciHotReset {
    pub argsz: u32,
    pub flags: u32,
    pub count: u32,
}

const _: () = assert!(size_of::<VfioGroupStatus>() == 8);
const _: () = assert!(size_of::<VfioDeviceInfo>() == 24);
const _: () = assert!(size_of::<VfioRegionInfo>() == 32);
const _: () = assert!(size_of::<VfioIrqInfo>() == 16);
const _: () = assert!(size_of::<VfioIrqSetHeader>() == 20);
const _: () = assert!(size_of::<VfioIommuType1DmaMap>() == 32);
const _: () = assert!(size_of::<VfioIommuType1DmaUnmap>() == 24);
const _: () = assert!(size_of::<VfioPciHotResetInfo>() == 12);
const _: () = assert!(size_of::<VfioPciDependentDevice>() == 8);
const _: () = assert!(size_of::<VfioPciHotReset>() == 12);

/// A `VFIO_DEVICE_SET_IRQS` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrqSet {
    pub flags: u32,
    pub index: u32,
    pub start: u32,
    pub count: u32,
    pub eventfds: Vec<RawFd>,
}

impl IrqSet {
    /// Route vectors `0..eventfds.len()` of `index` to the given eventfds.
    pub fn trigger_eventfds(index: usize, eventfds: &[RawFd]) -> Self {
        Self {
            flags: VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER,
            index: index as u32,
            start: 0,
            count: eventfds.len() as u32,
            eventfds: eventfds.to_vec(),
        }
    }

    /// Tear down all triggers of `index`.
    pub fn disable(index: usize) -> Self {
        Self {
            flags: VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_TRIGGER,
            index: index as u32,
            start: 0,
            count: 0,
            eventfds: Vec::new(),
        }
    }

    /// Kernel representation: header followed by the eventfd array.
    pub fn to_bytes(&self) -> Vec<u8> {
        let len = size_of::<VfioIrqSetHeader>() + self.eventfds.len() * size_of::<RawFd>();
        let mut buf = Vec::with_capacity(len);

        for field in [len as u32, self.flags, self.index, self.start, self.count] {
            buf.extend_from_slice(&field.to_ne_bytes());
        }
        for fd in &self.eventfds {
            buf.extend_from_slice(&fd.to_ne_bytes());
        }
        buf
    }
}

/// Syscalls issued by the VFIO objects.
///
/// Every call returns the raw `errno` on failure; the caller attaches the
/// operation name and the object it was issued on.
pub trait VfioSys: Send + Sync {
    fn open(&self, path: &Path) -> Result<RawFd, Errno>;
    fn close(&self, fd: RawFd) -> Result<(), Errno>;
    fn page_size(&self) -> u64;

    fn get_api_version(&self, container: RawFd) -> Result<i32, Errno>;
    fn check_extension(&self, container: RawFd, extension: u32) -> Result<bool, Errno>;
    fn set_iommu(&self, container: RawFd, iommu_type: u32) -> Result<(), Errno>;
    fn iommu_map_dma(&self, container: RawFd, map: &VfioIommuType1DmaMap) -> Result<(), Errno>;
    fn iommu_unmap_dma(
        &self,
        container: RawFd,
        unmap: &mut VfioIommuType1DmaUnmap,
    ) -> Result<(), Errno>;

    fn group_get_status(&self, group: RawFd, status: &mut VfioGroupStatus) -> Result<(), Errno>;
    fn group_set_container(&self, group: RawFd, container: RawFd) -> Result<(), Errno>;
    fn group_unset_container(&self, group: RawFd) -> Result<(), Errno>;
    fn group_get_device_fd(&self, group: RawFd, name: &CStr) -> Result<RawFd, Errno>;

    fn device_get_info(&self, device: RawFd, info: &mut VfioDeviceInfo) -> Result<(), Errno>;
    fn device_get_region_info(
        &self,
        device: RawFd,
        region: &mut VfioRegionInfo,
    ) -> Result<(), Errno>;
    fn device_get_irq_info(&self, device: RawFd, irq: &mut VfioIrqInfo) -> Result<(), Errno>;
    fn device_set_irqs(&self, device: RawFd, irq_set: &IrqSet) -> Result<(), Errno>;
    fn device_reset(&self, device: RawFd) -> Result<(), Errno>;
    fn device_get_pci_hot_reset_info(
        &self,
        device: RawFd,
    ) -> Result<Vec<VfioPciDependentDevice>, Errno>;
    fn device_pci_hot_reset(&self, device: RawFd, group_fds: &[RawFd]) -> Result<(), Errno>;

    fn mmap(&self, fd: RawFd, offset: u64, len: usize) -> Result<*mut u8, Errno>;
    fn munmap(&self, addr: *mut u8, len: usize) -> Result<(), Errno>;
    fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize, Errno>;
    fn pwrite(&self, fd: RawFd, buf: &[u8], offset: u64) -> Result<usize, Errno>;
    fn eventfd(&self) -> Result<RawFd, Errno>;
}

impl std::fmt::Debug for dyn VfioSys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VfioSys")
    }
}

mod ioctl {
    use std::os::raw::{c_char, c_int};

    use nix::{
        ioctl_none_bad, ioctl_readwrite_bad, ioctl_write_int_bad, ioctl_write_ptr_bad,
        request_code_none,
    };

    use super::{
        VfioDeviceInfo, VfioGroupStatus, VfioIommuType1DmaMap, VfioIommuType1DmaUnmap,
        VfioIrqInfo, VfioRegionInfo, VFIO_BASE, VFIO_TYPE,
    };

    ioctl_none_bad!(get_api_version, request_code_none!(VFIO_TYPE, VFIO_BASE));
    ioctl_write_int_bad!(check_extension, request_code_none!(VFIO_TYPE, VFIO_BASE + 1));
    ioctl_write_int_bad!(set_iommu, request_code_none!(VFIO_TYPE, VFIO_BASE + 2));
    ioctl_readwrite_bad!(
        group_get_status,
        request_code_none!(VFIO_TYPE, VFIO_BASE + 3),
        VfioGroupStatus
    );
    ioctl_write_ptr_bad!(
        group_set_container,
        request_code_none!(VFIO_TYPE, VFIO_BASE + 4),
        c_int
    );
    ioctl_none_bad!(
        group_unset_container,
        request_code_none!(VFIO_TYPE, VFIO_BASE + 5)
    );
    ioctl_write_ptr_bad!(
        group_get_device_fd,
        request_code_none!(VFIO_TYPE, VFIO_BASE + 6),
        c_char
    );
    ioctl_readwrite_bad!(
        device_get_info,
        request_code_none!(VFIO_TYPE, VFIO_BASE + 7),
        VfioDeviceInfo
    );
    ioctl_readwrite_bad!(
        device_get_region_info,
        request_code_none!(VFIO_TYPE, VFIO_BASE + 8),
        VfioRegionInfo
    );
    ioctl_readwrite_bad!(
        device_get_irq_info,
        request_code_none!(VFIO_TYPE, VFIO_BASE + 9),
        VfioIrqInfo
    );
    ioctl_write_ptr_bad!(
        device_set_irqs,
        request_code_none!(VFIO_TYPE, VFIO_BASE + 10),
        u8
    );
    ioctl_none_bad!(device_reset, request_code_none!(VFIO_TYPE, VFIO_BASE + 11));
    ioctl_readwrite_bad!(
        device_get_pci_hot_reset_info,
        request_code_none!(VFIO_TYPE, VFIO_BASE + 12),
        u8
    );
    // Same number as IOMMU_MAP_DMA; one is issued on device fds, the other on containers.
    ioctl_write_ptr_bad!(
        device_pci_hot_reset,
        request_code_none!(VFIO_TYPE, VFIO_BASE + 13),
        u8
    );
    ioctl_write_ptr_bad!(
        iommu_map_dma,
        request_code_none!(VFIO_TYPE, VFIO_BASE + 13),
        VfioIommuType1DmaMap
    );
    ioctl_readwrite_bad!(
        iommu_unmap_dma,
        request_code_none!(VFIO_TYPE, VFIO_BASE + 14),
        VfioIommuType1DmaUnmap
    );
}

/// Upper bound on devices reported by `VFIO_DEVICE_GET_PCI_HOT_RESET_INFO`.
const MAX_DEPENDENT_DEVICES: usize = 64;

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_ne_bytes(bytes)
}

/// Syscalls against the running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxVfio;

impl VfioSys for LinuxVfio {
    fn open(&self, path: &Path) -> Result<RawFd, Errno> {
        let path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)?;
        // SAFETY: path is a valid NUL-terminated string
        Errno::result(unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) })
    }

    fn close(&self, fd: RawFd) -> Result<(), Errno> {
        // SAFETY: fd is owned by the caller and not used afterwards
        Errno::result(unsafe { libc::close(fd) }).map(drop)
    }

    fn page_size(&self) -> u64 {
        nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|size| size as u64)
            .unwrap_or(4096)
    }

    fn get_api_version(&self, container: RawFd) -> Result<i32, Errno> {
        // SAFETY: request takes no argument
        unsafe { ioctl::get_api_version(container) }
    }

    fn check_extension(&self, container: RawFd, extension: u32) -> Result<bool, Errno> {
        // SAFETY: request takes the extension id by value
        unsafe { ioctl::check_extension(container, extension as libc::c_int) }.map(|ret| ret > 0)
    }

    fn set_iommu(&self, container: RawFd, iommu_type: u32) -> Result<(), Errno> {
        // SAFETY: request takes the IOMMU type by value
        unsafe { ioctl::set_iommu(container, iommu_type as libc::c_int) }.map(drop)
    }

    fn iommu_map_dma(&self, container: RawFd, map: &VfioIommuType1DmaMap) -> Result<(), Errno> {
        // SAFETY: map points to a fully initialised vfio_iommu_type1_dma_map
        unsafe { ioctl::iommu_map_dma(container, map) }.map(drop)
    }

    fn iommu_unmap_dma(
        &self,
        container: RawFd,
        unmap: &mut VfioIommuType1DmaUnmap,
    ) -> Result<(), Errno> {
        // SAFETY: unmap points to a vfio_iommu_type1_dma_unmap the kernel may update
        unsafe { ioctl::iommu_unmap_dma(container, unmap) }.map(drop)
    }

    fn group_get_status(&self, group: RawFd, status: &mut VfioGroupStatus) -> Result<(), Errno> {
        // SAFETY: status has argsz set and is large enough
        unsafe { ioctl::group_get_status(group, status) }.map(drop)
    }

    fn group_set_container(&self, group: RawFd, container: RawFd) -> Result<(), Errno> {
        // SAFETY: the kernel reads one int through the pointer
        unsafe { ioctl::group_set_container(group, &container) }.map(drop)
    }

    fn group_unset_container(&self, group: RawFd) -> Result<(), Errno> {
        // SAFETY: request takes no argument
        unsafe { ioctl::group_unset_container(group) }.map(drop)
    }

    fn group_get_device_fd(&self, group: RawFd, name: &CStr) -> Result<RawFd, Errno> {
        // SAFETY: name is NUL-terminated
        unsafe { ioctl::group_get_device_fd(group, name.as_ptr()) }
    }

    fn device_get_info(&self, device: RawFd, info: &mut VfioDeviceInfo) -> Result<(), Errno> {
        // SAFETY: info has argsz set and is large enough
        unsafe { ioctl::device_get_info(device, info) }.map(drop)
    }

    fn device_get_region_info(
        &self,
        device: RawFd,
        region: &mut VfioRegionInfo,
    ) -> Result<(), Errno> {
        // SAFETY: region has argsz and index set
        unsafe { ioctl::device_get_region_info(device, region) }.map(drop)
    }

    fn device_get_irq_info(&self, device: RawFd, irq: &mut VfioIrqInfo) -> Result<(), Errno> {
        // SAFETY: irq has argsz and index set
        unsafe { ioctl::device_get_irq_info(device, irq) }.map(drop)
    }

    fn device_set_irqs(&self, device: RawFd, irq_set: &IrqSet) -> Result<(), Errno> {
        let buf = irq_set.to_bytes();
        // SAFETY: buf holds a vfio_irq_set whose argsz covers the whole buffer
        unsafe { ioctl::device_set_irqs(device, buf.as_ptr()) }.map(drop)
    }

    fn device_reset(&self, device: RawFd) -> Result<(), Errno> {
        // SAFETY: request takes no argument
        unsafe { ioctl::device_reset(device) }.map(drop)
    }

    fn device_get_pci_hot_reset_info(
        &self,
        device: RawFd,
    ) -> Result<Vec<VfioPciDependentDevice>, Errno> {
        let header = size_of::<VfioPciHotResetInfo>();
        let entry = size_of::<VfioPciDependentDevice>();
        let mut buf = vec![0u8; header + entry * MAX_DEPENDENT_DEVICES];
        let len = buf.len() as u32;
        buf[..4].copy_from_slice(&len.to_ne_bytes());

        // SAFETY: buf is argsz bytes long
        unsafe { ioctl::device_get_pci_hot_reset_info(device, buf.as_mut_ptr()) }?;

        let count = (read_u32(&buf, 8) as usize).min(MAX_DEPENDENT_DEVICES);
        Ok((0..count)
            .map(|i| {
                let offset = header + i * entry;
                VfioPciDependentDevice {
                    group_id: read_u32(&buf, offset),
                    segment: read_u16(&buf, offset + 4),
                    bus: buf[offset + 6],
                    devfn: buf[offset + 7],
                }
            })
            .collect())
    }

    fn device_pci_hot_reset(&self, device: RawFd, group_fds: &[RawFd]) -> Result<(), Errno> {
        let len = size_of::<VfioPciHotReset>() + group_fds.len() * size_of::<RawFd>();
        let mut buf = Vec::with_capacity(len);
        for field in [len as u32, 0, group_fds.len() as u32] {
            buf.extend_from_slice(&field.to_ne_bytes());
        }
        for fd in group_fds {
            buf.extend_from_slice(&fd.to_ne_bytes());
        }

        // SAFETY: buf holds a vfio_pci_hot_reset whose argsz covers the whole buffer
        unsafe { ioctl::device_pci_hot_reset(device, buf.as_ptr()) }.map(drop)
    }

    fn mmap(&self, fd: RawFd, offset: u64, len: usize) -> Result<*mut u8, Errno> {
        // SAFETY: a fresh shared mapping chosen by the kernel; no existing memory is touched
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Errno::last());
        }
        Ok(addr.cast())
    }

    fn munmap(&self, addr: *mut u8, len: usize) -> Result<(), Errno> {
        // SAFETY: addr/len describe a mapping created by mmap above
        Errno::result(unsafe { libc::munmap(addr.cast(), len) }).map(drop)
    }

    fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize, Errno> {
        // SAFETY: buf is valid for buf.len() bytes
        let read = unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                offset as libc::off_t,
            )
        };
        Errno::result(read).map(|n| n as usize)
    }

    fn pwrite(&self, fd: RawFd, buf: &[u8], offset: u64) -> Result<usize, Errno> {
        // SAFETY: buf is valid for buf.len() bytes
        let written =
            unsafe { libc::pwrite(fd, buf.as_ptr().cast(), buf.len(), offset as libc::off_t) };
        Errno::result(written).map(|n| n as usize)
    }

    fn eventfd(&self) -> Result<RawFd, Errno> {
        // SAFETY: no pointers involved
        Errno::result(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_numbers() {
        use nix::request_code_none;
        assert_eq!(request_code_none!(VFIO_TYPE, VFIO_BASE) as u64, 0x3b64);
        assert_eq!(request_code_none!(VFIO_TYPE, VFIO_BASE + 13) as u64, 0x3b71);
        assert_eq!(request_code_none!(VFIO_TYPE, VFIO_BASE + 14) as u64, 0x3b72);
    }

    #[test]
    fn test_irq_set_layout() {
        let set = IrqSet::trigger_eventfds(VFIO_PCI_MSI_IRQ_INDEX, &[7, 9]);
        let bytes = set.to_bytes();

        assert_eq!(bytes.len(), 28);
        assert_eq!(read_u32(&bytes, 0), 28);
        assert_eq!(
            read_u32(&bytes, 4),
            VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER
        );
        assert_eq!(read_u32(&bytes, 8), 1);
        assert_eq!(read_u32(&bytes, 16), 2);
        assert_eq!(read_u32(&bytes, 20), 7);
        assert_eq!(read_u32(&bytes, 24), 9);

        let disable = IrqSet::disable(VFIO_PCI_MSI_IRQ_INDEX).to_bytes();
        assert_eq!(disable.len(), 20);
        assert_eq!(read_u32(&disable, 16), 0);
    }

    #[test]
    fn test_names() {
        assert_eq!(region_name(true, VFIO_PCI_CONFIG_REGION_INDEX), "PCI_CONFIG");
        assert_eq!(region_name(false, 0), "region0");
        assert_eq!(region_name(true, 12), "region12");
        assert_eq!(irq_name(true, VFIO_PCI_MSI_IRQ_INDEX), "PCI_MSI");
        assert_eq!(extension_name(VFIO_NOIOMMU_IOMMU), "No-IOMMU");
    }

    #[test]
    fn test_struct_argsz() {
        assert_eq!(VfioRegionInfo::new(3).argsz, 32);
        assert_eq!(VfioRegionInfo::new(3).index, 3);
        assert_eq!(VfioDeviceInfo::new().argsz, 24);
        assert_eq!(
            VfioIommuType1DmaMap::new(0, 0, 0).flags,
            VFIO_DMA_MAP_FLAG_READ | VFIO_DMA_MAP_FLAG_WRITE
        );
    }
}
