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

//! The VFIO container: one IOMMU context shared by the groups attached to it.
//!
//! The container exclusively owns its groups and each group its devices.
//! Dropping the container tears the tree down leaves first.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::device::VfioDevice;
use super::error::{syscall, Result, VfioError};
use super::group::VfioGroup;
use super::sys::{
    extension_name, LinuxVfio, VfioIommuType1DmaMap, VfioIommuType1DmaUnmap, VfioSys,
    VFIO_API_VERSION, VFIO_EXTENSION_COUNT, VFIO_NOIOMMU_IOMMU, VFIO_TYPE1V2_IOMMU,
    VFIO_TYPE1_IOMMU,
};
use crate::config::VfioConfig;
use crate::kernel::module;
use crate::kernel::pci::PciDevice;

/// Kernel driver a PCI function must be bound to before VFIO can open it.
pub const VFIO_PCI_DRIVER: &str = "vfio-pci";

#[derive(Debug)]
pub struct VfioContainer {
    sys: Arc<dyn VfioSys>,
    dev_path: PathBuf,
    fd: RawFd,
    version: i32,
    extensions: [bool; VFIO_EXTENSION_COUNT],
    iommu_type: u32,
    iommu_set: bool,
    page_size: u64,
    /// Next IOVA handed out by automatic allocation. Freed ranges are never reused.
    iova_next: u64,
    groups: Vec<VfioGroup>,
}

impl VfioContainer {
    /// Load the required kernel modules and open the container on the running kernel.
    pub fn new(config: &VfioConfig) -> Result<Self> {
        for name in &config.required_modules {
            module::load(name).map_err(|e| {
                error!(module = %name, "{e}");
                VfioError::ModuleMissing(name.clone())
            })?;
        }

        Self::with_sys(Arc::new(LinuxVfio), &config.dev_path)
    }

    /// Open `<dev_path>/vfio` through `sys` and pick an IOMMU model.
    pub fn with_sys(sys: Arc<dyn VfioSys>, dev_path: &Path) -> Result<Self> {
        let path = dev_path.join("vfio");
        let fd = sys
            .open(&path)
            .map_err(syscall("open", path.display()))?;

        // From here on Drop closes the descriptor on failure.
        let mut container = Self {
            page_size: sys.page_size(),
            sys,
            dev_path: dev_path.to_path_buf(),
            fd,
            version: 0,
            extensions: [false; VFIO_EXTENSION_COUNT],
            iommu_type: 0,
            iommu_set: false,
            iova_next: 0,
            groups: Vec::new(),
        };

        container.version = container
            .sys
            .get_api_version(fd)
            .map_err(syscall("VFIO_GET_API_VERSION", path.display()))?;
        if container.version != VFIO_API_VERSION {
            return Err(VfioError::ApiVersion(container.version));
        }

        for extension in 1..VFIO_EXTENSION_COUNT as u32 {
            let supported = container
                .sys
                .check_extension(fd, extension)
                .map_err(syscall("VFIO_CHECK_EXTENSION", path.display()))?;
            container.extensions[extension as usize] = supported;
        }

        container.iommu_type = [VFIO_TYPE1V2_IOMMU, VFIO_TYPE1_IOMMU, VFIO_NOIOMMU_IOMMU]
            .into_iter()
            .find(|&ext| container.has_extension(ext))
            .ok_or(VfioError::NoIommuExtension)?;

        if !container.has_iommu() {
            warn!("no IOMMU available, running VFIO in no-IOMMU mode without DMA mapping");
        }

        info!(
            version = container.version,
            iommu = extension_name(container.iommu_type),
            page_size = container.page_size,
            "opened VFIO container"
        );
        Ok(container)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn has_extension(&self, extension: u32) -> bool {
        self.extensions
            .get(extension as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn iommu_type(&self) -> u32 {
        self.iommu_type
    }

    pub fn has_iommu(&self) -> bool {
        self.iommu_type != VFIO_NOIOMMU_IOMMU
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn iova_next(&self) -> u64 {
        self.iova_next
    }

    pub fn groups(&self) -> &[VfioGroup] {
        &self.groups
    }

    pub fn group(&self, index: u32) -> Option<&VfioGroup> {
        self.groups.iter().find(|g| g.index() == index)
    }

    /// Attach IOMMU group `index`, reusing it if already attached.
    pub fn get_or_attach_group(&mut self, index: u32) -> Result<&mut VfioGroup> {
        if let Some(pos) = self.groups.iter().position(|g| g.index() == index) {
            return Ok(&mut self.groups[pos]);
        }

        let group = VfioGroup::attach(
            self.sys.clone(),
            &self.dev_path,
            index,
            self.fd,
            !self.has_iommu(),
        )?;

        // The IOMMU model can only be chosen once a group is attached.
        if !self.iommu_set {
            self.sys
                .set_iommu(self.fd, self.iommu_type)
                .map_err(syscall("VFIO_SET_IOMMU", extension_name(self.iommu_type)))?;
            self.iommu_set = true;
        }

        self.groups.push(group);
        let last = self.groups.len() - 1;
        Ok(&mut self.groups[last])
    }

    /// Open device `name` of IOMMU group `group_index`.
    pub fn attach_device(&mut self, name: &str, group_index: u32) -> Result<&mut VfioDevice> {
        let group = self.get_or_attach_group(group_index)?;
        let pos = group.open_device(name)?;
        Ok(group.device_at_mut(pos))
    }

    /// Bind a PCI function to vfio-pci, restore its BAR0 and open it, named by
    /// its slot.
    pub fn attach_pci_device(&mut self, pci: &PciDevice) -> Result<&mut VfioDevice> {
        pci.bind_driver(VFIO_PCI_DRIVER)?;
        pci.rewrite_bar(0)?;

        // No-IOMMU groups are numbered independently of the IOMMU topology.
        let index = if self.has_iommu() { pci.iommu_group()? } else { 0 };
        let name = pci.slot.to_string();

        let group = self.get_or_attach_group(index)?;
        let pos = group.open_device(&name)?;

        if !group.device_at_mut(pos).is_pci() {
            group.detach_device(&name);
            return Err(VfioError::NotPciDevice(name));
        }

        info!(device = %name, group = index, id = %pci.id, "attached PCI device");
        Ok(group.device_at_mut(pos))
    }

    pub fn device(&self, name: &str) -> Option<&VfioDevice> {
        self.groups.iter().find_map(|g| g.device(name))
    }

    pub fn device_mut(&mut self, name: &str) -> Option<&mut VfioDevice> {
        self.groups.iter_mut().find_map(|g| g.device_mut(name))
    }

    fn round_to_page(&self, size: u64) -> Result<u64> {
        size.checked_next_multiple_of(self.page_size.max(1))
            .ok_or(VfioError::DmaSizeOverflow(size))
    }

    /// Map `size` bytes at process address `vaddr` for DMA.
    ///
    /// With `iova` set to `None` the next free IOVA is taken from the
    /// container's cursor. The length is rounded up to whole pages. Fails with
    /// [`VfioError::NoIommu`] when the container runs without an IOMMU.
    pub fn memory_map(&mut self, vaddr: u64, iova: Option<u64>, size: u64) -> Result<u64> {
        if !self.has_iommu() {
            error!(vaddr, size, "DMA mapping requested without an IOMMU");
            return Err(VfioError::NoIommu);
        }

        let size = self.round_to_page(size)?;
        let iova = iova.unwrap_or(self.iova_next);

        let map = VfioIommuType1DmaMap::new(vaddr, iova, size);
        self.sys
            .iommu_map_dma(self.fd, &map)
            .map_err(syscall("VFIO_IOMMU_MAP_DMA", format!("iova {iova:#x}")))?;

        // TODO: reuse unmapped ranges once long-running users exhaust the IOVA space
        self.iova_next = self.iova_next.max(iova.saturating_add(size));

        debug!(vaddr, iova, size, "DMA mapping created");
        Ok(iova)
    }

    /// Release a DMA mapping. Always succeeds without an IOMMU.
    pub fn memory_unmap(&mut self, iova: u64, size: u64) -> Result<()> {
        if !self.has_iommu() {
            return Ok(());
        }

        let mut unmap = VfioIommuType1DmaUnmap::new(iova, self.round_to_page(size)?);
        self.sys
            .iommu_unmap_dma(self.fd, &mut unmap)
            .map_err(syscall("VFIO_IOMMU_UNMAP_DMA", format!("iova {iova:#x}")))?;

        debug!(iova, unmapped = unmap.size, "DMA mapping released");
        Ok(())
    }

    pub fn dump(&self) {
        info!(
            "VFIO container: fd={} version={} iommu={} page_size={:#x} iova_next={:#x}",
            self.fd,
            self.version,
            extension_name(self.iommu_type),
            self.page_size,
            self.iova_next
        );

        for (extension, supported) in self.extensions.iter().enumerate().skip(1) {
            info!(
                "  extension {} ({}): {}",
                extension,
                extension_name(extension as u32),
                if *supported { "yes" } else { "no" }
            );
        }

        for group in &self.groups {
            group.dump();
        }
    }
}

impl Drop for VfioContainer {
    fn drop(&mut self) {
        debug!(groups = self.groups.len(), "releasing VFIO container");

        self.groups.clear();

        if let Err(errno) = self.sys.close(self.fd) {
            error!(fd = self.fd, %errno, "failed to close container");
        }
    }
}
