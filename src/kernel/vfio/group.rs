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

use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info};

use super::device::VfioDevice;
use super::error::{syscall, Result, VfioError};
use super::sys::{
    VfioGroupStatus, VfioSys, VFIO_GROUP_FLAGS_CONTAINER_SET, VFIO_GROUP_FLAGS_VIABLE,
};

/// An IOMMU group claimed by a container. Owns the devices opened through it.
#[derive(Debug)]
pub struct VfioGroup {
    sys: Arc<dyn VfioSys>,
    index: u32,
    fd: RawFd,
    status: VfioGroupStatus,
    attached: bool,
    devices: Vec<VfioDevice>,
}

impl VfioGroup {
    /// Open group `index` below `dev_path` and bind it to `container_fd`.
    pub(crate) fn attach(
        sys: Arc<dyn VfioSys>,
        dev_path: &Path,
        index: u32,
        container_fd: RawFd,
        no_iommu: bool,
    ) -> Result<Self> {
        let path = if no_iommu {
            dev_path.join(format!("noiommu-{index}"))
        } else {
            dev_path.join(index.to_string())
        };

        let fd = sys
            .open(&path)
            .map_err(syscall("open", path.display()))?;

        // From here on Drop closes the descriptor if attaching fails.
        let mut group = Self {
            sys,
            index,
            fd,
            status: VfioGroupStatus::new(),
            attached: false,
            devices: Vec::new(),
        };

        group.refresh_status()?;

        if group.status.flags & VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(VfioError::GroupNotViable(index));
        }
        if group.status.flags & VFIO_GROUP_FLAGS_CONTAINER_SET != 0 {
            return Err(VfioError::GroupAlreadyAttached(index));
        }

        group
            .sys
            .group_set_container(fd, container_fd)
            .map_err(syscall("VFIO_GROUP_SET_CONTAINER", format!("group {index}")))?;
        group.attached = true;
        group.refresh_status()?;

        debug!(group = index, fd, path = %path.display(), "attached VFIO group");
        Ok(group)
    }

    fn refresh_status(&mut self) -> Result<()> {
        let mut status = VfioGroupStatus::new();
        self.sys
            .group_get_status(self.fd, &mut status)
            .map_err(syscall("VFIO_GROUP_GET_STATUS", format!("group {}", self.index)))?;
        self.status = status;
        Ok(())
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn status(&self) -> &VfioGroupStatus {
        &self.status
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn devices(&self) -> &[VfioDevice] {
        &self.devices
    }

    pub fn device(&self, name: &str) -> Option<&VfioDevice> {
        self.devices.iter().find(|d| d.name() == name)
    }

    pub fn device_mut(&mut self, name: &str) -> Option<&mut VfioDevice> {
        self.devices.iter_mut().find(|d| d.name() == name)
    }

    /// Open `name` unless it is already open. Returns its position.
    pub(crate) fn open_device(&mut self, name: &str) -> Result<usize> {
        if let Some(pos) = self.devices.iter().position(|d| d.name() == name) {
            return Ok(pos);
        }

        let device = VfioDevice::open(self.sys.clone(), name, self.fd)?;
        self.devices.push(device);
        Ok(self.devices.len() - 1)
    }

    pub(crate) fn device_at_mut(&mut self, pos: usize) -> &mut VfioDevice {
        &mut self.devices[pos]
    }

    /// Release one device. Returns false if it was not open.
    pub fn detach_device(&mut self, name: &str) -> bool {
        match self.devices.iter().position(|d| d.name() == name) {
            Some(pos) => {
                drop(self.devices.remove(pos));
                true
            }
            None => false,
        }
    }

    pub fn dump(&self) {
        info!(
            "VFIO group {}: fd={} viable={} container_set={} devices={}",
            self.index,
            self.fd,
            self.status.flags & VFIO_GROUP_FLAGS_VIABLE != 0,
            self.status.flags & VFIO_GROUP_FLAGS_CONTAINER_SET != 0,
            self.devices.len()
        );
        for device in &self.devices {
            device.dump();
        }
    }
}

impl Drop for VfioGroup {
    fn drop(&mut self) {
        debug!(group = self.index, "releasing VFIO group");

        // Devices hold descriptors obtained through this group.
        self.devices.clear();

        if self.attached {
            if let Err(errno) = self.sys.group_unset_container(self.fd) {
                error!(group = self.index, %errno, "failed to unset container");
            }
        }

        if let Err(errno) = self.sys.close(self.fd) {
            error!(group = self.index, fd = self.fd, %errno, "failed to close group");
        }
    }
}
