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

use std::fmt::Display;
use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

use crate::kernel::pci::PciError;
use crate::memory::MemoryError;

#[derive(Debug, Error)]
pub enum VfioError {
    #[error("{op} failed on {target}: {errno}")]
    Syscall {
        op: &'static str,
        target: String,
        errno: Errno,
    },

    #[error("required kernel module '{0}' is not available")]
    ModuleMissing(String),

    #[error("unsupported VFIO API version {0}")]
    ApiVersion(i32),

    #[error("no supported IOMMU extension found")]
    NoIommuExtension,

    #[error("VFIO group {0} is not viable, bind every device of the IOMMU group to vfio-pci")]
    GroupNotViable(u32),

    #[error("VFIO group {0} is already attached to a container")]
    GroupAlreadyAttached(u32),

    #[error("device {0} is not a PCI device")]
    NotPciDevice(String),

    #[error("region {index} of device {device} does not support mmap")]
    RegionNotMappable { device: String, index: usize },

    #[error("region {index} is out of range, device has {count} regions")]
    RegionOutOfRange { index: usize, count: usize },

    #[error("IRQ index {index} of device {device} has no vectors")]
    IrqUnavailable { device: String, index: usize },

    #[error("no IOMMU available, DMA mapping is not possible")]
    NoIommu,

    #[error("DMA length {0:#x} cannot be rounded to whole pages")]
    DmaSizeOverflow(u64),

    #[error(transparent)]
    Pci(#[from] PciError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl VfioError {
    /// Raw kernel error code, when the failure came from a syscall.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            VfioError::Syscall { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, VfioError>;

pub(crate) fn syscall(op: &'static str, target: impl Display) -> impl FnOnce(Errno) -> VfioError {
    let target = target.to_string();
    move |errno| VfioError::Syscall { op, target, errno }
}
