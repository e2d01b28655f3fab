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

//! Userspace access to PCI functions through the Linux VFIO API.

pub mod container;
pub mod device;
pub mod dma;
pub mod error;
pub mod group;
pub mod sys;

pub use container::{VfioContainer, VFIO_PCI_DRIVER};
pub use device::VfioDevice;
pub use error::{Result, VfioError};
pub use group::VfioGroup;
pub use sys::{LinuxVfio, VfioSys};

/// Default location of the VFIO character devices.
pub const VFIO_DEV_PATH: &str = "/dev/vfio";
