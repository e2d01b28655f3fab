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

//! Address resolution and device access for FPGA cards attached over PCIe.
//!
//! * [`graph`] holds the generic directed graph used for address spaces and the
//!   dependency graph used to order IP-core bring-up.
//! * [`memory`] models address spaces as vertices and mappings as edges, and folds
//!   a path of mappings into a single [`memory::MemoryTranslation`]. Its
//!   allocators carve blocks out of host RAM or a device memory window.
//! * [`kernel`] wraps the VFIO container/group/device API together with the sysfs
//!   and module helpers needed to hand a PCI function over to `vfio-pci`.

pub mod config;
pub mod graph;
pub mod kernel;
pub mod logging;
pub mod memory;

pub use config::Config;
pub use graph::{DependencyGraph, DirectedGraph};
pub use kernel::vfio::{VfioContainer, VfioDevice, VfioError, VfioGroup};
pub use memory::{MemoryManager, MemoryTranslation};
