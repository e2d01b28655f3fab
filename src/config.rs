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

//! JSON configuration of a card: which PCI functions to claim, which IP
//! cores it carries and which memory blocks those cores expose.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::graph::DependencyGraph;
use crate::kernel::pci::{self, PciDevice, PciFilter, PCI_DEVICES_PATH};
use crate::kernel::vfio::VFIO_DEV_PATH;
use crate::memory::{AddressSpaceId, LinearAllocator, MemoryError, MemoryManager};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vfio: VfioConfig,
    #[serde(default)]
    pub pci: PciConfig,
    #[serde(default)]
    pub devices: Vec<PciFilter>,
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    #[serde(default)]
    pub memory_blocks: Vec<MemoryBlockConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VfioConfig {
    #[serde(default = "default_required_modules")]
    pub required_modules: Vec<String>,
    #[serde(default = "default_dev_path")]
    pub dev_path: PathBuf,
}

impl Default for VfioConfig {
    fn default() -> Self {
        Self {
            required_modules: default_required_modules(),
            dev_path: default_dev_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PciConfig {
    #[serde(default = "default_sysfs_path")]
    pub sysfs_path: PathBuf,
}

impl Default for PciConfig {
    fn default() -> Self {
        Self {
            sysfs_path: default_sysfs_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IpConfig {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A named memory block of an IP core, registered as address space `<ip>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MemoryBlockConfig {
    pub ip: String,
    pub name: String,
    pub size: u64,
}

fn default_required_modules() -> Vec<String> {
    ["vfio", "vfio_pci", "vfio_iommu_type1"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_dev_path() -> PathBuf {
    PathBuf::from(VFIO_DEV_PATH)
}

fn default_sysfs_path() -> PathBuf {
    PathBuf::from(PCI_DEVICES_PATH)
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for ip in &self.ips {
            if ip.name.is_empty() {
                return Err(ConfigError::Invalid("IP with empty name".to_string()));
            }
            if !names.insert(ip.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate IP '{}'", ip.name)));
            }
        }

        for block in &self.memory_blocks {
            if block.size == 0 {
                return Err(ConfigError::Invalid(format!(
                    "memory block '{}/{}' has zero size",
                    block.ip, block.name
                )));
            }
        }
        Ok(())
    }

    /// Dependency graph of the configured IP cores. A dependency on an IP that
    /// is not configured still shows up as a node of its own.
    pub fn dependency_graph(&self) -> DependencyGraph<String> {
        let mut graph = DependencyGraph::new();
        for ip in &self.ips {
            graph.add_node(ip.name.clone());
            for dependency in &ip.depends_on {
                graph.add_dependency(ip.name.clone(), dependency.clone());
            }
        }
        graph
    }

    /// Create one address space per configured memory block, in declaration order.
    pub fn register_memory_blocks(&self, mm: &mut MemoryManager) -> Vec<AddressSpaceId> {
        self.memory_blocks
            .iter()
            .map(|block| {
                let name = MemoryManager::slave_address_space_name(&block.ip, &block.name);
                mm.get_or_create_address_space(&name)
            })
            .collect()
    }

    /// One allocator per configured memory block, spanning its configured size.
    pub fn memory_block_allocators(
        &self,
        mm: &mut MemoryManager,
    ) -> Result<Vec<LinearAllocator>> {
        let spaces = self.register_memory_blocks(mm);
        self.memory_blocks
            .iter()
            .zip(spaces)
            .map(|(block, space)| {
                LinearAllocator::new(space, block.size, 0).map_err(ConfigError::from)
            })
            .collect()
    }

    /// PCI functions below the configured sysfs root matching any device filter.
    pub fn matching_devices(&self) -> pci::Result<Vec<PciDevice>> {
        PciDevice::lookup(&self.pci.sysfs_path, &self.devices)
    }
}
