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

pub mod allocator;
pub mod manager;
pub mod translation;

pub use allocator::{Allocator, HostRamAllocator, LinearAllocator, MemoryBlock};
pub use manager::{AddressSpace, AddressSpaceId, Mapping, MappingId, MemoryManager};
pub use translation::MemoryTranslation;

use nix::errno::Errno;
use thiserror::Error;

use crate::graph::GraphError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("address space '{0}' not found")]
    AddressSpaceNotFound(String),

    #[error("no translation from address space {from} to {to}")]
    NoTranslation {
        from: AddressSpaceId,
        to: AddressSpaceId,
    },

    #[error("translation windows do not overlap")]
    InvalidTranslation,

    #[error("address {addr:#x} is outside the translation window")]
    OutOfWindow { addr: u64 },

    #[error("invalid memory block size {0:#x}")]
    InvalidBlockSize(u64),

    #[error("cannot allocate {requested:#x} bytes, {available:#x} available")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("failed to map {size:#x} bytes of host RAM: {errno}")]
    HostRam { size: u64, errno: Errno },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
