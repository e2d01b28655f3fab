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

//! Allocators carving memory blocks out of an address space.
//!
//! Every block gets an address space of its own, mounted into the graph by a
//! mapping from the allocator's space. Freeing a block removes both again.
//! Release any DMA mapping of a block before freeing it.

use nix::errno::Errno;
use tracing::{debug, warn};

use super::{AddressSpaceId, Mapping, MappingId, MemoryError, MemoryManager, Result};

/// Alignment of blocks handed out by a [`LinearAllocator`].
const BLOCK_ALIGNMENT: u64 = std::mem::size_of::<usize>() as u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBlock {
    offset: u64,
    size: u64,
    address_space: AddressSpaceId,
    mapping: MappingId,
}

impl MemoryBlock {
    /// Start of the block in the allocator's address space.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Address space of the block itself, starting at 0.
    pub fn address_space(&self) -> AddressSpaceId {
        self.address_space
    }

    /// Mapping from the allocator's space into the block.
    pub fn mapping(&self) -> MappingId {
        self.mapping
    }
}

pub trait Allocator {
    /// Address space blocks are carved out of.
    fn address_space(&self) -> AddressSpaceId;

    fn allocate_block(&mut self, mm: &mut MemoryManager, size: u64) -> Result<MemoryBlock>;

    fn free_block(&mut self, mm: &mut MemoryManager, block: MemoryBlock) -> Result<()>;
}

/// Create the block's address space and mount it with `mapping`.
fn mount(
    mm: &mut MemoryManager,
    from: AddressSpaceId,
    name: &str,
    mapping: Mapping,
) -> Result<MemoryBlock> {
    let offset = mapping.src();
    let size = mapping.size();
    let space = mm.get_or_create_address_space(name);

    match mm.add_mapping(mapping, from, space) {
        Ok(mapping) => Ok(MemoryBlock {
            offset,
            size,
            address_space: space,
            mapping,
        }),
        Err(e) => {
            if let Err(cleanup) = mm.remove_address_space(space) {
                warn!(block = name, %cleanup, "failed to remove unmounted block");
            }
            Err(e)
        }
    }
}

fn unmount(mm: &mut MemoryManager, block: &MemoryBlock) -> Result<Mapping> {
    let mapping = mm.remove_mapping(block.mapping)?;
    mm.remove_address_space(block.address_space)?;
    Ok(mapping)
}

/// Anonymous host memory, unmapped when the owning graph edge is dropped.
struct HostRamBuffer {
    addr: *mut u8,
    len: usize,
}

// SAFETY: the buffer is a private mapping only released through Drop
unsafe impl Send for HostRamBuffer {}

impl Drop for HostRamBuffer {
    fn drop(&mut self) {
        // SAFETY: addr/len describe the mapping created in allocate_block
        if let Err(errno) = Errno::result(unsafe { libc::munmap(self.addr.cast(), self.len) }) {
            warn!(addr = ?self.addr, len = self.len, %errno, "munmap of host RAM failed");
        }
    }
}

/// Page-granular blocks of process memory, each named `process/<address>`.
#[derive(Debug)]
pub struct HostRamAllocator {
    process: AddressSpaceId,
    page_size: u64,
}

impl HostRamAllocator {
    pub fn new(mm: &mut MemoryManager) -> Self {
        let page_size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|size| size as u64)
            .unwrap_or(4096);

        Self {
            process: mm.process_address_space(),
            page_size,
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }
}

impl Allocator for HostRamAllocator {
    fn address_space(&self) -> AddressSpaceId {
        self.process
    }

    /// Map `size` bytes rounded up to whole pages.
    fn allocate_block(&mut self, mm: &mut MemoryManager, size: u64) -> Result<MemoryBlock> {
        let len = match size.checked_next_multiple_of(self.page_size) {
            Some(len) if len > 0 => len,
            _ => return Err(MemoryError::InvalidBlockSize(size)),
        };
        let map_len = usize::try_from(len).map_err(|_| MemoryError::InvalidBlockSize(size))?;

        // SAFETY: a fresh private anonymous mapping chosen by the kernel
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(MemoryError::HostRam {
                size: len,
                errno: Errno::last(),
            });
        }

        let buffer = HostRamBuffer {
            addr: addr.cast(),
            len: map_len,
        };
        let offset = addr as u64;
        let name = MemoryManager::slave_address_space_name(
            super::manager::PROCESS_ADDRESS_SPACE,
            &format!("{offset:#x}"),
        );

        let mapping = Mapping::new("host-ram", offset, 0, len).with_owner(buffer);
        let block = mount(mm, self.process, &name, mapping)?;

        debug!(block = %name, offset, size = len, "allocated host RAM");
        Ok(block)
    }

    fn free_block(&mut self, mm: &mut MemoryManager, block: MemoryBlock) -> Result<()> {
        // Dropping the edge releases the memory.
        drop(unmount(mm, &block)?);
        debug!(offset = block.offset, size = block.size, "freed host RAM");
        Ok(())
    }
}

fn alignment_padding(addr: u64) -> u64 {
    (BLOCK_ALIGNMENT - addr % BLOCK_ALIGNMENT) % BLOCK_ALIGNMENT
}

/// Bump allocator over a fixed window of an address space, such as a BRAM.
///
/// Individual blocks are never reused. Once every block has been freed the
/// whole window becomes available again.
#[derive(Debug)]
pub struct LinearAllocator {
    address_space: AddressSpaceId,
    name: String,
    memory_size: u64,
    internal_offset: u64,
    next_free: u64,
    allocations: usize,
}

impl LinearAllocator {
    /// Allocate from `[internal_offset, internal_offset + memory_size)` of
    /// `address_space`. An unaligned start is padded, shrinking the window.
    pub fn new(
        address_space: AddressSpaceId,
        memory_size: u64,
        internal_offset: u64,
    ) -> Result<Self> {
        let padding = alignment_padding(internal_offset);
        if padding >= memory_size || internal_offset.checked_add(memory_size).is_none() {
            return Err(MemoryError::InvalidBlockSize(memory_size));
        }

        let internal_offset = internal_offset + padding;
        let memory_size = memory_size - padding;

        let mut name = format!("LinearAlloc{address_space}");
        if internal_offset != 0 {
            name.push_str(&format!("@{internal_offset:#x}"));
        }

        Ok(Self {
            address_space,
            name,
            memory_size,
            internal_offset,
            next_free: 0,
            allocations: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn available(&self) -> u64 {
        self.memory_size - self.next_free
    }

    pub fn allocations(&self) -> usize {
        self.allocations
    }
}

impl Allocator for LinearAllocator {
    fn address_space(&self) -> AddressSpaceId {
        self.address_space
    }

    fn allocate_block(&mut self, mm: &mut MemoryManager, size: u64) -> Result<MemoryBlock> {
        if size == 0 {
            return Err(MemoryError::InvalidBlockSize(size));
        }
        if size > self.available() {
            return Err(MemoryError::OutOfMemory {
                requested: size,
                available: self.available(),
            });
        }

        let offset = self.internal_offset + self.next_free;
        let end = self.next_free + size;
        let next_free = (end + alignment_padding(end)).min(self.memory_size);

        let name = MemoryManager::slave_address_space_name(&self.name, &format!("{offset:#x}"));
        let block = mount(
            mm,
            self.address_space,
            &name,
            Mapping::new(self.name.as_str(), offset, 0, size),
        )?;

        self.next_free = next_free;
        self.allocations += 1;

        debug!(
            block = %name,
            offset,
            size,
            remaining = self.available(),
            "allocated block"
        );
        Ok(block)
    }

    fn free_block(&mut self, mm: &mut MemoryManager, block: MemoryBlock) -> Result<()> {
        unmount(mm, &block)?;

        self.allocations = self.allocations.saturating_sub(1);
        if self.allocations == 0 {
            debug!(allocator = %self.name, "all blocks freed, resetting");
            self.next_free = 0;
        }

        debug!(
            allocator = %self.name,
            offset = block.offset,
            available = self.available(),
            "freed block"
        );
        Ok(())
    }
}
