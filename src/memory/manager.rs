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

//! Registry of address spaces and the mappings between them.
//!
//! Address spaces are vertices and mappings are edges of a [`DirectedGraph`].
//! A translation between two spaces is found by searching a path and folding
//! the mappings along it into one [`MemoryTranslation`]. A new hop added by one
//! component therefore makes every space behind it reachable for all others.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::{debug, info};

use super::{MemoryError, MemoryTranslation, Result};
use crate::graph::{DirectedGraph, EdgeId, Path, VertexId};

pub type AddressSpaceId = VertexId;
pub type MappingId = EdgeId;

/// Name of the virtual address space of the running process.
pub const PROCESS_ADDRESS_SPACE: &str = "process";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpace {
    name: String,
}

impl AddressSpace {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Edge payload: `[src, src + size)` in the origin space maps to `dst` onwards
/// in the target space.
///
/// A mapping may carry an owner, for example a guard that releases a kernel
/// DMA mapping. The owner is dropped together with the edge.
pub struct Mapping {
    name: String,
    src: u64,
    dst: u64,
    size: u64,
    owner: Option<Box<dyn Any + Send>>,
}

impl Mapping {
    pub fn new(name: impl Into<String>, src: u64, dst: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            src,
            dst,
            size,
            owner: None,
        }
    }

    pub fn with_owner<T: Any + Send>(mut self, owner: T) -> Self {
        self.owner = Some(Box::new(owner));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn src(&self) -> u64 {
        self.src
    }

    pub fn dst(&self) -> u64 {
        self.dst
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn owner<T: Any>(&self) -> Option<&T> {
        self.owner.as_ref().and_then(|owner| owner.downcast_ref::<T>())
    }

    pub fn translation(&self) -> MemoryTranslation {
        MemoryTranslation::new(self.src, self.dst, self.size)
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("name", &self.name)
            .field("src", &format_args!("{:#x}", self.src))
            .field("dst", &format_args!("{:#x}", self.dst))
            .field("size", &format_args!("{:#x}", self.size))
            .field("owned", &self.owner.is_some())
            .finish()
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {:#x} -> {:#x} (size {:#x})",
            self.name, self.src, self.dst, self.size
        )
    }
}

static GLOBAL_MEMORY_MANAGER: Lazy<Mutex<MemoryManager>> =
    Lazy::new(|| Mutex::new(MemoryManager::new()));

#[derive(Debug)]
pub struct MemoryManager {
    graph: DirectedGraph<AddressSpace, Mapping>,
    lookup: HashMap<String, AddressSpaceId>,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            graph: DirectedGraph::new("memory:graph"),
            lookup: HashMap::new(),
        }
    }

    /// Process-wide instance for code that cannot have a manager passed in.
    pub fn global() -> &'static Mutex<MemoryManager> {
        &GLOBAL_MEMORY_MANAGER
    }

    /// Canonical name of memory block `block` owned by `owner`.
    pub fn slave_address_space_name(owner: &str, block: &str) -> String {
        format!("{owner}/{block}")
    }

    pub fn get_or_create_address_space(&mut self, name: &str) -> AddressSpaceId {
        if let Some(&id) = self.lookup.get(name) {
            return id;
        }

        let id = self.graph.add_vertex(AddressSpace::new(name));
        self.lookup.insert(name.to_string(), id);

        debug!(address_space = name, id, "created address space");
        id
    }

    pub fn process_address_space(&mut self) -> AddressSpaceId {
        self.get_or_create_address_space(PROCESS_ADDRESS_SPACE)
    }

    pub fn process_address_space_memory_block(&mut self, block: &str) -> AddressSpaceId {
        let name = Self::slave_address_space_name(PROCESS_ADDRESS_SPACE, block);
        self.get_or_create_address_space(&name)
    }

    pub fn find_address_space(&self, name: &str) -> Result<AddressSpaceId> {
        self.graph
            .find_vertex(|space| space.name == name)
            .map_err(|_| MemoryError::AddressSpaceNotFound(name.to_string()))
    }

    pub fn address_space(&self, id: AddressSpaceId) -> Result<&AddressSpace> {
        Ok(self.graph.vertex(id)?.payload())
    }

    pub fn create_mapping(
        &mut self,
        src: u64,
        dst: u64,
        size: u64,
        name: &str,
        from: AddressSpaceId,
        to: AddressSpaceId,
    ) -> Result<MappingId> {
        self.add_mapping(Mapping::new(name, src, dst, size), from, to)
    }

    pub fn add_mapping(
        &mut self,
        mapping: Mapping,
        from: AddressSpaceId,
        to: AddressSpaceId,
    ) -> Result<MappingId> {
        debug!(%mapping, from, to, "adding mapping");
        Ok(self.graph.add_edge(mapping, from, to)?)
    }

    pub fn mapping(&self, id: MappingId) -> Result<&Mapping> {
        Ok(self.graph.edge(id)?.payload())
    }

    /// First mapping from `from` directly to `to` accepted by `predicate`.
    pub fn find_mapping<F>(
        &self,
        from: AddressSpaceId,
        to: AddressSpaceId,
        mut predicate: F,
    ) -> Option<MappingId>
    where
        F: FnMut(&Mapping) -> bool,
    {
        self.graph.vertex_edges(from).ok()?.iter().copied().find(|&id| {
            self.graph
                .edge(id)
                .is_ok_and(|edge| edge.to() == to && predicate(edge.payload()))
        })
    }

    /// Remove a mapping. Its owner, if any, is returned with it.
    pub fn remove_mapping(&mut self, id: MappingId) -> Result<Mapping> {
        Ok(self.graph.remove_edge(id)?)
    }

    /// Remove an address space and every mapping from or to it.
    pub fn remove_address_space(&mut self, id: AddressSpaceId) -> Result<()> {
        let space = self.graph.remove_vertex(id)?;
        self.lookup.remove(space.name());
        debug!(address_space = space.name(), id, "removed address space");
        Ok(())
    }

    /// Translation from `from` to `to`.
    ///
    /// Only paths whose hops actually overlap are accepted, so a dead end
    /// through disjoint windows does not hide a usable route. A zero-sized
    /// mapping overlaps nothing and is never part of a translation; a target
    /// only reachable through one reports `NoTranslation`.
    pub fn get_translation(
        &self,
        from: AddressSpaceId,
        to: AddressSpaceId,
    ) -> Result<MemoryTranslation> {
        let path = self.path_between(from, to)?;
        self.fold_path(&path)
    }

    pub fn get_translation_from_process(
        &mut self,
        foreign: AddressSpaceId,
    ) -> Result<MemoryTranslation> {
        let process = self.process_address_space();
        self.get_translation(process, foreign)
    }

    /// Address spaces visited on the way from `from` to `to`, both included.
    pub fn find_path(&self, from: AddressSpaceId, to: AddressSpaceId) -> Result<Vec<AddressSpaceId>> {
        let path = self.path_between(from, to)?;

        let mut spaces = vec![from];
        for edge in &path {
            spaces.push(self.graph.edge(*edge)?.to());
        }
        Ok(spaces)
    }

    pub fn graph(&self) -> &DirectedGraph<AddressSpace, Mapping> {
        &self.graph
    }

    pub fn dump(&self, file: Option<&std::path::Path>) -> std::io::Result<()> {
        info!(address_spaces = self.lookup.len(), "memory manager dump");
        self.graph.dump(file)
    }

    fn path_between(&self, from: AddressSpaceId, to: AddressSpaceId) -> Result<Path> {
        let mut path = Path::new();
        let mut overlapping = |candidate: &[EdgeId]| self.fold_path(candidate).is_ok();

        if !self.graph.get_path(from, to, &mut path, &mut overlapping)? {
            debug!(from, to, "no path between address spaces");
            return Err(MemoryError::NoTranslation { from, to });
        }
        Ok(path)
    }

    fn fold_path(&self, path: &[EdgeId]) -> Result<MemoryTranslation> {
        let mut translation = MemoryTranslation::identity();
        for edge in path {
            let mapping = self.graph.edge(*edge)?.payload();
            translation = translation.compose(&mapping.translation())?;
        }
        Ok(translation)
    }
}

#[cfg(test)]
mod tests;
