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

//! Generic directed graph with typed vertex and edge payloads.
//!
//! Vertices and edges are addressed by integer identifiers that are handed out
//! monotonically and never reused for the lifetime of the graph. The graph owns
//! every payload; callers keep identifiers only.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Write};

use tracing::{debug, info};

use super::{GraphError, Result};

pub type VertexId = usize;
pub type EdgeId = usize;

/// Sequence of edges leading from one vertex to another.
pub type Path = Vec<EdgeId>;

#[derive(Debug, Clone)]
pub struct Vertex<V> {
    id: VertexId,
    edges: Vec<EdgeId>,
    payload: V,
}

impl<V> Vertex<V> {
    pub fn id(&self) -> VertexId {
        self.id
    }

    /// Outgoing edges in insertion order.
    pub fn edges(&self) -> &[EdgeId] {
        &self.edges
    }

    pub fn payload(&self) -> &V {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut V {
        &mut self.payload
    }
}

#[derive(Debug, Clone)]
pub struct Edge<E> {
    id: EdgeId,
    from: VertexId,
    to: VertexId,
    payload: E,
}

impl<E> Edge<E> {
    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn from(&self) -> VertexId {
        self.from
    }

    pub fn to(&self) -> VertexId {
        self.to
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut E {
        &mut self.payload
    }
}

#[derive(Debug)]
pub struct DirectedGraph<V, E> {
    name: String,
    next_vertex_id: VertexId,
    next_edge_id: EdgeId,
    vertices: BTreeMap<VertexId, Vertex<V>>,
    edges: BTreeMap<EdgeId, Edge<E>>,
}

/// Path predicate that accepts every structurally valid path.
pub fn accept_any(_path: &[EdgeId]) -> bool {
    true
}

impl<V, E> DirectedGraph<V, E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_vertex_id: 0,
            next_edge_id: 0,
            vertices: BTreeMap::new(),
            edges: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_vertex(&mut self, payload: V) -> VertexId {
        let id = self.next_vertex_id;
        self.next_vertex_id += 1;

        self.vertices.insert(
            id,
            Vertex {
                id,
                edges: Vec::new(),
                payload,
            },
        );

        debug!(graph = %self.name, vertex = id, "added vertex");
        id
    }

    /// Add an edge `from -> to`. Both endpoints must be present.
    pub fn add_edge(&mut self, payload: E, from: VertexId, to: VertexId) -> Result<EdgeId> {
        if !self.vertices.contains_key(&to) {
            return Err(GraphError::VertexNotFound(to));
        }
        let origin = self
            .vertices
            .get_mut(&from)
            .ok_or(GraphError::VertexNotFound(from))?;

        let id = self.next_edge_id;
        self.next_edge_id += 1;
        origin.edges.push(id);

        self.edges.insert(
            id,
            Edge {
                id,
                from,
                to,
                payload,
            },
        );

        debug!(graph = %self.name, edge = id, from, to, "added edge");
        Ok(id)
    }

    pub fn add_default_edge(&mut self, from: VertexId, to: VertexId) -> Result<EdgeId>
    where
        E: Default,
    {
        self.add_edge(E::default(), from, to)
    }

    /// Remove an edge and return its payload.
    pub fn remove_edge(&mut self, id: EdgeId) -> Result<E> {
        let edge = self.edges.remove(&id).ok_or(GraphError::EdgeNotFound(id))?;

        if let Some(origin) = self.vertices.get_mut(&edge.from) {
            origin.edges.retain(|&e| e != id);
        }

        debug!(graph = %self.name, edge = id, "removed edge");
        Ok(edge.payload)
    }

    /// Remove a vertex together with every edge starting or ending at it.
    pub fn remove_vertex(&mut self, id: VertexId) -> Result<V> {
        if !self.vertices.contains_key(&id) {
            return Err(GraphError::VertexNotFound(id));
        }

        let incident: Vec<EdgeId> = self
            .edges
            .values()
            .filter(|edge| edge.from == id || edge.to == id)
            .map(|edge| edge.id)
            .collect();

        for edge in &incident {
            self.remove_edge(*edge)?;
        }

        let vertex = self
            .vertices
            .remove(&id)
            .ok_or(GraphError::VertexNotFound(id))?;

        debug!(
            graph = %self.name,
            vertex = id,
            removed_edges = incident.len(),
            "removed vertex"
        );
        Ok(vertex.payload)
    }

    pub fn vertex(&self, id: VertexId) -> Result<&Vertex<V>> {
        self.vertices.get(&id).ok_or(GraphError::VertexNotFound(id))
    }

    pub fn vertex_mut(&mut self, id: VertexId) -> Result<&mut Vertex<V>> {
        self.vertices
            .get_mut(&id)
            .ok_or(GraphError::VertexNotFound(id))
    }

    pub fn edge(&self, id: EdgeId) -> Result<&Edge<E>> {
        self.edges.get(&id).ok_or(GraphError::EdgeNotFound(id))
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> Result<&mut Edge<E>> {
        self.edges.get_mut(&id).ok_or(GraphError::EdgeNotFound(id))
    }

    /// First vertex (in id order) whose payload satisfies `predicate`.
    pub fn find_vertex<F>(&self, mut predicate: F) -> Result<VertexId>
    where
        F: FnMut(&V) -> bool,
    {
        self.vertices
            .values()
            .find(|vertex| predicate(&vertex.payload))
            .map(|vertex| vertex.id)
            .ok_or(GraphError::NoMatchingVertex)
    }

    pub fn vertex_edges(&self, id: VertexId) -> Result<&[EdgeId]> {
        self.vertex(id).map(Vertex::edges)
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Vertex<V>> {
        self.vertices.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge<E>> {
        self.edges.values()
    }

    /// Depth-first search for a path `from -> to`.
    ///
    /// Edges are appended to `path`. An edge is skipped when an edge already on
    /// the path leaves the vertex it would enter. A candidate path is only
    /// accepted once `accept` returns true for it; otherwise the search
    /// backtracks and tries the next sibling edge. On failure `path` is left as
    /// it was passed in.
    pub fn get_path<F>(
        &self,
        from: VertexId,
        to: VertexId,
        path: &mut Path,
        accept: &mut F,
    ) -> Result<bool>
    where
        F: FnMut(&[EdgeId]) -> bool,
    {
        self.vertex(to)?;
        self.search(from, to, path, accept)
    }

    fn search<F>(&self, from: VertexId, to: VertexId, path: &mut Path, accept: &mut F) -> Result<bool>
    where
        F: FnMut(&[EdgeId]) -> bool,
    {
        if from == to {
            return Ok(true);
        }

        let vertex = self.vertex(from)?;

        for &edge_id in &vertex.edges {
            let edge = self.edge(edge_id)?;

            let revisits = path
                .iter()
                .filter_map(|id| self.edges.get(id))
                .any(|visited| visited.from == edge.to);
            if revisits {
                continue;
            }

            let depth = path.len();
            path.push(edge_id);

            if self.search(edge.to, to, path, accept)? && accept(path) {
                return Ok(true);
            }

            path.truncate(depth);
        }

        Ok(false)
    }

    /// Log every vertex and edge. With `file` set, also write a Graphviz digraph.
    pub fn dump(&self, file: Option<&std::path::Path>) -> std::io::Result<()>
    where
        V: Display,
        E: Display,
    {
        info!(
            graph = %self.name,
            vertices = self.vertices.len(),
            edges = self.edges.len(),
            "graph dump"
        );

        for vertex in self.vertices.values() {
            info!("  vertex {}: {} (outgoing: {:?})", vertex.id, vertex.payload, vertex.edges);
        }

        for edge in self.edges.values() {
            info!(
                "  edge {}: {} -> {}: {}",
                edge.id, edge.from, edge.to, edge.payload
            );
        }

        if let Some(path) = file {
            let mut out = BufWriter::new(File::create(path)?);

            writeln!(out, "digraph memgraph {{")?;
            for edge in self.edges.values() {
                let from = self.vertex(edge.from).map(|v| v.payload.to_string());
                let to = self.vertex(edge.to).map(|v| v.payload.to_string());
                if let (Ok(from), Ok(to)) = (from, to) {
                    writeln!(
                        out,
                        "  \"{from}\" -> \"{to}\" [label=\"{}\"];",
                        edge.payload
                    )?;
                }
            }
            writeln!(out, "}}")?;
            out.flush()?;

            debug!(graph = %self.name, path = %path.display(), "wrote graphviz dump");
        }

        Ok(())
    }
}
