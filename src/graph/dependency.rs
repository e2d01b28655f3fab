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

use std::collections::BTreeMap;
use std::fmt::Display;

use tracing::{debug, warn};

/// Adjacency list from a key to the keys it depends on.
///
/// Naming a key as a dependency creates it, so registration order does not
/// matter. Iteration is in key order, which keeps evaluation deterministic.
#[derive(Debug, Clone)]
pub struct DependencyGraph<K> {
    nodes: BTreeMap<K, Vec<K>>,
}

impl<K> Default for DependencyGraph<K> {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }
}

impl<K> DependencyGraph<K>
where
    K: Ord + Clone + Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `key` if absent. Returns whether it already existed.
    pub fn add_node(&mut self, key: K) -> bool {
        if self.nodes.contains_key(&key) {
            return true;
        }
        self.nodes.insert(key, Vec::new());
        false
    }

    pub fn add_dependency(&mut self, node: K, dependency: K) {
        self.add_node(dependency.clone());

        let deps = self.nodes.entry(node).or_default();
        if !deps.contains(&dependency) {
            deps.push(dependency);
        }
    }

    /// Remove `key` and, transitively, everything that depends on it.
    pub fn remove_node(&mut self, key: &K) {
        let mut pending = vec![key.clone()];

        while let Some(current) = pending.pop() {
            if self.nodes.remove(&current).is_none() {
                continue;
            }
            debug!(node = %current, "removed dependency node");

            pending.extend(
                self.nodes
                    .iter()
                    .filter(|(_, deps)| deps.contains(&current))
                    .map(|(dependent, _)| dependent.clone()),
            );
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn dependencies(&self, key: &K) -> Option<&[K]> {
        self.nodes.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Keys ordered so that every dependency precedes its dependents.
    ///
    /// Nodes caught in a cycle, and anything depending on them, are left out
    /// and reported with a warning. See [`Self::resolve`].
    pub fn evaluation_order(&self) -> Vec<K> {
        self.resolve().0
    }

    /// Like [`Self::evaluation_order`] but also returns the keys that could not
    /// be ordered, so callers can skip and report them.
    pub fn resolve(&self) -> (Vec<K>, Vec<K>) {
        let mut remaining = self.nodes.clone();
        let mut order: Vec<K> = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let mut added = 0;

            let keys: Vec<K> = remaining.keys().cloned().collect();
            for key in keys {
                let Some(deps) = remaining.get_mut(&key) else {
                    continue;
                };

                deps.retain(|dep| !order.contains(dep));
                if deps.is_empty() {
                    remaining.remove(&key);
                    order.push(key);
                    added += 1;
                }
            }

            if added == 0 {
                break;
            }
        }

        let unresolved: Vec<K> = remaining.into_keys().collect();
        if !unresolved.is_empty() {
            let names = unresolved
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            warn!(unresolved = %names, "circular dependency, excluding nodes from evaluation order");
        }

        (order, unresolved)
    }
}
