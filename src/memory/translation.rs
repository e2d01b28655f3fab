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

use std::fmt;

use super::{MemoryError, Result};

/// Affine window between two address spaces.
///
/// Local address `x` with `src <= x < src + size` corresponds to foreign
/// address `x - src + dst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryTranslation {
    src: u64,
    dst: u64,
    size: u64,
}

impl MemoryTranslation {
    pub const fn new(src: u64, dst: u64, size: u64) -> Self {
        Self { src, dst, size }
    }

    /// Neutral element of [`compose`](Self::compose).
    pub const fn identity() -> Self {
        Self::new(0, 0, u64::MAX)
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

    /// Local address of `foreign`, which must lie in `[dst, dst + size)`.
    pub fn local_addr(&self, foreign: u64) -> Result<u64> {
        if foreign < self.dst || foreign - self.dst >= self.size {
            return Err(MemoryError::OutOfWindow { addr: foreign });
        }
        Ok(foreign - self.dst + self.src)
    }

    /// Foreign address of `local`, which must lie in `[src, src + size)`.
    pub fn foreign_addr(&self, local: u64) -> Result<u64> {
        if local < self.src || local - self.src >= self.size {
            return Err(MemoryError::OutOfWindow { addr: local });
        }
        Ok(local - self.src + self.dst)
    }

    /// Chain `self` (local -> intermediate) with `next` (intermediate -> foreign).
    ///
    /// The result covers the intersection of `self`'s destination window with
    /// `next`'s source window. Disjoint windows yield `InvalidTranslation`.
    pub fn compose(&self, next: &MemoryTranslation) -> Result<MemoryTranslation> {
        let lo = self.dst.max(next.src);
        let hi = self
            .dst
            .saturating_add(self.size)
            .min(next.src.saturating_add(next.size));

        if hi <= lo {
            return Err(MemoryError::InvalidTranslation);
        }

        let src = self
            .src
            .checked_add(lo - self.dst)
            .ok_or(MemoryError::InvalidTranslation)?;
        let dst = next
            .dst
            .checked_add(lo - next.src)
            .ok_or(MemoryError::InvalidTranslation)?;

        Ok(MemoryTranslation::new(src, dst, hi - lo))
    }
}

impl Default for MemoryTranslation {
    fn default() -> Self {
        Self::identity()
    }
}

impl fmt::Display for MemoryTranslation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "src={:#x} dst={:#x} size={:#x}",
            self.src, self.dst, self.size
        )
    }
}
