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

use std::path::Path;
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info};

pub const SYSFS_MODULE_PATH: &str = "/sys/module";

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("failed to run modprobe for '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("modprobe '{name}' exited with {status}")]
    LoadFailed { name: String, status: String },
}

/// Kernel module names use underscores under `/sys/module` even when
/// `modprobe` is given dashes.
fn sysfs_name(name: &str) -> String {
    name.replace('-', "_")
}

pub fn is_loaded(name: &str) -> bool {
    is_loaded_in(Path::new(SYSFS_MODULE_PATH), name)
}

pub fn is_loaded_in(root: &Path, name: &str) -> bool {
    root.join(sysfs_name(name)).is_dir()
}

/// Load `name` with `modprobe` unless it is already present.
pub fn load(name: &str) -> Result<(), ModuleError> {
    if is_loaded(name) {
        debug!(module = name, "kernel module already loaded");
        return Ok(());
    }

    let status = Command::new("modprobe")
        .arg(name)
        .status()
        .map_err(|source| ModuleError::Spawn {
            name: name.to_string(),
            source,
        })?;

    if !status.success() {
        return Err(ModuleError::LoadFailed {
            name: name.to_string(),
            status: status.to_string(),
        });
    }

    info!(module = name, "loaded kernel module");
    Ok(())
}
