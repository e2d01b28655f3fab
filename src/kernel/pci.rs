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

//! PCI function discovery and driver binding through sysfs.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const PCI_DEVICES_PATH: &str = "/sys/bus/pci/devices";

/// Number of lines of the sysfs `resource` file that describe BARs and ROM.
const MAX_RESOURCE_REGIONS: usize = 8;

/// Offset of BAR0 in configuration space; BARs follow as 32-bit registers.
const PCI_BASE_ADDRESS_0: i64 = 0x10;

/// Low bits of a memory BAR holding type and prefetch flags.
const PCI_BASE_ADDRESS_FLAGS_MASK: u32 = 0xf;

/// Full address such as `0000:03:00.0`; the domain may be omitted.
static PCI_SLOT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:([0-9a-fA-F]{4}):)?([0-9a-fA-F]{2}):([0-9a-fA-F]{2})\.([0-7])$")
        .expect("Invalid PCI slot regex")
});

#[derive(Debug, Error)]
pub enum PciError {
    #[error("invalid PCI slot '{slot}': {reason}")]
    InvalidSlot { slot: String, reason: &'static str },

    #[error("invalid PCI id '{id}': {reason}")]
    InvalidId { id: String, reason: &'static str },

    #[error("PCI device {0} has no IOMMU group")]
    NoIommuGroup(PciSlot),

    #[error("BAR{bar} of PCI device {slot}: {reason}")]
    InvalidBar {
        slot: PciSlot,
        bar: usize,
        reason: &'static str,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PciError>;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PciError + '_ {
    move |source| PciError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciSlot {
    pub domain: u32,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl fmt::Display for PciSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciSlot {
    type Err = PciError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason| PciError::InvalidSlot {
            slot: s.to_string(),
            reason,
        };

        let caps = PCI_SLOT_REGEX
            .captures(s.trim())
            .ok_or_else(|| invalid("expected [dddd:]bb:ss.f"))?;
        let hex = |i: usize| {
            caps.get(i)
                .map(|m| u32::from_str_radix(m.as_str(), 16))
                .transpose()
                .map_err(|_| invalid("not a hex number"))
        };

        let device = hex(3)?.unwrap_or(0);
        if device > 0x1f {
            return Err(invalid("invalid slot number"));
        }

        Ok(Self {
            domain: hex(1)?.unwrap_or(0),
            bus: hex(2)?.unwrap_or(0) as u8,
            device: device as u8,
            function: hex(4)?.unwrap_or(0) as u8,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciId {
    pub vendor: u16,
    pub device: u16,
    /// Base class and subclass, e.g. `0x0580`.
    pub class_code: u16,
}

impl fmt::Display for PciId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.device)
    }
}

/// Parse one filter component. Empty and `*` match anything.
fn filter_field(
    field: Option<&str>,
    max: u32,
    reason: &'static str,
) -> std::result::Result<Option<u32>, &'static str> {
    match field.map(str::trim) {
        None | Some("") | Some("*") => Ok(None),
        Some(text) => match u32::from_str_radix(text.trim_start_matches("0x"), 16) {
            Ok(value) if value <= max => Ok(Some(value)),
            _ => Err(reason),
        },
    }
}

/// Slot filter `[[domain:]bus:][slot][.func]`, each part optional or `*`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct SlotFilter {
    pub domain: Option<u32>,
    pub bus: Option<u8>,
    pub device: Option<u8>,
    pub function: Option<u8>,
}

impl SlotFilter {
    pub fn matches(&self, slot: &PciSlot) -> bool {
        self.domain.map_or(true, |d| d == slot.domain)
            && self.bus.map_or(true, |b| b == slot.bus)
            && self.device.map_or(true, |d| d == slot.device)
            && self.function.map_or(true, |f| f == slot.function)
    }
}

impl FromStr for SlotFilter {
    type Err = PciError;

    fn from_str(s: &str) -> Result<Self> {
        let parse = || -> std::result::Result<Self, &'static str> {
            let (head, tail) = match s.rsplit_once(':') {
                Some((head, tail)) => (Some(head), tail),
                None => (None, s),
            };
            let (device, function) = match tail.split_once('.') {
                Some((device, function)) => (device, Some(function)),
                None => (tail, None),
            };

            let mut filter = SlotFilter::default();
            if let Some(head) = head {
                let (domain, bus) = match head.split_once(':') {
                    Some((domain, bus)) => (Some(domain), bus),
                    None => (None, head),
                };
                filter.domain = filter_field(domain, 0x7fff_ffff, "invalid domain number")?;
                filter.bus = filter_field(Some(bus), 0xff, "invalid bus number")?.map(|v| v as u8);
            }
            filter.device = filter_field(Some(device), 0x1f, "invalid slot number")?.map(|v| v as u8);
            filter.function =
                filter_field(function, 7, "invalid function number")?.map(|v| v as u8);
            Ok(filter)
        };

        parse().map_err(|reason| PciError::InvalidSlot {
            slot: s.to_string(),
            reason,
        })
    }
}

impl TryFrom<String> for SlotFilter {
    type Error = PciError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Id filter `[vendor]:[device][:class]`, each part optional or `*`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct IdFilter {
    pub vendor: Option<u16>,
    pub device: Option<u16>,
    pub class_code: Option<u16>,
}

impl IdFilter {
    pub fn matches(&self, id: &PciId) -> bool {
        self.vendor.map_or(true, |v| v == id.vendor)
            && self.device.map_or(true, |d| d == id.device)
            && self.class_code.map_or(true, |c| c == id.class_code)
    }
}

impl FromStr for IdFilter {
    type Err = PciError;

    fn from_str(s: &str) -> Result<Self> {
        let parse = || -> std::result::Result<Self, &'static str> {
            let (vendor, rest) = s.split_once(':').ok_or("':' expected")?;
            let (device, class) = match rest.split_once(':') {
                Some((device, class)) => (device, Some(class)),
                None => (rest, None),
            };

            Ok(IdFilter {
                vendor: filter_field(Some(vendor), 0xffff, "invalid vendor id")?.map(|v| v as u16),
                device: filter_field(Some(device), 0xffff, "invalid device id")?.map(|v| v as u16),
                class_code: filter_field(class, 0xffff, "invalid class code")?.map(|v| v as u16),
            })
        };

        parse().map_err(|reason| PciError::InvalidId {
            id: s.to_string(),
            reason,
        })
    }
}

impl TryFrom<String> for IdFilter {
    type Error = PciError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Selects PCI functions by slot and/or id. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PciFilter {
    #[serde(default)]
    pub slot: Option<SlotFilter>,
    #[serde(default)]
    pub id: Option<IdFilter>,
}

impl PciFilter {
    pub fn matches(&self, device: &PciDevice) -> bool {
        self.slot.as_ref().map_or(true, |f| f.matches(&device.slot))
            && self.id.as_ref().map_or(true, |f| f.matches(&device.id))
    }
}

/// One line of the sysfs `resource` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciRegion {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub flags: u64,
}

impl PciRegion {
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone)]
pub struct PciDevice {
    pub slot: PciSlot,
    pub id: PciId,
    pub sysfs_path: PathBuf,
}

impl PciDevice {
    /// Read vendor, device and class of the function at `slot` below `root`
    /// (normally [`PCI_DEVICES_PATH`]).
    pub fn from_slot(root: &Path, slot: PciSlot) -> Result<Self> {
        let sysfs_path = root.join(slot.to_string());

        let vendor = read_hex(&sysfs_path.join("vendor"))?;
        let device = read_hex(&sysfs_path.join("device"))?;
        let class = read_hex(&sysfs_path.join("class"))?;

        let id = PciId {
            vendor: vendor as u16,
            device: device as u16,
            class_code: (class >> 8) as u16,
        };

        debug!(slot = %slot, id = %id, class = id.class_code, "read PCI device");

        Ok(Self {
            slot,
            id,
            sysfs_path,
        })
    }

    /// All functions below `root`, ordered by slot. Entries whose name is not
    /// a PCI address are skipped.
    pub fn scan(root: &Path) -> Result<Vec<Self>> {
        let mut devices = Vec::new();

        for entry in fs::read_dir(root).map_err(io_error(root))? {
            let entry = entry.map_err(io_error(root))?;
            let name = entry.file_name();
            let Ok(slot) = name.to_string_lossy().parse::<PciSlot>() else {
                debug!(entry = %name.to_string_lossy(), "skipping non-PCI sysfs entry");
                continue;
            };
            devices.push(Self::from_slot(root, slot)?);
        }

        devices.sort_by_key(|device| device.slot);
        Ok(devices)
    }

    /// Functions below `root` accepted by any of `filters`.
    pub fn lookup(root: &Path, filters: &[PciFilter]) -> Result<Vec<Self>> {
        Ok(Self::scan(root)?
            .into_iter()
            .filter(|device| filters.iter().any(|filter| filter.matches(device)))
            .collect())
    }

    /// Name of the bound kernel driver, if any.
    pub fn driver(&self) -> Option<String> {
        link_name(&self.sysfs_path.join("driver"))
    }

    pub fn iommu_group(&self) -> Result<u32> {
        link_name(&self.sysfs_path.join("iommu_group"))
            .and_then(|group| group.parse().ok())
            .ok_or(PciError::NoIommuGroup(self.slot))
    }

    /// Hand the function over to `driver` via `driver_override`.
    pub fn bind_driver(&self, driver: &str) -> Result<()> {
        let current = self.driver();
        if current.as_deref() == Some(driver) {
            debug!(slot = %self.slot, driver, "driver already bound");
            return Ok(());
        }

        let slot = self.slot.to_string();

        if current.is_some() {
            let unbind = self.sysfs_path.join("driver").join("unbind");
            fs::write(&unbind, &slot).map_err(io_error(&unbind))?;
        }

        let override_path = self.sysfs_path.join("driver_override");
        fs::write(&override_path, driver).map_err(io_error(&override_path))?;

        if let Some(bus) = self.sysfs_path.parent().and_then(Path::parent) {
            let probe = bus.join("drivers_probe");
            fs::write(&probe, &slot).map_err(io_error(&probe))?;
        }

        info!(slot = %self.slot, driver, previous = ?current, "bound PCI device to driver");
        Ok(())
    }

    /// BAR and ROM windows with a non-empty range.
    pub fn regions(&self) -> Result<Vec<PciRegion>> {
        let path = self.sysfs_path.join("resource");
        let content = fs::read_to_string(&path).map_err(io_error(&path))?;

        let regions = content
            .lines()
            .take(MAX_RESOURCE_REGIONS)
            .enumerate()
            .filter_map(|(index, line)| {
                let mut tokens = line
                    .split_whitespace()
                    .map(|token| u64::from_str_radix(token.trim_start_matches("0x"), 16));
                let start = tokens.next()?.ok()?;
                let end = tokens.next()?.ok()?;
                let flags = tokens.next()?.ok()?;
                (start != end).then_some(PciRegion {
                    index,
                    start,
                    end,
                    flags,
                })
            })
            .collect();

        Ok(regions)
    }

    /// Base address the host assigned to `bar`, from the sysfs `resource` file.
    pub fn read_host_bar(&self, bar: usize) -> Result<u32> {
        let invalid = |reason| PciError::InvalidBar {
            slot: self.slot,
            bar,
            reason,
        };

        let path = self.sysfs_path.join("resource");
        let content = fs::read_to_string(&path).map_err(io_error(&path))?;
        let line = content
            .lines()
            .nth(bar)
            .ok_or_else(|| invalid("missing from resource file"))?;

        let fields: Vec<u64> = line
            .split_whitespace()
            .map(|token| u64::from_str_radix(token.trim_start_matches("0x"), 16))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| invalid("malformed resource line"))?;
        let [start, end, flags] = fields[..] else {
            return Err(invalid("malformed resource line"));
        };
        if end <= start {
            return Err(invalid("not assigned by the host"));
        }

        debug!(
            slot = %self.slot,
            bar,
            start,
            end,
            size = end - start + 1,
            flags,
            "read host BAR"
        );
        Ok(start as u32)
    }

    /// Raw BAR register as currently held in configuration space.
    pub fn read_bar(&self, bar: usize) -> Result<u32> {
        let path = self.sysfs_path.join("config");
        let file = File::open(&path).map_err(io_error(&path))?;

        let mut raw = [0u8; std::mem::size_of::<u32>()];
        let read = nix::sys::uio::pread(&file, &mut raw, bar_offset(bar))
            .map_err(|errno| io_error(&path)(errno.into()))?;
        if read != raw.len() {
            return Err(PciError::InvalidBar {
                slot: self.slot,
                bar,
                reason: "short configuration space read",
            });
        }
        Ok(u32::from_le_bytes(raw))
    }

    pub fn write_bar(&self, bar: usize, addr: u32) -> Result<()> {
        let path = self.sysfs_path.join("config");
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(io_error(&path))?;

        let raw = addr.to_le_bytes();
        let written = nix::sys::uio::pwrite(&file, &raw, bar_offset(bar))
            .map_err(|errno| io_error(&path)(errno.into()))?;
        if written != raw.len() {
            return Err(PciError::InvalidBar {
                slot: self.slot,
                bar,
                reason: "short configuration space write",
            });
        }
        Ok(())
    }

    /// Restore `bar` in configuration space from the host assignment.
    ///
    /// A reset leaves the register cleared while the kernel still routes the
    /// old window. Returns whether the register had to be rewritten.
    pub fn rewrite_bar(&self, bar: usize) -> Result<bool> {
        let host = self.read_host_bar(bar)?;
        let config = self.read_bar(bar)?;

        if config & !PCI_BASE_ADDRESS_FLAGS_MASK == host & !PCI_BASE_ADDRESS_FLAGS_MASK {
            debug!(slot = %self.slot, bar, addr = host, "BAR is consistent");
            return Ok(false);
        }

        warn!(
            slot = %self.slot,
            bar,
            host,
            config,
            "BAR differs from host assignment, rewriting"
        );
        self.write_bar(bar, host)?;
        Ok(true)
    }
}

fn bar_offset(bar: usize) -> i64 {
    PCI_BASE_ADDRESS_0 + 4 * bar as i64
}

fn read_hex(path: &Path) -> Result<u32> {
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    u32::from_str_radix(text.trim().trim_start_matches("0x"), 16).map_err(|_| PciError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, "not a hex value"),
    })
}

fn link_name(link: &Path) -> Option<String> {
    fs::read_link(link)
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
}

#[cfg(test)]
mod tests;
