//! Hardware fact probing
//!
//! Reads CPU identifier, GPU vendors, storage classes and total memory from
//! procfs/sysfs and compares them to an expected [`HardwareProfile`].
//!
//! # Design
//!
//! - **Never fails**: anything unreadable becomes `"unknown"`
//! - **Pure reads**: no shelling out, no writes
//! - **Soft gate**: a mismatch is a warning; the orchestrator may relabel
//!   hardware-dependent package groups as non-critical but never drops steps

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Value reported when a fact cannot be queried.
pub const UNKNOWN: &str = "unknown";

/// The facts the probe knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum FactKind {
    Cpu,
    Gpu,
    Storage,
    Memory,
}

/// Expected host profile. Unset entries match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareProfile {
    /// Substring of the CPU model name, e.g. `"AMD Ryzen"`.
    #[serde(default)]
    pub cpu: Option<String>,
    /// GPU vendor, e.g. `"nvidia"`.
    #[serde(default)]
    pub gpu: Option<String>,
    /// Storage class that must be present: `nvme`, `ssd` or `hdd`.
    #[serde(default)]
    pub storage: Option<String>,
    /// Total memory in GiB; `">=16"` expresses a minimum.
    #[serde(default)]
    pub memory: Option<String>,
}

impl HardwareProfile {
    pub fn expected(&self, kind: FactKind) -> Option<&str> {
        match kind {
            FactKind::Cpu => self.cpu.as_deref(),
            FactKind::Gpu => self.gpu.as_deref(),
            FactKind::Storage => self.storage.as_deref(),
            FactKind::Memory => self.memory.as_deref(),
        }
    }
}

/// One probed fact compared against its expectation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareFact {
    pub name: FactKind,
    pub detected_value: String,
    /// `None` when the profile had no expectation for this fact.
    pub expected_value: Option<String>,
    #[serde(rename = "match")]
    pub matches: bool,
}

impl HardwareFact {
    fn compare(name: FactKind, detected_value: String, expected: Option<&str>) -> Self {
        let matches = match expected {
            None => true,
            Some(want) => value_matches(name, &detected_value, want),
        };
        Self {
            name,
            detected_value,
            expected_value: expected.map(str::to_string),
            matches,
        }
    }
}

impl fmt::Display for HardwareFact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.expected_value {
            Some(want) => write!(
                f,
                "{}: {} (expected {}) {}",
                self.name,
                self.detected_value,
                want,
                if self.matches { "ok" } else { "MISMATCH" }
            ),
            None => write!(f, "{}: {}", self.name, self.detected_value),
        }
    }
}

/// Substring test, case-insensitive. Memory additionally accepts `>=N`.
fn value_matches(kind: FactKind, detected: &str, expected: &str) -> bool {
    if detected == UNKNOWN {
        return false;
    }
    let expected = expected.trim();
    if kind == FactKind::Memory {
        if let Some(min) = expected.strip_prefix(">=") {
            let have = detected.split_whitespace().next().and_then(|n| n.parse::<u64>().ok());
            let want = min.trim().parse::<u64>().ok();
            return matches!((have, want), (Some(h), Some(w)) if h >= w);
        }
    }
    detected.to_lowercase().contains(&expected.to_lowercase())
}

/// Reads host facts from procfs and sysfs.
#[derive(Debug, Clone)]
pub struct HardwareProbe {
    proc_root: PathBuf,
    sys_root: PathBuf,
}

impl Default for HardwareProbe {
    fn default() -> Self {
        Self::with_roots("/proc", "/sys")
    }
}

impl HardwareProbe {
    /// Probe a different procfs/sysfs tree (used by tests).
    pub fn with_roots(proc_root: impl Into<PathBuf>, sys_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
        }
    }

    /// Read every fact and compare it to `profile`.
    pub fn probe(&self, profile: &HardwareProfile) -> Vec<HardwareFact> {
        let facts: Vec<HardwareFact> = FactKind::iter()
            .map(|kind| HardwareFact::compare(kind, self.detect(kind), profile.expected(kind)))
            .collect();

        for fact in &facts {
            if fact.matches {
                tracing::info!(fact = %fact.name, value = %fact.detected_value, "hardware fact");
            } else {
                tracing::warn!(
                    fact = %fact.name,
                    detected = %fact.detected_value,
                    expected = fact.expected_value.as_deref().unwrap_or(""),
                    "hardware does not match expected profile"
                );
            }
        }

        facts
    }

    /// Read a single fact; `"unknown"` if it cannot be determined.
    pub fn detect(&self, kind: FactKind) -> String {
        let value = match kind {
            FactKind::Cpu => self.cpu_model(),
            FactKind::Gpu => self.gpu_vendors(),
            FactKind::Storage => self.storage_classes(),
            FactKind::Memory => self.memory_gib(),
        };
        value.unwrap_or_else(|| UNKNOWN.to_string())
    }

    fn cpu_model(&self) -> Option<String> {
        let cpuinfo = fs::read_to_string(self.proc_root.join("cpuinfo")).ok()?;
        parse_cpu_model(&cpuinfo)
    }

    fn memory_gib(&self) -> Option<String> {
        let meminfo = fs::read_to_string(self.proc_root.join("meminfo")).ok()?;
        parse_mem_total_gib(&meminfo).map(|gib| format!("{gib} GiB"))
    }

    /// Vendors of every DRM card, e.g. `"intel,nvidia"`.
    fn gpu_vendors(&self) -> Option<String> {
        let drm = self.sys_root.join("class/drm");
        let mut vendors = BTreeSet::new();
        for entry in fs::read_dir(drm).ok()?.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // card0, card1, ... but not card0-HDMI-A-1 connectors
            if !name.starts_with("card") || name.contains('-') {
                continue;
            }
            if let Ok(id) = fs::read_to_string(entry.path().join("device/vendor")) {
                vendors.insert(pci_vendor_name(id.trim()));
            }
        }
        join_non_empty(vendors)
    }

    /// Storage classes present among block devices, e.g. `"nvme,ssd"`.
    fn storage_classes(&self) -> Option<String> {
        let block = self.sys_root.join("block");
        let mut classes = BTreeSet::new();
        for entry in fs::read_dir(block).ok()?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_virtual_block_device(&name) {
                continue;
            }
            if name.starts_with("nvme") {
                classes.insert("nvme");
            }
            match read_trimmed(&entry.path().join("queue/rotational")).as_deref() {
                Some("0") => {
                    classes.insert("ssd");
                }
                Some("1") => {
                    classes.insert("hdd");
                }
                _ => {}
            }
        }
        join_non_empty(classes)
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn join_non_empty<I, S>(items: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined: Vec<String> = items.into_iter().map(|s| s.as_ref().to_string()).collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined.join(","))
    }
}

fn is_virtual_block_device(name: &str) -> bool {
    ["loop", "ram", "zram", "dm-", "sr", "md"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// First `model name` line of `/proc/cpuinfo`.
pub fn parse_cpu_model(cpuinfo: &str) -> Option<String> {
    cpuinfo
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim() == "model name")
        .map(|(_, value)| value.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `MemTotal` from `/proc/meminfo`, rounded to the nearest GiB.
pub fn parse_mem_total_gib(meminfo: &str) -> Option<u64> {
    let kib: u64 = meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))?
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    const KIB_PER_GIB: u64 = 1024 * 1024;
    Some((kib + KIB_PER_GIB / 2) / KIB_PER_GIB)
}

/// Map a PCI vendor id (`0x10de`) to a vendor name.
pub fn pci_vendor_name(id: &str) -> String {
    match id.to_lowercase().as_str() {
        "0x10de" => "nvidia".to_string(),
        "0x1002" | "0x1022" => "amd".to_string(),
        "0x8086" => "intel".to_string(),
        "0x1af4" => "virtio".to_string(),
        "0x15ad" => "vmware".to_string(),
        other => other.to_string(),
    }
}
