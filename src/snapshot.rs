//! Snapshot documents, one per metric category.
//!
//! Field names are the wire names: a snapshot serializes to a self-describing
//! JSON object and consumers key on these names.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::rates::RateRecord;
use crate::source::{
    CpuFrequency, CpuStats, CpuTimes, DiskIoCounters, LoadAverage, NetIfStats, NetIoCounters,
    Partition,
};

// ----------------------------------------------------------------------------
// Categories
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl Category {
    /// Registration order used by the scheduler
    pub const ALL: [Category; 4] = [
        Category::Cpu,
        Category::Memory,
        Category::Disk,
        Category::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Cpu => "cpu",
            Category::Memory => "memory",
            Category::Disk => "disk",
            Category::Network => "network",
        }
    }

    pub fn default_channel(&self) -> &'static str {
        match self {
            Category::Cpu => "cpu_stats",
            Category::Memory => "memory_stats",
            Category::Disk => "disk_stats",
            Category::Network => "network_stats",
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(Category::Cpu),
            "memory" | "mem" => Ok(Category::Memory),
            "disk" => Ok(Category::Disk),
            "network" | "net" => Ok(Category::Network),
            other => Err(format!("unknown category '{}'", other)),
        }
    }
}

/// Seconds since the Unix epoch with microsecond precision.
pub fn unix_timestamp(now: DateTime<Utc>) -> f64 {
    now.timestamp_micros() as f64 / 1_000_000.0
}

/// Round half away from zero to `places` decimals.
pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

// ----------------------------------------------------------------------------
// Snapshot
// ----------------------------------------------------------------------------

/// One timestamped reading of a category. Serialized without a tag: the
/// channel already identifies the category.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Snapshot {
    Cpu(CpuSnapshot),
    Memory(MemorySnapshot),
    Disk(DiskSnapshot),
    Network(NetworkSnapshot),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuSnapshot {
    pub timestamp: f64,
    pub host: String,
    pub cpu_count: usize,
    /// `None` when the core topology is not exposed
    pub physical_cpu_count: Option<usize>,
    pub cpu_frequency: Vec<CpuFrequency>,
    pub cpu_overall_percentage: f64,
    pub cpu_percentage: Vec<f64>,
    pub cpu_stats: CpuStats,
    /// Cumulative seconds per state
    pub cpu_times: CpuTimes,
    pub cpu_times_percentage: CpuTimes,
    pub cpu_load_average: LoadAverage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySnapshot {
    pub timestamp: f64,
    pub memory_usage: VirtualMemory,
    pub memory_swap: SwapMemory,
}

/// Physical memory in bytes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMemory {
    pub total: u64,
    pub available: u64,
    pub percent_used: f64,
    pub used: u64,
    pub free: u64,
    pub active: u64,
    pub inactive: u64,
    pub buffers: u64,
    pub cached: u64,
    pub shared: u64,
}

/// Swap in bytes; `swap_in`/`swap_out` are cumulative since boot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwapMemory {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent_used: f64,
    pub swap_in: u64,
    pub swap_out: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskSnapshot {
    pub timestamp: f64,
    /// Mounted physical filesystems in mount order
    pub disks: Vec<Partition>,
    pub disk_usage: DiskUsage,
    pub disk_io: Vec<DiskIoCounters>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percentage_used: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSnapshot {
    pub timestamp: f64,
    pub network_stats: BTreeMap<CompactString, NetIfStats>,
    pub network_io: BTreeMap<CompactString, NetIoCounters>,
    /// Empty until a previous sample exists for the interface
    pub upload_download: BTreeMap<CompactString, RateRecord>,
}

impl NetworkSnapshot {
    pub fn with_rates(self, upload_download: BTreeMap<CompactString, RateRecord>) -> Self {
        Self {
            upload_download,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_category_channels() {
        let channels: Vec<_> = Category::ALL.iter().map(|c| c.default_channel()).collect();
        assert_eq!(channels, ["cpu_stats", "memory_stats", "disk_stats", "network_stats"]);
    }

    #[test]
    fn test_category_from_str() {
        assert_eq!("NET".parse::<Category>(), Ok(Category::Network));
        assert!("gpu".parse::<Category>().is_err());
    }

    #[test]
    fn test_unix_timestamp_precision() {
        let now = Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap();
        assert_eq!(unix_timestamp(now), 1_700_000_000.25);
    }

    #[test]
    fn test_memory_snapshot_field_names() {
        let snapshot = Snapshot::Memory(MemorySnapshot {
            timestamp: 1.5,
            memory_usage: VirtualMemory { total: 100, ..Default::default() },
            memory_swap: SwapMemory::default(),
        });

        // Untagged: the document is the bare memory object.
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["timestamp"], 1.5);
        assert_eq!(value["memory_usage"]["total"], 100);
        assert!(value["memory_swap"].get("swap_in").is_some());
        assert!(value.get("Memory").is_none());
    }

    #[test]
    fn test_with_rates_keeps_counters() {
        let mut io = BTreeMap::new();
        let eth0 = NetIoCounters { bytes_sent: 10, ..Default::default() };
        io.insert(CompactString::from("eth0"), eth0);
        let snapshot = NetworkSnapshot {
            timestamp: 0.0,
            network_stats: BTreeMap::new(),
            network_io: io,
            upload_download: BTreeMap::new(),
        };

        let mut rates = BTreeMap::new();
        rates.insert(CompactString::from("eth0"), RateRecord::default());
        let snapshot = snapshot.with_rates(rates);

        assert_eq!(snapshot.network_io["eth0"].bytes_sent, 10);
        assert_eq!(snapshot.upload_download.len(), 1);
    }
}
