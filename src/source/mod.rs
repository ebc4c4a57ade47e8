// ============================================================================
// OS COUNTER SOURCE
// ============================================================================
// Raw counter structures and the capability that produces them. The sampler
// turns these into snapshot documents; nothing here holds state between reads.
// ============================================================================

use std::collections::BTreeMap;
use std::fmt::Debug;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::error::SampleResult;
use crate::snapshot::round_to;

mod procfs;

pub use procfs::ProcfsSource;

// ----------------------------------------------------------------------------
// Counter Source Trait
// ----------------------------------------------------------------------------

/// Access to cumulative OS counters. Every read is a single shot and fails
/// with `PermissionDenied` or `CollectionUnavailable`.
pub trait CounterSource: Send + Sync + Debug {
    /// Host identifier
    fn hostname(&self) -> SampleResult<String>;

    /// Aggregate and per-core tick counters plus scheduler totals
    fn cpu_counters(&self) -> SampleResult<CpuCounters>;

    /// Distinct physical cores, `None` when the topology is not exposed
    fn physical_core_count(&self) -> SampleResult<Option<usize>>;

    /// Per-core frequency; empty when the platform does not report it
    fn cpu_frequencies(&self) -> SampleResult<Vec<CpuFrequency>>;

    fn load_average(&self) -> SampleResult<LoadAverage>;

    fn memory_counters(&self) -> SampleResult<MemoryCounters>;

    /// Mounted non-pseudo filesystems in mount order
    fn mounted_partitions(&self) -> SampleResult<Vec<Partition>>;

    /// Block counts for the filesystem reported as root usage
    fn filesystem_stats(&self) -> SampleResult<FsStats>;

    /// Per-device cumulative I/O counters in kernel order
    fn disk_io_counters(&self) -> SampleResult<Vec<DiskIoCounters>>;

    /// Per-interface cumulative I/O counters
    fn net_io_counters(&self) -> SampleResult<BTreeMap<CompactString, NetIoCounters>>;

    /// Per-interface link state
    fn net_if_stats(&self) -> SampleResult<BTreeMap<CompactString, NetIfStats>>;
}

// ----------------------------------------------------------------------------
// CPU Counters
// ----------------------------------------------------------------------------

/// Clock ticks spent in each state since boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTicks {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    /// Already counted in `user`
    pub guest: u64,
    /// Already counted in `nice`
    pub guest_nice: u64,
}

impl CpuTicks {
    /// Total ticks across all modes.
    pub fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle
            + self.iowait + self.irq + self.softirq + self.steal
    }

    /// Active (non-idle) ticks.
    pub fn busy(&self) -> u64 {
        self.total().saturating_sub(self.idle + self.iowait)
    }

    /// Ticks accrued between `earlier` and `self`, per state.
    pub fn since(&self, earlier: &CpuTicks) -> CpuTicks {
        CpuTicks {
            user: self.user.saturating_sub(earlier.user),
            nice: self.nice.saturating_sub(earlier.nice),
            system: self.system.saturating_sub(earlier.system),
            idle: self.idle.saturating_sub(earlier.idle),
            iowait: self.iowait.saturating_sub(earlier.iowait),
            irq: self.irq.saturating_sub(earlier.irq),
            softirq: self.softirq.saturating_sub(earlier.softirq),
            steal: self.steal.saturating_sub(earlier.steal),
            guest: self.guest.saturating_sub(earlier.guest),
            guest_nice: self.guest_nice.saturating_sub(earlier.guest_nice),
        }
    }

    /// Share of busy ticks, one decimal.
    pub fn busy_percent(&self) -> f64 {
        percent_of(self.busy(), self.total())
    }

    pub fn to_seconds(&self, ticks_per_second: u64) -> CpuTimes {
        let hz = ticks_per_second.max(1) as f64;
        let secs = |ticks: u64| round_to(ticks as f64 / hz, 2);
        CpuTimes {
            user: secs(self.user),
            nice: secs(self.nice),
            system: secs(self.system),
            idle: secs(self.idle),
            iowait: secs(self.iowait),
            irq: secs(self.irq),
            softirq: secs(self.softirq),
            steal: secs(self.steal),
            guest: secs(self.guest),
            guest_nice: secs(self.guest_nice),
        }
    }

    /// Time-in-state breakdown as percentages of total ticks.
    pub fn to_percentages(&self) -> CpuTimes {
        let total = self.total();
        let pct = |ticks: u64| percent_of(ticks, total);
        CpuTimes {
            user: pct(self.user),
            nice: pct(self.nice),
            system: pct(self.system),
            idle: pct(self.idle),
            iowait: pct(self.iowait),
            irq: pct(self.irq),
            softirq: pct(self.softirq),
            steal: pct(self.steal),
            guest: pct(self.guest),
            guest_nice: pct(self.guest_nice),
        }
    }
}

fn percent_of(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round_to(part as f64 / total as f64 * 100.0, 1)
}

/// Per-state values in either seconds or percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuTimes {
    pub user: f64,
    pub nice: f64,
    pub system: f64,
    pub idle: f64,
    pub iowait: f64,
    pub irq: f64,
    pub softirq: f64,
    pub steal: f64,
    pub guest: f64,
    pub guest_nice: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuStats {
    pub ctx_switches: u64,
    pub interrupts: u64,
    pub soft_interrupts: u64,
    /// Not exposed on Linux, always 0
    pub syscalls: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuCounters {
    pub ticks_per_second: u64,
    pub total: CpuTicks,
    pub per_core: Vec<CpuTicks>,
    pub stats: CpuStats,
}

/// MHz
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuFrequency {
    pub current: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

// ----------------------------------------------------------------------------
// Memory Counters
// ----------------------------------------------------------------------------

/// Bytes, straight from the kernel's accounting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryCounters {
    pub total: u64,
    pub free: u64,
    /// Missing on kernels older than 3.14
    pub available: Option<u64>,
    pub buffers: u64,
    pub cached: u64,
    pub reclaimable: u64,
    pub shared: u64,
    pub active: u64,
    pub inactive: u64,
    pub swap_total: u64,
    pub swap_free: u64,
    pub swap_in: u64,
    pub swap_out: u64,
}

// ----------------------------------------------------------------------------
// Disk Counters
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub opts: String,
}

/// `statvfs(3)` block counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStats {
    pub fragment_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskIoCounters {
    pub disk: CompactString,
    pub read_count: u64,
    pub write_count: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    /// Milliseconds
    pub read_time: u64,
    pub write_time: u64,
    pub read_merged_count: u64,
    pub write_merged_count: u64,
    pub busy_time: u64,
}

// ----------------------------------------------------------------------------
// Network Counters
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetIoCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errin: u64,
    pub errout: u64,
    pub dropin: u64,
    pub dropout: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Duplex {
    Full,
    Half,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetIfStats {
    pub isup: bool,
    pub duplex: Duplex,
    /// Mbit/s, 0 when unknown
    pub speed: u64,
    pub mtu: u32,
}
