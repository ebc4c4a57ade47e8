// ============================================================================
// SAMPLER
// ============================================================================
// Turns raw counters into snapshot documents. Every call is a fresh,
// all-or-nothing read: any counter failure yields no snapshot at all.
// CPU utilization is measured over a short window inside the call, so the
// sampler still carries nothing from one cycle to the next.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::SampleResult;
use crate::snapshot::{
    round_to, unix_timestamp, Category, CpuSnapshot, DiskSnapshot, DiskUsage, MemorySnapshot,
    NetworkSnapshot, Snapshot, SwapMemory, VirtualMemory,
};
use crate::source::{CounterSource, CpuTicks, FsStats, MemoryCounters};

/// Host identifier used when neither configuration nor the source has one
const UNKNOWN_HOST: &str = "unknown";

/// Produces one snapshot per category per call.
#[derive(Debug, Clone)]
pub struct Sampler {
    source: Arc<dyn CounterSource>,
    hostname: Option<String>,
    cpu_window: Duration,
}

impl Sampler {
    pub fn new(source: Arc<dyn CounterSource>) -> Self {
        Self {
            source,
            hostname: None,
            cpu_window: Duration::ZERO,
        }
    }

    /// Report `hostname` instead of asking the source.
    pub fn with_hostname(mut self, hostname: Option<String>) -> Self {
        self.hostname = hostname;
        self
    }

    /// Time between the two CPU readings that utilization is computed from.
    pub fn with_cpu_window(mut self, window: Duration) -> Self {
        self.cpu_window = window;
        self
    }

    /// Whether a call may block the thread for the CPU window.
    pub fn blocks(&self) -> bool {
        !self.cpu_window.is_zero()
    }

    /// Sample a single category.
    pub fn sample(&self, category: Category) -> SampleResult<Snapshot> {
        let snapshot = match category {
            Category::Cpu => Snapshot::Cpu(self.sample_cpu()?),
            Category::Memory => Snapshot::Memory(self.sample_memory()?),
            Category::Disk => Snapshot::Disk(self.sample_disk()?),
            Category::Network => Snapshot::Network(self.sample_network()?),
        };
        debug!(target: "telemetry::sampler", category = %category, "Sample taken");
        Ok(snapshot)
    }

    /// Reads the tick counters twice, `cpu_window` apart. Percentages cover
    /// only the ticks accrued in between; `cpu_times` stays cumulative.
    pub fn sample_cpu(&self) -> SampleResult<CpuSnapshot> {
        let before = self.source.cpu_counters()?;
        if !self.cpu_window.is_zero() {
            std::thread::sleep(self.cpu_window);
        }
        let counters = self.source.cpu_counters()?;
        let window = counters.total.since(&before.total);
        let per_core = per_core_window(&before.per_core, &counters.per_core);
        let physical_cpu_count = self.source.physical_core_count()?;
        let cpu_frequency = self.source.cpu_frequencies()?;
        let cpu_load_average = self.source.load_average()?;

        Ok(CpuSnapshot {
            timestamp: unix_timestamp(Utc::now()),
            host: self.host(),
            cpu_count: counters.per_core.len().max(1),
            physical_cpu_count,
            cpu_frequency,
            cpu_overall_percentage: window.busy_percent(),
            cpu_percentage: per_core.iter().map(CpuTicks::busy_percent).collect(),
            cpu_stats: counters.stats,
            cpu_times: counters.total.to_seconds(counters.ticks_per_second),
            cpu_times_percentage: window.to_percentages(),
            cpu_load_average,
        })
    }

    pub fn sample_memory(&self) -> SampleResult<MemorySnapshot> {
        let counters = self.source.memory_counters()?;
        Ok(MemorySnapshot {
            timestamp: unix_timestamp(Utc::now()),
            memory_usage: virtual_memory(&counters),
            memory_swap: swap_memory(&counters),
        })
    }

    pub fn sample_disk(&self) -> SampleResult<DiskSnapshot> {
        let disks = self.source.mounted_partitions()?;
        let usage = self.source.filesystem_stats()?;
        let disk_io = self.source.disk_io_counters()?;

        Ok(DiskSnapshot {
            timestamp: unix_timestamp(Utc::now()),
            disks,
            disk_usage: disk_usage(&usage),
            disk_io,
        })
    }

    /// Link stats and cumulative counters; rates are attached by the caller.
    pub fn sample_network(&self) -> SampleResult<NetworkSnapshot> {
        let network_stats = self.source.net_if_stats()?;
        let network_io = self.source.net_io_counters()?;

        Ok(NetworkSnapshot {
            timestamp: unix_timestamp(Utc::now()),
            network_stats,
            network_io,
            upload_download: BTreeMap::new(),
        })
    }

    fn host(&self) -> String {
        if let Some(hostname) = &self.hostname {
            return hostname.clone();
        }
        match self.source.hostname() {
            Ok(name) if !name.is_empty() => name,
            Ok(_) => {
                warn!(target: "telemetry::sampler", "Empty hostname, reporting '{}'", UNKNOWN_HOST);
                UNKNOWN_HOST.to_string()
            }
            Err(err) => {
                warn!(
                    target: "telemetry::sampler",
                    kind = err.kind(),
                    error = %err,
                    "Hostname unreadable, reporting '{}'",
                    UNKNOWN_HOST
                );
                UNKNOWN_HOST.to_string()
            }
        }
    }
}

/// Per-core ticks over the window. A core that came or went between the two
/// readings has no baseline, so its whole counter is used.
fn per_core_window(before: &[CpuTicks], after: &[CpuTicks]) -> Vec<CpuTicks> {
    after
        .iter()
        .enumerate()
        .map(|(index, now)| match before.get(index) {
            Some(earlier) if before.len() == after.len() => now.since(earlier),
            _ => *now,
        })
        .collect()
}

fn virtual_memory(c: &MemoryCounters) -> VirtualMemory {
    let cached = c.cached + c.reclaimable;
    let available = c.available.unwrap_or(c.free + c.buffers + cached);

    let mut used = c.total as i128 - c.free as i128 - c.buffers as i128 - cached as i128;
    if used < 0 {
        used = c.total as i128 - c.free as i128;
    }

    VirtualMemory {
        total: c.total,
        available,
        percent_used: percent(c.total.saturating_sub(available), c.total),
        used: used.max(0) as u64,
        free: c.free,
        active: c.active,
        inactive: c.inactive,
        buffers: c.buffers,
        cached,
        shared: c.shared,
    }
}

fn swap_memory(c: &MemoryCounters) -> SwapMemory {
    let used = c.swap_total.saturating_sub(c.swap_free);
    SwapMemory {
        total: c.swap_total,
        used,
        free: c.swap_free,
        percent_used: percent(used, c.swap_total),
        swap_in: c.swap_in,
        swap_out: c.swap_out,
    }
}

fn disk_usage(stats: &FsStats) -> DiskUsage {
    let total = stats.blocks * stats.fragment_size;
    let free = stats.blocks_available * stats.fragment_size;
    let used = stats.blocks.saturating_sub(stats.blocks_free) * stats.fragment_size;
    DiskUsage {
        total,
        used,
        free,
        percentage_used: percent(used, used + free),
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round_to(part as f64 / whole as f64 * 100.0, 1)
}
