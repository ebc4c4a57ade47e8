//! Linux counter source - reads directly from /proc and /sys.

use std::collections::{BTreeMap, HashSet};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use compact_str::CompactString;
use tracing::trace;

use super::{
    CounterSource, CpuCounters, CpuFrequency, CpuStats, CpuTicks, DiskIoCounters, Duplex,
    FsStats, LoadAverage, MemoryCounters, NetIfStats, NetIoCounters, Partition,
};
use crate::config::SourceConfig;
use crate::error::{SampleError, SampleResult};

/// Fallback when `sysconf(_SC_CLK_TCK)` is unavailable
const DEFAULT_TICKS_PER_SECOND: u64 = 100;

/// Fallback when `sysconf(_SC_PAGESIZE)` is unavailable
const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Sector size in bytes used by /proc/diskstats.
const SECTOR_SIZE: u64 = 512;

const IFF_UP: u32 = 0x1;

/// Filesystems treated as pseudo when /proc/filesystems cannot be read.
const VIRTUAL_FS: &[&str] = &[
    "proc", "sysfs", "devtmpfs", "tmpfs", "cgroup", "cgroup2",
    "pstore", "mqueue", "hugetlbfs", "debugfs", "tracefs", "securityfs",
    "configfs", "fusectl", "binfmt_misc", "devpts", "autofs", "overlay",
    "squashfs", "nsfs", "rpc_pipefs", "nfsd", "fuse.lxcfs",
];

/// Reads counters from a procfs/sysfs tree. The roots are configurable so the
/// source can run against a container's host mounts or a test fixture.
#[derive(Debug, Clone)]
pub struct ProcfsSource {
    proc_root: PathBuf,
    sys_root: PathBuf,
    usage_path: PathBuf,
    ticks_per_second: u64,
    page_size: u64,
}

impl ProcfsSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            proc_root: config.proc_root.clone(),
            sys_root: config.sys_root.clone(),
            usage_path: config.usage_path.clone(),
            ticks_per_second: sysconf_or(libc::_SC_CLK_TCK, DEFAULT_TICKS_PER_SECOND),
            page_size: sysconf_or(libc::_SC_PAGESIZE, DEFAULT_PAGE_SIZE),
        }
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_ticks_per_second(mut self, ticks_per_second: u64) -> Self {
        self.ticks_per_second = ticks_per_second;
        self
    }

    fn read_proc(&self, relative: &str) -> SampleResult<String> {
        read_file(&self.proc_root.join(relative))
    }

    fn read_sys(&self, relative: impl AsRef<Path>) -> SampleResult<String> {
        read_file(&self.sys_root.join(relative))
    }

    fn scaling_frequencies(&self) -> Vec<CpuFrequency> {
        let cpu_dir = self.sys_root.join("devices/system/cpu");
        let entries = match fs::read_dir(&cpu_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut cores: Vec<(u32, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let index = name.to_str()?.strip_prefix("cpu")?.parse().ok()?;
                Some((index, entry.path().join("cpufreq")))
            })
            .collect();
        cores.sort_by_key(|(index, _)| *index);

        cores
            .into_iter()
            .filter_map(|(_, dir)| {
                let khz = |file: &str| -> Option<f64> {
                    fs::read_to_string(dir.join(file)).ok()?.trim().parse::<f64>().ok()
                };
                Some(CpuFrequency {
                    current: khz("scaling_cur_freq")? / 1000.0,
                    min: khz("scaling_min_freq").unwrap_or(0.0) / 1000.0,
                    max: khz("scaling_max_freq").unwrap_or(0.0) / 1000.0,
                })
            })
            .collect()
    }

    fn physical_filesystems(&self) -> Option<HashSet<String>> {
        let content = self.read_proc("filesystems").ok()?;
        Some(parse_filesystems(&content))
    }

    fn link_stats(&self, interface: &str) -> NetIfStats {
        let dir = Path::new("class/net").join(interface);
        let read = |file: &str| self.read_sys(dir.join(file)).ok();

        let isup = match read("flags").and_then(|flags| parse_hex(&flags)) {
            Some(flags) => flags & IFF_UP != 0,
            None => read("operstate").map(|s| s.trim() == "up").unwrap_or(false),
        };

        let duplex = match read("duplex").as_deref().map(str::trim) {
            Some("full") => Duplex::Full,
            Some("half") => Duplex::Half,
            _ => Duplex::Unknown,
        };

        // Down links report -1 or refuse the read.
        let speed = read("speed")
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|speed| *speed > 0)
            .unwrap_or(0) as u64;

        let mtu = read("mtu").and_then(|s| s.trim().parse().ok()).unwrap_or(0);

        NetIfStats { isup, duplex, speed, mtu }
    }
}

impl CounterSource for ProcfsSource {
    fn hostname(&self) -> SampleResult<String> {
        let name = self.read_proc("sys/kernel/hostname")?;
        Ok(name.trim().to_string())
    }

    fn cpu_counters(&self) -> SampleResult<CpuCounters> {
        let content = self.read_proc("stat")?;
        let mut counters = parse_stat(&content)
            .ok_or_else(|| SampleError::unavailable("/proc/stat", "no aggregate cpu line"))?;
        counters.ticks_per_second = self.ticks_per_second;
        Ok(counters)
    }

    fn physical_core_count(&self) -> SampleResult<Option<usize>> {
        match self.read_proc("cpuinfo") {
            Ok(content) => Ok(parse_physical_cores(&content)),
            Err(err @ SampleError::PermissionDenied { .. }) => Err(err),
            Err(_) => Ok(None),
        }
    }

    fn cpu_frequencies(&self) -> SampleResult<Vec<CpuFrequency>> {
        let scaling = self.scaling_frequencies();
        if !scaling.is_empty() {
            return Ok(scaling);
        }

        let cpuinfo = match self.read_proc("cpuinfo") {
            Ok(content) => content,
            Err(_) => return Ok(Vec::new()),
        };
        Ok(parse_cpuinfo_mhz(&cpuinfo)
            .into_iter()
            .map(|current| CpuFrequency { current, min: 0.0, max: 0.0 })
            .collect())
    }

    fn load_average(&self) -> SampleResult<LoadAverage> {
        let content = self.read_proc("loadavg")?;
        parse_loadavg(&content)
            .ok_or_else(|| SampleError::unavailable("/proc/loadavg", "malformed"))
    }

    fn memory_counters(&self) -> SampleResult<MemoryCounters> {
        let content = self.read_proc("meminfo")?;
        let meminfo = parse_meminfo(&content);
        let field = |key: &str| meminfo.get(key).copied();
        let total = field("MemTotal")
            .ok_or_else(|| SampleError::unavailable("/proc/meminfo", "MemTotal missing"))?;

        // Swap activity is optional; some containers hide vmstat.
        let (swap_in, swap_out) = match self.read_proc("vmstat") {
            Ok(vmstat) => {
                let vmstat = parse_vmstat(&vmstat);
                let pages = |key: &str| vmstat.get(key).copied().unwrap_or(0);
                (pages("pswpin") * self.page_size, pages("pswpout") * self.page_size)
            }
            Err(err @ SampleError::PermissionDenied { .. }) => return Err(err),
            Err(_) => (0, 0),
        };

        Ok(MemoryCounters {
            total,
            free: field("MemFree").unwrap_or(0),
            available: field("MemAvailable"),
            buffers: field("Buffers").unwrap_or(0),
            cached: field("Cached").unwrap_or(0),
            reclaimable: field("SReclaimable").unwrap_or(0),
            shared: field("Shmem").unwrap_or(0),
            active: field("Active").unwrap_or(0),
            inactive: field("Inactive").unwrap_or(0),
            swap_total: field("SwapTotal").unwrap_or(0),
            swap_free: field("SwapFree").unwrap_or(0),
            swap_in,
            swap_out,
        })
    }

    fn mounted_partitions(&self) -> SampleResult<Vec<Partition>> {
        let mounts = self.read_proc("mounts")?;
        let physical = self.physical_filesystems();
        Ok(parse_mounts(&mounts, physical.as_ref()))
    }

    fn filesystem_stats(&self) -> SampleResult<FsStats> {
        statvfs(&self.usage_path)
    }

    fn disk_io_counters(&self) -> SampleResult<Vec<DiskIoCounters>> {
        let content = self.read_proc("diskstats")?;
        Ok(content.lines().filter_map(parse_diskstats_line).collect())
    }

    fn net_io_counters(&self) -> SampleResult<BTreeMap<CompactString, NetIoCounters>> {
        let content = self.read_proc("net/dev")?;
        Ok(content.lines().filter_map(parse_net_dev_line).collect())
    }

    fn net_if_stats(&self) -> SampleResult<BTreeMap<CompactString, NetIfStats>> {
        let class_net = self.sys_root.join("class/net");
        let entries = fs::read_dir(&class_net)
            .map_err(|e| SampleError::from_io(class_net.display().to_string(), &e))?;

        let mut stats = BTreeMap::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| SampleError::from_io(class_net.display().to_string(), &e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            stats.insert(CompactString::from(name), self.link_stats(name));
        }
        trace!(target: "telemetry::sampler", interfaces = stats.len(), "Read link stats");
        Ok(stats)
    }
}

// ----------------------------------------------------------------------------
// File and syscall helpers
// ----------------------------------------------------------------------------

fn read_file(path: &Path) -> SampleResult<String> {
    fs::read_to_string(path).map_err(|e| SampleError::from_io(path.display().to_string(), &e))
}

fn sysconf_or(name: libc::c_int, fallback: u64) -> u64 {
    let value = unsafe { libc::sysconf(name) };
    if value > 0 {
        value as u64
    } else {
        fallback
    }
}

fn statvfs(path: &Path) -> SampleResult<FsStats> {
    let resource = path.display().to_string();
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| SampleError::unavailable(resource.clone(), e))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(SampleError::from_io(resource, &io::Error::last_os_error()));
    }

    Ok(FsStats {
        fragment_size: stat.f_frsize as u64,
        blocks: stat.f_blocks as u64,
        blocks_free: stat.f_bfree as u64,
        blocks_available: stat.f_bavail as u64,
    })
}

fn parse_hex(value: &str) -> Option<u32> {
    let value = value.trim();
    u32::from_str_radix(value.strip_prefix("0x").unwrap_or(value), 16).ok()
}

// ----------------------------------------------------------------------------
// Parsers
// ----------------------------------------------------------------------------

/// Parse a cpu line from /proc/stat.
/// Format: "cpu0 12345 678 9012 34567 890 12 34 56 0 0"
fn parse_cpu_line(line: &str) -> Option<(CompactString, CpuTicks)> {
    let mut parts = line.split_whitespace();
    let core_id = CompactString::from(parts.next()?);

    if !core_id.starts_with("cpu") {
        return None;
    }

    let mut next = || parts.next().and_then(|s| s.parse::<u64>().ok());
    let user = next()?;
    let nice = next()?;
    let system = next()?;
    let idle = next()?;
    let ticks = CpuTicks {
        user,
        nice,
        system,
        idle,
        iowait: next().unwrap_or(0),
        irq: next().unwrap_or(0),
        softirq: next().unwrap_or(0),
        steal: next().unwrap_or(0),
        guest: next().unwrap_or(0),
        guest_nice: next().unwrap_or(0),
    };
    Some((core_id, ticks))
}

/// First number after the key, e.g. the total in "intr 123 0 4 ...".
fn leading_counter(line: &str) -> u64 {
    line.split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn parse_stat(content: &str) -> Option<CpuCounters> {
    let mut total = None;
    let mut per_core = Vec::new();
    let mut stats = CpuStats::default();

    for line in content.lines() {
        if line.starts_with("cpu") {
            if let Some((core_id, ticks)) = parse_cpu_line(line) {
                if core_id == "cpu" {
                    total = Some(ticks);
                } else {
                    per_core.push(ticks);
                }
            }
        } else if line.starts_with("ctxt ") {
            stats.ctx_switches = leading_counter(line);
        } else if line.starts_with("intr ") {
            stats.interrupts = leading_counter(line);
        } else if line.starts_with("softirq ") {
            stats.soft_interrupts = leading_counter(line);
        }
    }

    Some(CpuCounters {
        ticks_per_second: DEFAULT_TICKS_PER_SECOND,
        total: total?,
        per_core,
        stats,
    })
}

/// Count distinct (physical id, core id) pairs.
fn parse_physical_cores(cpuinfo: &str) -> Option<usize> {
    let mut cores = HashSet::new();
    let mut physical_id: Option<&str> = None;

    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            physical_id = None;
            continue;
        };
        match key.trim() {
            "physical id" => physical_id = Some(value.trim()),
            "core id" => {
                cores.insert((physical_id.unwrap_or("0"), value.trim()));
            }
            _ => {}
        }
    }

    (!cores.is_empty()).then_some(cores.len())
}

fn parse_cpuinfo_mhz(cpuinfo: &str) -> Vec<f64> {
    cpuinfo
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(key, _)| key.trim() == "cpu MHz")
        .filter_map(|(_, value)| value.trim().parse().ok())
        .collect()
}

/// Format: "0.52 0.58 0.59 1/467 12345"
fn parse_loadavg(content: &str) -> Option<LoadAverage> {
    let mut parts = content.split_whitespace().map(|s| s.parse::<f64>().ok());
    Some(LoadAverage {
        one: parts.next()??,
        five: parts.next()??,
        fifteen: parts.next()??,
    })
}

/// /proc/meminfo values converted from kB to bytes.
fn parse_meminfo(content: &str) -> BTreeMap<&str, u64> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(2, ':');
            let key = parts.next()?.trim();
            let rest = parts.next()?.trim();
            let mut value_parts = rest.split_whitespace();
            let value: u64 = value_parts.next()?.parse().ok()?;
            let bytes = match value_parts.next() {
                Some("kB") => value * 1024,
                _ => value,
            };
            Some((key, bytes))
        })
        .collect()
}

fn parse_vmstat(content: &str) -> BTreeMap<&str, u64> {
    content
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(' ')?;
            Some((key, value.trim().parse().ok()?))
        })
        .collect()
}

/// Filesystem types backed by a block device.
fn parse_filesystems(content: &str) -> HashSet<String> {
    content
        .lines()
        .filter(|line| !line.starts_with("nodev"))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

fn parse_mounts(content: &str, physical: Option<&HashSet<String>>) -> Vec<Partition> {
    content
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                return None;
            }
            let (device, mountpoint, fstype, opts) = (parts[0], parts[1], parts[2], parts[3]);

            let keep = match physical {
                Some(types) => types.contains(fstype),
                None => !VIRTUAL_FS.contains(&fstype),
            };
            if !keep || device == "none" {
                return None;
            }

            Some(Partition {
                device: device.to_string(),
                mountpoint: unescape_mount_field(mountpoint),
                fstype: fstype.to_string(),
                opts: opts.to_string(),
            })
        })
        .collect()
}

/// /proc/mounts encodes whitespace as octal escapes ("\040").
fn unescape_mount_field(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Parse a line from /proc/diskstats.
/// Format: "   8       0 sda 12345 678 901234 5678 ..."
fn parse_diskstats_line(line: &str) -> Option<DiskIoCounters> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 14 {
        return None;
    }

    let disk = CompactString::from(parts[2]);
    if disk.starts_with("loop") || disk.starts_with("ram") {
        return None;
    }

    let field = |index: usize| parts[index].parse::<u64>().unwrap_or(0);
    Some(DiskIoCounters {
        disk,
        read_count: field(3),
        read_merged_count: field(4),
        read_bytes: field(5) * SECTOR_SIZE,
        read_time: field(6),
        write_count: field(7),
        write_merged_count: field(8),
        write_bytes: field(9) * SECTOR_SIZE,
        write_time: field(10),
        busy_time: field(12),
    })
}

/// Parse a line from /proc/net/dev.
/// Format: "  eth0: 12345 678 9 0 0 0 0 0 12345 678 9 0 0 0 0 0"
fn parse_net_dev_line(line: &str) -> Option<(CompactString, NetIoCounters)> {
    let line = line.trim();
    let colon_pos = line.find(':')?;
    let interface = CompactString::from(line[..colon_pos].trim());

    let values: Vec<u64> = line[colon_pos + 1..]
        .split_whitespace()
        .filter_map(|s| s.parse().ok())
        .collect();

    if values.len() < 16 {
        return None;
    }

    Some((
        interface,
        NetIoCounters {
            bytes_recv: values[0],
            packets_recv: values[1],
            errin: values[2],
            dropin: values[3],
            bytes_sent: values[8],
            packets_sent: values[9],
            errout: values[10],
            dropout: values[11],
        },
    ))
}
