//! Host inspection: live metrics and the hardware/software profile.
//!
//! The runtime only sees [`SystemInspector`]; [`HostInspector`] reads the
//! Linux `/proc` and `/sys` trees and reports empty data elsewhere.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use fleet_proto::{
    DiskInfo, HardwareProfile, NicInfo, SoftwareInventory, SystemMetrics, SystemProfile,
};

/// Source of the data an agent reports about its host.
pub trait SystemInspector: Send + Sync {
    /// Point-in-time metrics attached to every check-in.
    fn collect_metrics(&self) -> Result<SystemMetrics>;

    /// Slow-changing inventory sent with `ReportProfile`.
    fn collect_profile(&self) -> Result<SystemProfile>;
}

/// Machine hostname, or an empty string if it cannot be read.
pub fn hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `os/arch` in the naming agents report, e.g. `linux/amd64`.
pub fn platform() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    format!("{}/{}", std::env::consts::OS, arch)
}

/// Inspector for the machine the agent runs on.
#[derive(Default)]
pub struct HostInspector {
    /// Previous `/proc/stat` sample as (idle, total) jiffies.
    last_cpu: Mutex<Option<(u64, u64)>>,
}

impl HostInspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// CPU busy percentage since the previous call; 0 on the first.
    fn cpu_percent(&self) -> Result<f64> {
        let (idle, total) = parse_proc_stat(&read("/proc/stat")?)?;
        let mut last = self
            .last_cpu
            .lock()
            .map_err(|_| anyhow::anyhow!("cpu sample lock poisoned"))?;
        let percent = match *last {
            Some((prev_idle, prev_total)) if total > prev_total => {
                let total_delta = (total - prev_total) as f64;
                let idle_delta = idle.saturating_sub(prev_idle) as f64;
                ((total_delta - idle_delta) / total_delta * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };
        *last = Some((idle, total));
        Ok(percent)
    }
}

impl SystemInspector for HostInspector {
    fn collect_metrics(&self) -> Result<SystemMetrics> {
        if !cfg!(target_os = "linux") {
            return Ok(SystemMetrics::default());
        }

        let memory = parse_meminfo(&read("/proc/meminfo")?)?;
        Ok(SystemMetrics {
            cpu_percent: self.cpu_percent()?,
            memory_percent: memory.percent(),
            memory_used_bytes: memory.used,
            memory_total_bytes: memory.total,
            load_average_1m: parse_loadavg(&read("/proc/loadavg")?)?,
            uptime_seconds: parse_uptime(&read("/proc/uptime")?)?,
            ..SystemMetrics::default()
        })
    }

    fn collect_profile(&self) -> Result<SystemProfile> {
        if !cfg!(target_os = "linux") {
            return Ok(SystemProfile::default());
        }

        let logical = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let cpuinfo = read("/proc/cpuinfo").unwrap_or_default();
        let cpu = parse_cpuinfo(&cpuinfo, logical);
        let memory = parse_meminfo(&read("/proc/meminfo")?)?;
        let os = parse_os_release(&read("/etc/os-release").unwrap_or_default());

        let hardware = HardwareProfile {
            cpu_model: cpu.model,
            cpu_cores: i32::try_from(cpu.cores).unwrap_or(i32::MAX),
            cpu_threads: i32::try_from(cpu.threads).unwrap_or(i32::MAX),
            ram_bytes: memory.total,
            disks: block_devices(Path::new("/sys/block")),
            nics: network_interfaces(Path::new("/sys/class/net")),
            system_manufacturer: read_trimmed("/sys/class/dmi/id/sys_vendor"),
            system_model: read_trimmed("/sys/class/dmi/id/product_name"),
        };
        let software = SoftwareInventory {
            os_name: os.name,
            os_version: os.version,
            kernel_version: read_trimmed("/proc/sys/kernel/osrelease"),
            packages: Vec::new(),
        };

        Ok(SystemProfile {
            hardware: Some(hardware),
            software: Some(software),
            services: Vec::new(),
        })
    }
}

fn read(path: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))
}

fn read_trimmed(path: impl AsRef<Path>) -> String {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Aggregate `cpu` line of `/proc/stat` as (idle + iowait, total) jiffies.
fn parse_proc_stat(content: &str) -> Result<(u64, u64)> {
    let Some(line) = content.lines().find(|l| l.starts_with("cpu ")) else {
        bail!("no aggregate cpu line in /proc/stat");
    };
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(str::parse)
        .collect::<Result<_, _>>()
        .context("malformed cpu line")?;
    if fields.len() < 4 {
        bail!("cpu line has {} fields, expected at least 4", fields.len());
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Ok((idle, fields.iter().sum()))
}

#[derive(Debug, PartialEq)]
struct Memory {
    total: u64,
    used: u64,
}

impl Memory {
    fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f64 / self.total as f64 * 100.0
        }
    }
}

/// Total and used bytes from `/proc/meminfo`.
///
/// Kernels without `MemAvailable` count free + buffers + cached as available.
fn parse_meminfo(content: &str) -> Result<Memory> {
    let mut total = None;
    let mut available = None;
    let (mut free, mut buffers, mut cached) = (0, 0, 0);

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(kib) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "MemTotal:" => total = Some(kib),
            "MemAvailable:" => available = Some(kib),
            "MemFree:" => free = kib,
            "Buffers:" => buffers = kib,
            "Cached:" => cached = kib,
            _ => {}
        }
    }

    let Some(total) = total else {
        bail!("MemTotal missing from /proc/meminfo");
    };
    let available = available.unwrap_or(free + buffers + cached);
    Ok(Memory {
        total: total * 1024,
        used: total.saturating_sub(available) * 1024,
    })
}

fn parse_loadavg(content: &str) -> Result<f64> {
    content
        .split_whitespace()
        .next()
        .context("empty /proc/loadavg")?
        .parse()
        .context("malformed /proc/loadavg")
}

fn parse_uptime(content: &str) -> Result<u64> {
    let seconds: f64 = content
        .split_whitespace()
        .next()
        .context("empty /proc/uptime")?
        .parse()
        .context("malformed /proc/uptime")?;
    Ok(seconds as u64)
}

#[derive(Debug, PartialEq)]
struct CpuInfo {
    model: String,
    cores: usize,
    threads: usize,
}

/// Model name and physical core count from `/proc/cpuinfo`.
///
/// Physical cores are distinct (physical id, core id) pairs; without them
/// the logical count is used.
fn parse_cpuinfo(content: &str, logical: usize) -> CpuInfo {
    let mut model = String::new();
    let mut cores = HashSet::new();
    let mut physical_id = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "model name" | "Model" if model.is_empty() => model = value.to_string(),
            "physical id" => physical_id = Some(value.to_string()),
            "core id" => {
                cores.insert((physical_id.clone().unwrap_or_default(), value.to_string()));
            }
            _ => {}
        }
    }

    CpuInfo {
        model,
        cores: if cores.is_empty() { logical } else { cores.len() },
        threads: logical,
    }
}

#[derive(Debug, Default, PartialEq)]
struct OsRelease {
    name: String,
    version: String,
}

fn parse_os_release(content: &str) -> OsRelease {
    let mut release = OsRelease::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key {
            "NAME" => release.name = value,
            "VERSION_ID" => release.version = value,
            _ => {}
        }
    }
    release
}

fn block_devices(root: &Path) -> Vec<DiskInfo> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut disks: Vec<DiskInfo> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
                return None;
            }
            let sectors: u64 = read_trimmed(entry.path().join("size")).parse().ok()?;
            Some(DiskInfo {
                disk_type: classify_disk(&name, &read_trimmed(entry.path().join("queue/rotational"))),
                model: read_trimmed(entry.path().join("device/model")),
                size_bytes: sectors * 512,
                name,
            })
        })
        .collect();
    disks.sort_by(|a, b| a.name.cmp(&b.name));
    disks
}

fn classify_disk(name: &str, rotational: &str) -> String {
    if name.starts_with("nvme") {
        "NVMe"
    } else if rotational == "1" {
        "HDD"
    } else if rotational == "0" {
        "SSD"
    } else {
        "Unknown"
    }
    .to_string()
}

fn network_interfaces(root: &Path) -> Vec<NicInfo> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut nics: Vec<NicInfo> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "lo" {
                return None;
            }
            Some(NicInfo {
                mac_address: read_trimmed(entry.path().join("address")),
                // negative when the link is down
                speed_mbps: read_trimmed(entry.path().join("speed")).parse().unwrap_or(0),
                ip_addresses: Vec::new(),
                name,
            })
        })
        .collect();
    nics.sort_by(|a, b| a.name.cmp(&b.name));
    nics
}
