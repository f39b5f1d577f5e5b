use std::collections::HashSet;
use std::fs;
use std::net::UdpSocket;
use std::path::Path;
use std::time::Instant;

use chrono::Local;
use nix::sys::statvfs::statvfs;
use tracing::debug;

use crate::collector::{
    CpuStats, Disk, DiskStatus, MemoryStats, NetworkStats, StorageStats, SystemSampler, Telemetry,
};
use crate::ServerSettings;

/// Built-in probes, read from procfs and sysfs. CPU usage and network
/// rates are deltas against the previous sample; the first tick reports
/// zero for both.
pub struct SystemCollector {
    hostname: String,
    ip: String,
    last_cpu: Option<CpuTimes>,
    last_net: Option<NetSample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

struct NetSample {
    rx: u64,
    tx: u64,
    at: Instant,
}

impl SystemCollector {
    pub fn new(server: &ServerSettings) -> SystemCollector {
        let hostname = match server.hostname.as_str() {
            "auto" => os_hostname(),
            hostname => hostname.to_owned(),
        };

        let ip = match server.ip.as_str() {
            "auto" => primary_ipv4(),
            ip => ip.to_owned(),
        };

        SystemCollector {
            hostname,
            ip,
            last_cpu: None,
            last_net: None,
        }
    }

    fn cpu_stats(&mut self) -> Option<CpuStats> {
        let content = read("/proc/stat")?;
        let times = parse_cpu_times(&content)?;

        let usage = match self.last_cpu {
            Some(prev) if times.total > prev.total => {
                let busy = times.busy.saturating_sub(prev.busy) as f64;
                let total = (times.total - prev.total) as f64;
                round1(busy / total * 100.0)
            }
            // nothing to diff against yet
            _ => 0.0,
        };

        self.last_cpu = Some(times);

        Some(CpuStats {
            usage,
            temperature: cpu_temperature(),
        })
    }

    fn memory_stats(&self) -> Option<MemoryStats> {
        let content = read("/proc/meminfo")?;
        let (total, available) = parse_meminfo(&content)?;
        let used = total.saturating_sub(available);
        let usage = match total {
            0 => return None,
            total => round1(used as f64 / total as f64 * 100.0),
        };

        Some(MemoryStats {
            usage,
            total,
            used,
            temperature: memory_temperature(),
        })
    }

    fn storage_stats(&self) -> Option<StorageStats> {
        let mounts = read("/proc/mounts")?;

        let mut capacity = 0u64;
        let mut used = 0u64;
        let mut seen = HashSet::new();
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (Some(device), Some(mountpoint)) = (fields.next(), fields.next()) else {
                continue;
            };

            // physical filesystems only, each device counted once
            if !device.starts_with("/dev/") || !seen.insert(device.to_owned()) {
                continue;
            }

            let Ok(stat) = statvfs(mountpoint) else {
                debug!("statvfs failed for {mountpoint}");
                continue;
            };

            let frsize = stat.fragment_size() as u64;
            capacity += stat.blocks() as u64 * frsize;
            used += (stat.blocks() as u64 - stat.blocks_free() as u64) * frsize;
        }

        Some(StorageStats {
            capacity,
            used,
            disks: disk_list(),
        })
    }

    fn network_stats(&mut self) -> Option<NetworkStats> {
        let content = read("/proc/net/dev")?;
        let (rx, tx) = parse_net_dev(&content);
        let now = Instant::now();

        let stats = match &self.last_net {
            Some(prev) => {
                let elapsed = now.duration_since(prev.at).as_secs_f64();
                if elapsed <= 0.0 {
                    NetworkStats {
                        upload: 0,
                        download: 0,
                    }
                } else {
                    NetworkStats {
                        upload: (tx.saturating_sub(prev.tx) as f64 / elapsed) as u64,
                        download: (rx.saturating_sub(prev.rx) as f64 / elapsed) as u64,
                    }
                }
            }
            None => NetworkStats {
                upload: 0,
                download: 0,
            },
        };

        self.last_net = Some(NetSample { rx, tx, at: now });
        Some(stats)
    }
}

impl SystemSampler for SystemCollector {
    fn sample(&mut self) -> Telemetry {
        Telemetry {
            hostname: self.hostname.clone(),
            ip: self.ip.clone(),
            timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            cpu: self.cpu_stats(),
            memory: self.memory_stats(),
            storage: self.storage_stats(),
            network: self.network_stats(),
            custom: None,
        }
    }
}

fn read(path: impl AsRef<Path>) -> Option<String> {
    match fs::read_to_string(path.as_ref()) {
        Ok(content) => Some(content),
        Err(e) => {
            debug!("unable to read {:?}, error = {e}", path.as_ref());
            None
        }
    }
}

fn os_hostname() -> String {
    read("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_owned())
        .unwrap_or_else(|| "localhost".to_owned())
}

/// A connected UDP socket reveals the outbound interface address without
/// sending anything
fn primary_ipv4() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };

    probe().unwrap_or_else(|_| "127.0.0.1".to_owned())
}

/// Aggregate cpu line of /proc/stat. busy = total - idle - iowait
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields = line
        .split_whitespace()
        .skip(1)
        .map_while(|f| f.parse::<u64>().ok())
        .collect::<Vec<u64>>();

    if fields.len() < 5 {
        return None;
    }

    let total = fields.iter().sum();
    let idle = fields[3] + fields[4];
    Some(CpuTimes {
        busy: total - idle,
        total,
    })
}

/// MemTotal and MemAvailable in bytes
fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        let kb = || {
            line.split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
                .map(|kb| kb * 1024)
        };

        if line.starts_with("MemTotal:") {
            total = kb();
        } else if line.starts_with("MemAvailable:") {
            available = kb();
        }
    }

    Some((total?, available?))
}

/// Sums rx/tx byte counters over every interface except loopback
fn parse_net_dev(net_dev: &str) -> (u64, u64) {
    let mut rx = 0u64;
    let mut tx = 0u64;
    for line in net_dev.lines().skip(2) {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };

        if iface.trim() == "lo" {
            continue;
        }

        let fields = counters
            .split_whitespace()
            .map_while(|f| f.parse::<u64>().ok())
            .collect::<Vec<u64>>();

        // 16 counter columns, rx bytes first, tx bytes ninth
        if fields.len() >= 9 {
            rx += fields[0];
            tx += fields[8];
        }
    }

    (rx, tx)
}

fn cpu_temperature() -> Option<f64> {
    let sensors = hwmon_sensors();
    let preferred = sensors
        .iter()
        .find(|(name, _)| name == "coretemp" || name == "k10temp");

    preferred
        .or_else(|| sensors.first())
        .map(|(_, temp)| round1(*temp))
}

/// Memory temperature sensors barely exist outside server boards, so
/// this usually stays None
fn memory_temperature() -> Option<f64> {
    hwmon_sensors()
        .iter()
        .find(|(name, _)| name.to_lowercase().contains("dimm"))
        .map(|(_, temp)| round1(*temp))
}

/// (name, degrees celsius) per hwmon chip exposing temp1_input
fn hwmon_sensors() -> Vec<(String, f64)> {
    let Ok(entries) = fs::read_dir("/sys/class/hwmon") else {
        return Vec::new();
    };

    let mut sensors = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = read(path.join("name")).map(|n| n.trim().to_owned()) else {
            continue;
        };

        let Some(millis) = read(path.join("temp1_input"))
            .and_then(|raw| raw.trim().parse::<i64>().ok())
        else {
            continue;
        };

        sensors.push((name, millis as f64 / 1000.0));
    }

    sensors.sort_by(|a, b| a.0.cmp(&b.0));
    sensors
}

/// Physical block devices under /sys/block, each graded by its error
/// counters
fn disk_list() -> Vec<Disk> {
    let Ok(entries) = fs::read_dir("/sys/block") else {
        return Vec::new();
    };

    let mut disks = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| {
            !["loop", "ram", "dm-", "zram", "sr", "fd", "md"]
                .iter()
                .any(|prefix| name.starts_with(prefix))
        })
        .map(|id| Disk {
            status: disk_status(&Path::new("/sys/block").join(&id)),
            id,
        })
        .collect::<Vec<Disk>>();

    disks.sort_by(|a, b| a.id.cmp(&b.id));
    disks
}

/// SCSI and SATA devices expose a transport error counter next to the
/// request counters; the error rate grades the disk. Devices without
/// the counter (nvme, virtio) read as normal.
fn disk_status(device: &Path) -> DiskStatus {
    let errors = read(device.join("device/ioerr_cnt")).and_then(|raw| parse_hex(raw.trim()));
    let Some(errors) = errors else {
        return DiskStatus::Normal;
    };

    let operations = read(device.join("stat"))
        .map(|raw| parse_disk_ops(&raw))
        .unwrap_or(0);

    status_from_counters(errors, operations)
}

/// ioerr_cnt reads as 0x-prefixed hex
fn parse_hex(raw: &str) -> Option<u64> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16).ok()
}

/// Completed reads plus completed writes from the device stat line
fn parse_disk_ops(stat: &str) -> u64 {
    let fields = stat
        .split_whitespace()
        .map_while(|f| f.parse::<u64>().ok())
        .collect::<Vec<u64>>();

    match fields.len() >= 5 {
        true => fields[0] + fields[4],
        false => 0,
    }
}

/// More than 1% of requests erroring reads as failing, more than 0.1%
/// as degraded
fn status_from_counters(errors: u64, operations: u64) -> DiskStatus {
    if errors == 0 || operations == 0 {
        return DiskStatus::Normal;
    }

    let rate = errors as f64 / operations as f64;
    if rate > 0.01 {
        DiskStatus::Error
    } else if rate > 0.001 {
        DiskStatus::Warning
    } else {
        DiskStatus::Normal
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cpu_line_parses_and_diffs() {
        let stat = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 50 0 25 400 25 0 0 0 0 0\n";
        let times = parse_cpu_times(stat).unwrap();
        assert_eq!(times.total, 1000);
        assert_eq!(times.busy, 150);

        assert!(parse_cpu_times("intr 12345\n").is_none());
    }

    #[test]
    fn meminfo_parses_to_bytes() {
        let meminfo = "MemTotal:       16777216 kB\nMemFree:         1000000 kB\nMemAvailable:    8388608 kB\n";
        let (total, available) = parse_meminfo(meminfo).unwrap();
        assert_eq!(total, 16777216 * 1024);
        assert_eq!(available, 8388608 * 1024);

        assert!(parse_meminfo("MemTotal:       16777216 kB\n").is_none());
    }

    #[test]
    fn net_dev_sums_everything_but_loopback() {
        let net_dev = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 9999999    1000    0    0    0     0          0         0  9999999    1000    0    0    0     0       0          0
  eth0: 1000000    5000    0    0    0     0          0         0   500000    4000    0    0    0     0       0          0
 wlan0:  200000    1000    0    0    0     0          0         0   100000     900    0    0    0     0       0          0
";
        let (rx, tx) = parse_net_dev(net_dev);
        assert_eq!(rx, 1200000);
        assert_eq!(tx, 600000);
    }

    #[test]
    fn first_sample_reports_zero_rates() {
        let mut collector = SystemCollector {
            hostname: "h".into(),
            ip: "127.0.0.1".into(),
            last_cpu: None,
            last_net: None,
        };

        if let Some(network) = collector.network_stats() {
            assert_eq!(network.upload, 0);
            assert_eq!(network.download, 0);
        }

        if let Some(cpu) = collector.cpu_stats() {
            assert_eq!(cpu.usage, 0.0);
        }
    }

    #[test]
    fn disk_error_rates_grade_status() {
        assert_eq!(status_from_counters(0, 100_000), DiskStatus::Normal);
        assert_eq!(status_from_counters(5, 0), DiskStatus::Normal);
        assert_eq!(status_from_counters(10, 100_000), DiskStatus::Normal);
        assert_eq!(status_from_counters(500, 100_000), DiskStatus::Warning);
        assert_eq!(status_from_counters(5_000, 100_000), DiskStatus::Error);
    }

    #[test]
    fn disk_counter_files_parse() {
        assert_eq!(parse_hex("0x0"), Some(0));
        assert_eq!(parse_hex("0x1a"), Some(26));
        assert_eq!(parse_hex("garbage"), None);

        let stat = "  212412 48007 6201578 151760 149637 110686 3459205 355672 0 217648 531352";
        assert_eq!(parse_disk_ops(stat), 212412 + 149637);
        assert_eq!(parse_disk_ops("not counters"), 0);
    }

    #[test]
    fn rounding_keeps_one_decimal() {
        assert_eq!(round1(35.4999), 35.5);
        assert_eq!(round1(0.04), 0.0);
        assert_eq!(round1(67.84), 67.8);
    }
}
