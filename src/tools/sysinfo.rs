//! Host resource sampling for status reporting.
//!
//! CPU and network rates are deltas against the previous sample, so the
//! first call after startup reports zero usage.

use std::sync::Mutex;
use std::time::Instant;

use lazy_static::lazy_static;

use ecs_api_types::{HostType, SysInfo};

#[derive(Clone)]
struct CpuSample {
    busy: u64,
    total: u64,
}

struct PrevSample {
    at: Instant,
    cpus: Vec<CpuSample>,
    net_rx: u64,
    net_tx: u64,
}

lazy_static! {
    static ref PREV: Mutex<Option<PrevSample>> = Mutex::new(None);
}

fn read_cpu_samples() -> Vec<CpuSample> {
    let stat = match std::fs::read_to_string("/proc/stat") {
        Ok(stat) => stat,
        Err(_) => return Vec::new(),
    };
    let mut cpus = Vec::new();
    for line in stat.lines() {
        // per-cpu lines are "cpuN ..."; the aggregate "cpu " line is skipped
        if !line.starts_with("cpu") || line.starts_with("cpu ") {
            continue;
        }
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|v| v.parse().ok())
            .collect();
        if fields.len() < 4 {
            continue;
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        cpus.push(CpuSample {
            busy: total - idle,
            total,
        });
    }
    cpus
}

fn read_net_totals() -> (u64, u64) {
    let dev = match std::fs::read_to_string("/proc/net/dev") {
        Ok(dev) => dev,
        Err(_) => return (0, 0),
    };
    let mut rx = 0u64;
    let mut tx = 0u64;
    for line in dev.lines().skip(2) {
        let Some((ifname, rest)) = line.split_once(':') else {
            continue;
        };
        if ifname.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = rest
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if fields.len() >= 9 {
            rx += fields[0];
            tx += fields[8];
        }
    }
    (rx, tx)
}

/// Take a resource snapshot of this host.
pub fn collect(host_type: HostType) -> SysInfo {
    let cpus = read_cpu_samples();
    let (net_rx, net_tx) = read_net_totals();
    let now = Instant::now();

    let mut info = SysInfo {
        cpu_num: cpus.len().min(u8::MAX as usize) as u8,
        cpu_usage: vec![0.0; cpus.len()],
        host_type: host_type.to_u8(),
        ..Default::default()
    };

    if let Ok(sys) = nix::sys::sysinfo::sysinfo() {
        info.mem_total = (sys.ram_total() >> 20) as u32;
        info.mem_free = (sys.ram_unused() >> 20) as u32;
    }

    let mut prev = PREV.lock().unwrap();
    if let Some(prev) = prev.as_ref() {
        let elapsed = now.duration_since(prev.at).as_secs_f64();
        if elapsed > 0.0 {
            for (i, cpu) in cpus.iter().enumerate() {
                if let Some(old) = prev.cpus.get(i) {
                    let total = cpu.total.saturating_sub(old.total);
                    let busy = cpu.busy.saturating_sub(old.busy);
                    if total > 0 {
                        info.cpu_usage[i] = busy as f32 * 100.0 / total as f32;
                    }
                }
            }
            let to_mb = 1.0 / (1024.0 * 1024.0);
            info.net_in = net_rx.saturating_sub(prev.net_rx) as f64 * to_mb / elapsed;
            info.net_out = net_tx.saturating_sub(prev.net_tx) as f64 * to_mb / elapsed;
        }
    }
    *prev = Some(PrevSample {
        at: now,
        cpus,
        net_rx,
        net_tx,
    });

    info
}
