//! Host-level facts surfaced on `/api/v1/status`: hostname, uptime, load
//! average, memory, and root disk usage. All read straight off `/proc`
//! (or shell out to `df` for disk usage, which `/proc` doesn't expose
//! directly) rather than pulled in as a library dependency.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskSnapshot {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

pub fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

pub fn uptime_seconds() -> f64 {
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|s| s.split_whitespace().next().map(str::to_string))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

pub fn load_avg() -> [f64; 3] {
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| {
            let mut parts = s.split_whitespace();
            let one: f64 = parts.next()?.parse().ok()?;
            let five: f64 = parts.next()?.parse().ok()?;
            let fifteen: f64 = parts.next()?.parse().ok()?;
            Some([one, five, fifteen])
        })
        .unwrap_or([0.0, 0.0, 0.0])
}

pub fn memory_snapshot() -> MemorySnapshot {
    let raw = std::fs::read_to_string("/proc/meminfo").unwrap_or_default();
    let mut total = 0u64;
    let mut available = 0u64;
    let mut free = 0u64;

    for line in raw.lines() {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else { continue };
        let Some(kb) = fields.next().and_then(|v| v.parse::<u64>().ok()) else { continue };
        match label {
            "MemTotal:" => total = kb * 1024,
            "MemAvailable:" => available = kb * 1024,
            "MemFree:" => free = kb * 1024,
            _ => {}
        }
    }

    MemorySnapshot {
        total_bytes: total,
        available_bytes: available,
        free_bytes: free,
    }
}

/// Shells out to `df -Pk` since `/proc` doesn't expose filesystem usage and
/// the standard library has no portable API for it.
pub async fn disk_snapshot(path: &str) -> Option<DiskSnapshot> {
    let output = tokio::process::Command::new("df")
        .arg("-Pk")
        .arg(path)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let data_line = text.lines().nth(1)?;
    let mut fields = data_line.split_whitespace();
    let _filesystem = fields.next()?;
    let total_kb: u64 = fields.next()?.parse().ok()?;
    let used_kb: u64 = fields.next()?.parse().ok()?;
    let free_kb: u64 = fields.next()?.parse().ok()?;

    Some(DiskSnapshot {
        total_bytes: total_kb * 1024,
        used_bytes: used_kb * 1024,
        free_bytes: free_kb * 1024,
    })
}
