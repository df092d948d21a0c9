//! Host resource and load sampling from procfs.

use flowgraph_protocol::{LoadInfo, Resource};
use std::path::Path;

/// Probe this host's capacity: logical CPUs, total memory and free disk
/// space under `/`.
pub fn host_resource() -> Resource {
    let num_cpus = std::thread::available_parallelism()
        .map(|n| n.get() as u64)
        .unwrap_or(1);
    Resource::new(num_cpus, total_memory_bytes(), free_disk_bytes())
}

/// One-minute load average of this host.
pub fn load_info() -> LoadInfo {
    let cpu_load = std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|f| f.parse().ok()))
        .unwrap_or(0.0);
    LoadInfo { cpu_load }
}

fn total_memory_bytes() -> u64 {
    parse_meminfo_kib(Path::new("/proc/meminfo"), "MemTotal:") * 1024
}

fn parse_meminfo_kib(path: &Path, field: &str) -> u64 {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return 0;
    };
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix(field) {
            return rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        }
    }
    0
}

fn free_disk_bytes() -> u64 {
    match nix::sys::statvfs::statvfs("/") {
        Ok(stat) => stat.blocks_available() as u64 * stat.fragment_size() as u64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probed_resource_is_plausible() {
        let resource = host_resource();
        assert!(resource.num_cpus >= 1);
        assert!(resource.memory_limit_in_bytes > 0);
    }

    #[test]
    fn load_is_non_negative() {
        assert!(load_info().cpu_load >= 0.0);
    }
}
