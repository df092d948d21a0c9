//! Per-task control group over the cgroup filesystem.
//!
//! The agent owns one directory per task under a configured root and talks
//! to the kernel purely through subsystem files; limits are enforced by the
//! kernel, accounting is pull-based reads.

use crate::error::{ClusterError, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Handle on one task's control-group directory.
#[derive(Debug)]
pub struct ControlGroup {
    path: PathBuf,
}

impl ControlGroup {
    /// Create (or reuse) the group directory.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        std::fs::create_dir_all(&path).map_err(|source| ClusterError::CGroup {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_memory_limit_in_bytes(&self, bytes: u64) -> Result<()> {
        self.write("memory.limit_in_bytes", &bytes.to_string())
    }

    pub fn set_memory_swappiness(&self, value: u32) -> Result<()> {
        self.write("memory.swappiness", &value.to_string())
    }

    pub fn set_cpuset_cpus(&self, cpus: &str) -> Result<()> {
        self.write("cpuset.cpus", cpus)
    }

    /// Move a process into this group.
    pub fn add(&self, pid: i32) -> Result<()> {
        self.write("cgroup.procs", &pid.to_string())
    }

    pub fn memory_limit_in_bytes(&self) -> Result<u64> {
        self.read_u64("memory.limit_in_bytes")
    }

    pub fn memory_usage_in_bytes(&self) -> Result<u64> {
        self.read_u64("memory.usage_in_bytes")
    }

    pub fn memory_max_usage_in_bytes(&self) -> Result<u64> {
        self.read_u64("memory.max_usage_in_bytes")
    }

    /// Accumulated CPU time of the group, in nanoseconds.
    pub fn cpuacct_usage(&self) -> Result<u64> {
        self.read_u64("cpuacct.usage")
    }

    pub fn cpuset_cpus(&self) -> Result<BTreeSet<u32>> {
        let raw = self.read("cpuset.cpus")?;
        let mut cpus = BTreeSet::new();
        for part in raw.trim().split(',').filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = parse_cpu(lo, &self.path)?;
                    let hi: u32 = parse_cpu(hi, &self.path)?;
                    cpus.extend(lo..=hi);
                }
                None => {
                    cpus.insert(parse_cpu(part, &self.path)?);
                }
            }
        }
        Ok(cpus)
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        let path = self.path.join(file);
        std::fs::write(&path, value).map_err(|source| ClusterError::CGroup {
            path: path.display().to_string(),
            source,
        })
    }

    fn read(&self, file: &str) -> Result<String> {
        let path = self.path.join(file);
        std::fs::read_to_string(&path).map_err(|source| ClusterError::CGroup {
            path: path.display().to_string(),
            source,
        })
    }

    fn read_u64(&self, file: &str) -> Result<u64> {
        let raw = self.read(file)?;
        raw.trim().parse().map_err(|_| ClusterError::CGroup {
            path: self.path.join(file).display().to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unparsable value '{}'", raw.trim()),
            ),
        })
    }
}

fn parse_cpu(raw: &str, path: &Path) -> Result<u32> {
    raw.trim().parse().map_err(|_| ClusterError::CGroup {
        path: path.display().to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad cpu id '{raw}'"),
        ),
    })
}

impl Drop for ControlGroup {
    fn drop(&mut self) {
        // The kernel refuses removal while members remain; best effort.
        let _ = std::fs::remove_dir(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_round_trip_through_files() {
        let root = tempfile::tempdir().unwrap();
        let group = ControlGroup::new(root.path().join("task-1.0")).unwrap();

        group.set_memory_limit_in_bytes(1 << 30).unwrap();
        assert_eq!(group.memory_limit_in_bytes().unwrap(), 1 << 30);

        group.set_cpuset_cpus("0-2,5").unwrap();
        let cpus = group.cpuset_cpus().unwrap();
        assert_eq!(cpus.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 5]);
    }

    #[test]
    fn add_appends_into_procs_file() {
        let root = tempfile::tempdir().unwrap();
        let group = ControlGroup::new(root.path().join("task-1.1")).unwrap();
        group.add(4242).unwrap();
        let procs = std::fs::read_to_string(group.path().join("cgroup.procs")).unwrap();
        assert_eq!(procs, "4242");
    }

    #[test]
    fn group_directory_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("task-1.2");
        {
            let _group = ControlGroup::new(&path).unwrap();
            assert!(path.is_dir());
        }
        assert!(!path.exists());
    }
}
