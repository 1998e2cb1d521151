//! Cgroup v2 management for resource limits

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::errors::{DriverError, Result};
use crate::structs::Resources;

const CONTROLLERS: &[&str] = &["+cpu", "+memory", "+pids"];

/// Cgroup v2 resource limits configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupConfig {
    /// Memory limit in bytes
    pub memory_limit: Option<u64>,
    /// CPU weight (1-10000, default 100)
    pub cpu_weight: Option<u64>,
    /// Max PIDs allowed
    pub max_pids: Option<u64>,
}

impl CgroupConfig {
    pub fn from_resources(resources: &Resources) -> Self {
        Self {
            memory_limit: resources.memory_bytes(),
            cpu_weight: resources.cpu.map(cpu_shares_to_weight),
            max_pids: resources.max_pids,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.memory_limit == Some(0) {
            return Err(DriverError::InvalidConfig(
                "Memory limit must be greater than 0".to_string(),
            ));
        }

        if let Some(weight) = self.cpu_weight {
            if !(1..=10000).contains(&weight) {
                return Err(DriverError::InvalidConfig(
                    "CPU weight must be between 1-10000".to_string(),
                ));
            }
        }

        if self.max_pids == Some(0) {
            return Err(DriverError::InvalidConfig(
                "Max pids must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Convert cgroup v1 style CPU shares (2..262144) into a v2 weight (1..10000)
pub fn cpu_shares_to_weight(shares: u64) -> u64 {
    let shares = shares.clamp(2, 262_144);
    1 + ((shares - 2) * 9999) / 262_142
}

/// Cgroup v2 interface for one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Create (or reuse) `<root>/<parent>/<name>`.
    ///
    /// Enabling controllers for the parent is best effort; a host that
    /// delegated only some controllers still gets the limits it supports.
    pub fn create(root: &Path, parent: &str, name: &str) -> Result<Self> {
        let parent_path = root.join(parent);
        fs::create_dir_all(&parent_path).map_err(|e| {
            DriverError::Cgroup(format!(
                "Failed to create cgroup directory {}: {}",
                parent_path.display(),
                e
            ))
        })?;

        for dir in [root, parent_path.as_path()] {
            enable_controllers(dir);
        }

        let path = parent_path.join(name);
        if !path.exists() {
            fs::create_dir(&path).map_err(|e| {
                DriverError::Cgroup(format!(
                    "Failed to create cgroup directory {}: {}",
                    path.display(),
                    e
                ))
            })?;
            debug!("Created cgroup {}", path.display());
        }

        Ok(Self { path })
    }

    /// Bind to an existing cgroup directory
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File a process writes `0` into to join this cgroup
    pub fn procs_file(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    /// Apply configuration to cgroup
    pub fn apply_config(&self, config: &CgroupConfig) -> Result<()> {
        config.validate()?;

        if let Some(memory) = config.memory_limit {
            self.write_file("memory.max", &memory.to_string())?;
        }

        if let Some(weight) = config.cpu_weight {
            self.write_file("cpu.weight", &weight.to_string())?;
        }

        if let Some(max_pids) = config.max_pids {
            self.write_file("pids.max", &max_pids.to_string())?;
        }

        Ok(())
    }

    /// Processes currently in the cgroup
    pub fn pids(&self) -> Result<Vec<Pid>> {
        let content = self.read_file("cgroup.procs")?;
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .map(Pid::from_raw)
            .collect())
    }

    /// SIGKILL every process in the cgroup
    pub fn kill_all(&self) -> Result<()> {
        if self.path.join("cgroup.kill").exists() && self.write_file("cgroup.kill", "1").is_ok() {
            return Ok(());
        }
        for pid in self.pids()? {
            match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("Failed to kill {} in cgroup: {}", pid, e),
            }
        }
        Ok(())
    }

    /// Read memory usage
    pub fn memory_usage(&self) -> Result<u64> {
        self.read_file_u64("memory.current")
    }

    /// Read CPU usage in microseconds
    pub fn cpu_usage(&self) -> Result<u64> {
        let content = self.read_file("cpu.stat")?;

        // Parse "usage_usec 123456"
        for line in content.lines() {
            if let Some(value) = line.strip_prefix("usage_usec") {
                return value.trim().parse::<u64>().map_err(|e| {
                    DriverError::Cgroup(format!("Failed to parse CPU usage: {}", e))
                });
            }
        }

        Ok(0)
    }

    /// Number of processes in the cgroup
    pub fn pid_count(&self) -> Result<u64> {
        match self.read_file_u64("pids.current") {
            Ok(count) => Ok(count),
            Err(_) => Ok(self.pids()?.len() as u64),
        }
    }

    /// Check if cgroup exists
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Delete the cgroup, killing anything still inside it
    pub fn delete(&self) -> Result<()> {
        if !self.exists() {
            return Ok(());
        }

        let mut last_err = None;
        for attempt in 0..5 {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    debug!("Cgroup removal attempt {} failed: {}", attempt, e);
                    last_err = Some(e);
                    let _ = self.kill_all();
                    thread::sleep(Duration::from_millis(50 << attempt));
                }
            }
        }

        Err(DriverError::Cgroup(format!(
            "Failed to delete cgroup {}: {}",
            self.path.display(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn write_file(&self, name: &str, content: &str) -> Result<()> {
        let path = self.path.join(name);
        let mut file = fs::OpenOptions::new().write(true).open(&path).map_err(|e| {
            DriverError::Cgroup(format!("Failed to open {}: {}", path.display(), e))
        })?;

        write!(file, "{}", content).map_err(|e| {
            DriverError::Cgroup(format!("Failed to write to {}: {}", path.display(), e))
        })?;

        Ok(())
    }

    fn read_file(&self, name: &str) -> Result<String> {
        let path = self.path.join(name);
        fs::read_to_string(&path)
            .map_err(|e| DriverError::Cgroup(format!("Failed to read {}: {}", path.display(), e)))
    }

    fn read_file_u64(&self, name: &str) -> Result<u64> {
        self.read_file(name)?
            .trim()
            .parse::<u64>()
            .map_err(|e| DriverError::Cgroup(format!("Failed to parse value: {}", e)))
    }

    #[cfg(test)]
    pub(crate) fn for_testing(path: PathBuf) -> Self {
        Self { path }
    }
}

fn enable_controllers(dir: &Path) {
    let control = dir.join("cgroup.subtree_control");
    if !control.exists() {
        return;
    }
    for controller in CONTROLLERS {
        if let Err(e) = fs::OpenOptions::new()
            .write(true)
            .open(&control)
            .and_then(|mut f| f.write_all(controller.as_bytes()))
        {
            debug!(
                "Could not enable {} in {}: {}",
                controller,
                control.display(),
                e
            );
        }
    }
}
