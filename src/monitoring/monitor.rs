//! Process monitoring via cgroup files and /proc

use std::fs;

use chrono::Utc;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::resources::Cgroup;
use crate::utils;

/// Resource usage snapshot of one task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Resident memory in bytes
    pub memory_bytes: u64,
    /// User + system CPU time in microseconds
    pub cpu_time_us: u64,
    /// Number of processes belonging to the task
    pub pids: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
}

/// Fields of one `/proc/<pid>/stat` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStats {
    pub pid: i32,
    pub state: char,
    pub pgrp: i32,
    /// CPU time in microseconds
    pub cpu_time_us: u64,
    pub num_threads: u32,
    /// Resident set size in bytes
    pub rss: u64,
}

impl ProcessStats {
    /// Create stats from /proc data
    pub fn from_proc(pid: i32) -> Result<Self> {
        let stat_path = format!("/proc/{}/stat", pid);
        let content = fs::read_to_string(&stat_path).map_err(|e| {
            DriverError::Syscall(format!("Failed to read {}: {}", stat_path, e))
        })?;
        Self::parse(pid, &content)
    }

    fn parse(pid: i32, content: &str) -> Result<Self> {
        let invalid = |what: &str| DriverError::Syscall(format!("Invalid /proc/{}/stat: {}", pid, what));

        // The command name may contain spaces; fields restart after its ')'
        let rest = content
            .rfind(')')
            .map(|i| &content[i + 1..])
            .ok_or_else(|| invalid("missing comm"))?;
        let parts: Vec<&str> = rest.split_whitespace().collect();
        if parts.len() < 22 {
            return Err(invalid("too few fields"));
        }

        let field = |i: usize| -> Result<u64> {
            parts[i].parse::<u64>().map_err(|_| invalid("non-numeric field"))
        };

        let state = utils::proc_stat_state(content).unwrap_or('?');
        let pgrp = parts[2].parse::<i32>().map_err(|_| invalid("pgrp"))?;
        let ticks = field(11)? + field(12)?;
        let num_threads = u32::try_from(field(17)?).map_err(|_| invalid("num_threads"))?;
        let rss_pages = field(21)?;

        let clk_tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let cpu_time_us = if clk_tck > 0 {
            ticks * 1_000_000 / clk_tck as u64
        } else {
            0
        };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(0) as u64;

        Ok(ProcessStats {
            pid,
            state,
            pgrp,
            cpu_time_us,
            num_threads,
            rss: rss_pages * page_size,
        })
    }
}

/// Resource monitor for one task
#[derive(Debug, Clone)]
pub struct ProcessMonitor {
    pid: Pid,
    cgroup: Option<Cgroup>,
}

impl ProcessMonitor {
    /// Monitor the task whose process group leader is `pid`
    pub fn new(pid: Pid, cgroup: Option<Cgroup>) -> Self {
        Self { pid, cgroup }
    }

    /// Collect current usage
    pub fn collect(&self) -> Result<ResourceUsage> {
        let mut usage = match &self.cgroup {
            Some(cgroup) => ResourceUsage {
                memory_bytes: cgroup.memory_usage()?,
                cpu_time_us: cgroup.cpu_usage()?,
                pids: cgroup.pid_count()?,
                timestamp_ms: 0,
            },
            None => self.collect_process_group()?,
        };
        usage.timestamp_ms = Utc::now().timestamp_millis();
        Ok(usage)
    }

    fn collect_process_group(&self) -> Result<ResourceUsage> {
        let mut usage = ResourceUsage::default();
        for entry in fs::read_dir("/proc")? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            // Processes may exit while the table is walked
            let Ok(stats) = ProcessStats::from_proc(pid) else {
                continue;
            };
            if stats.pgrp == self.pid.as_raw() && stats.state != 'Z' {
                usage.memory_bytes += stats.rss;
                usage.cpu_time_us += stats.cpu_time_us;
                usage.pids += 1;
            }
        }
        Ok(usage)
    }
}
