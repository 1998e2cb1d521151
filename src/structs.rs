//! Task descriptor, node attributes and the wait result

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default kill grace period when a task does not name one
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Scheduler-supplied description of one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task name, unique within its allocation
    pub name: String,
    /// Allocation this task belongs to
    pub alloc_id: String,
    /// Program to execute
    pub command: String,
    /// Program arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Additional environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Run-as user; `None` runs as the supervisor's own identity
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub log_config: LogConfig,
    /// Grace period between the interrupt and the forced kill
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout: Duration,
}

fn default_kill_timeout() -> Duration {
    DEFAULT_KILL_TIMEOUT
}

impl Task {
    pub fn new(alloc_id: impl Into<String>, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alloc_id: alloc_id.into(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            user: None,
            resources: Resources::default(),
            log_config: LogConfig::default(),
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    /// Cgroup and socket-friendly identifier of this task
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.alloc_id, self.name)
    }
}

/// Resource limits requested for a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Relative CPU shares (1024 = one core's worth of weight)
    #[serde(default)]
    pub cpu: Option<u64>,
    /// Memory limit in megabytes
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// Maximum number of processes in the task's group
    #[serde(default)]
    pub max_pids: Option<u64>,
}

impl Resources {
    pub fn memory_bytes(&self) -> Option<u64> {
        self.memory_mb.and_then(|mb| mb.checked_mul(1024 * 1024))
    }

    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory_mb.is_none() && self.max_pids.is_none()
    }
}

/// Log retention policy for the task's stdout/stderr files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub max_files: u32,
    pub max_file_size_mb: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_files: 10,
            max_file_size_mb: 10,
        }
    }
}

impl LogConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024).max(1)
    }
}

/// Attributes the node advertises to the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub attributes: BTreeMap<String, String>,
}

impl Node {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Outcome of a task, produced exactly once
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitResult {
    /// Exit status, or 128 + signal when terminated by a signal
    pub exit_code: i32,
    /// Terminating signal, 0 if the process exited on its own
    pub signal: i32,
    /// Whether the driver killed the task
    pub killed: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl WaitResult {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Default::default()
        }
    }

    pub fn signaled(signal: i32, killed: bool) -> Self {
        Self {
            exit_code: 128 + signal,
            signal,
            killed,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn successful(&self) -> bool {
        self.exit_code == 0 && self.signal == 0 && !self.killed && self.error.is_none()
    }
}

impl fmt::Display for WaitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit code {}", self.exit_code)?;
        if self.signal != 0 {
            write!(f, ", signal {}", self.signal)?;
        }
        if self.killed {
            write!(f, ", killed")?;
        }
        if let Some(err) = &self.error {
            write!(f, ", error: {}", err)?;
        }
        Ok(())
    }
}
