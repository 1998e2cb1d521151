//! Driver configuration

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;

use crate::errors::{DriverError, Result};
use crate::privilege::PrivilegeMode;

const CGROUP_V2_ROOT: &str = "/sys/fs/cgroup";
const DEFAULT_RUN_AS_USER: &str = "nobody";

/// Host paths bound read-only into every task root, at the same location.
const DEFAULT_CHROOT_ENV: &[&str] = &[
    "/bin",
    "/etc",
    "/lib",
    "/lib32",
    "/lib64",
    "/run/resolvconf",
    "/sbin",
    "/usr",
];

/// Configuration shared by every task the driver launches
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Which isolation primitives to apply
    pub privilege_mode: PrivilegeMode,
    /// Executable re-executed to become a task supervisor
    pub supervisor_bin: PathBuf,
    /// Arguments placed before `--socket <path>` on the supervisor command line
    pub supervisor_args: Vec<String>,
    /// Mount point of the cgroup v2 hierarchy
    pub cgroup_root: PathBuf,
    /// Cgroup directory (relative to `cgroup_root`) holding per-task groups
    pub cgroup_parent: String,
    /// Host path -> in-sandbox path bound into each task root
    pub chroot_env: BTreeMap<PathBuf, PathBuf>,
    /// Run-as user for privileged tasks that name none
    pub default_user: Option<String>,
    /// Run-as users that are never permitted
    pub user_denylist: Vec<String>,
    /// Upper bound for any task's kill grace period
    pub max_kill_timeout: Duration,
    /// How long `start` waits for a new supervisor to answer
    pub supervisor_start_timeout: Duration,
    /// Read/write timeout for control requests other than wait
    pub ipc_timeout: Duration,
    /// How long a supervisor keeps its exit result after the task ended
    pub supervisor_linger: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            privilege_mode: PrivilegeMode::Privileged,
            supervisor_bin: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("exec-driver")),
            supervisor_args: vec!["supervisor".to_string()],
            cgroup_root: PathBuf::from(CGROUP_V2_ROOT),
            cgroup_parent: "exec-driver".to_string(),
            chroot_env: DEFAULT_CHROOT_ENV
                .iter()
                .map(|p| (PathBuf::from(p), PathBuf::from(p)))
                .collect(),
            default_user: Some(DEFAULT_RUN_AS_USER.to_string()),
            user_denylist: vec!["root".to_string()],
            max_kill_timeout: Duration::from_secs(30),
            supervisor_start_timeout: Duration::from_secs(10),
            ipc_timeout: Duration::from_secs(30),
            supervisor_linger: Duration::from_secs(300),
        }
    }
}

impl DriverConfig {
    /// Defaults overlaid with `EXEC_DRIVER_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(mode) = lookup("EXEC_DRIVER_MODE") {
            self.privilege_mode = mode.parse()?;
        }
        if let Some(root) = lookup("EXEC_DRIVER_CGROUP_ROOT") {
            self.cgroup_root = PathBuf::from(root);
        }
        if let Some(parent) = lookup("EXEC_DRIVER_CGROUP_PARENT") {
            self.cgroup_parent = parent;
        }
        if let Some(bin) = lookup("EXEC_DRIVER_SUPERVISOR_BIN") {
            self.supervisor_bin = PathBuf::from(bin);
        }
        if let Some(user) = lookup("EXEC_DRIVER_DEFAULT_USER") {
            let user = user.trim();
            self.default_user = (!user.is_empty()).then(|| user.to_string());
        }
        if let Some(users) = lookup("EXEC_DRIVER_USER_DENYLIST") {
            self.user_denylist = users
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(secs) = lookup("EXEC_DRIVER_MAX_KILL_TIMEOUT") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                DriverError::InvalidConfig(format!("Invalid EXEC_DRIVER_MAX_KILL_TIMEOUT: {}", secs))
            })?;
            self.max_kill_timeout = Duration::from_secs(secs);
        }
        debug!("Driver configuration: {:?}", self);
        Ok(self)
    }

    pub fn privilege_mode(mut self, mode: PrivilegeMode) -> Self {
        self.privilege_mode = mode;
        self
    }

    /// Set the supervisor command (executable plus leading arguments)
    pub fn supervisor(mut self, bin: impl AsRef<Path>, args: &[&str]) -> Self {
        self.supervisor_bin = bin.as_ref().to_path_buf();
        self.supervisor_args = args.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn cgroup_root(mut self, path: impl AsRef<Path>) -> Self {
        self.cgroup_root = path.as_ref().to_path_buf();
        self
    }

    pub fn default_user(mut self, user: Option<&str>) -> Self {
        self.default_user = user.map(String::from);
        self
    }

    pub fn user_denylist(mut self, users: &[&str]) -> Self {
        self.user_denylist = users.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn max_kill_timeout(mut self, timeout: Duration) -> Self {
        self.max_kill_timeout = timeout;
        self
    }

    pub fn supervisor_linger(mut self, linger: Duration) -> Self {
        self.supervisor_linger = linger;
        self
    }

    /// Clamp a task's requested kill grace period to the configured maximum
    pub fn kill_timeout(&self, requested: Duration) -> Duration {
        requested.min(self.max_kill_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cgroup_parent.is_empty() || self.cgroup_parent.contains("..") {
            return Err(DriverError::InvalidConfig(format!(
                "Invalid cgroup parent: {:?}",
                self.cgroup_parent
            )));
        }
        for dest in self.chroot_env.values() {
            if !dest.is_absolute() {
                return Err(DriverError::InvalidConfig(format!(
                    "Chroot destination must be absolute: {}",
                    dest.display()
                )));
            }
        }
        Ok(())
    }
}
