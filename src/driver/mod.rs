//! The exec driver: fingerprint, prestart, start, open, cleanup
//!
//! Each started task gets its own supervisor process (see
//! [`crate::supervisor`]). The driver keeps no per-task state; the
//! serialized [`HandleId`] is all that is needed to reach a task again.

pub mod executor;
pub mod handle;

pub use executor::ScriptExecutor;
pub use handle::{ExecHandle, HandleId, WaitCh};

use std::fs::{self, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{setsid, Pid};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::allocdir::{AllocDir, TaskDir};
use crate::capabilities::HostFacts;
use crate::config::DriverConfig;
use crate::errors::{DriverError, Result};
use crate::isolation::{mount_all, plan_mounts, unmount_all};
use crate::privilege::ResolvedMode;
use crate::resources::{Cgroup, CgroupConfig};
use crate::structs::{Node, Task};
use crate::supervisor::protocol::socket_path;
use crate::supervisor::{LaunchSpec, SupervisorClient, PROTOCOL_VERSION, TOKEN_ENV};
use crate::utils::{self, Backoff};

/// Name under which the driver advertises itself
pub const DRIVER_NAME: &str = "exec";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

const ATTR_PREFIX: &str = "driver.exec";
const CGROUP_MOUNT_ATTR: &str = "unique.cgroup.mountpoint";

/// Per-allocation context handed to every call
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub alloc_dir: AllocDir,
}

impl ExecContext {
    pub fn new(alloc_dir: AllocDir) -> Self {
        Self { alloc_dir }
    }
}

/// What Prestart built for a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub mode: ResolvedMode,
    /// Task root (chroot target in privileged mode)
    pub root: PathBuf,
    pub cgroup: Option<PathBuf>,
    /// Mount points under `root`, in mount order
    pub mounts: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrestartResponse {
    pub sandbox: SandboxInfo,
}

/// Process-isolation task driver
#[derive(Debug, Clone)]
pub struct ExecDriver {
    config: DriverConfig,
    facts: HostFacts,
    mode: ResolvedMode,
}

impl ExecDriver {
    /// Create a driver for this host
    pub fn new(config: DriverConfig) -> Result<Self> {
        let facts = HostFacts::detect()?;
        Self::with_facts(config, facts)
    }

    /// Create a driver from already detected host facts
    pub fn with_facts(config: DriverConfig, facts: HostFacts) -> Result<Self> {
        config.validate()?;
        let mode = config.privilege_mode.resolve(&facts);
        debug!("Exec driver resolved to {} mode", mode);
        Ok(Self {
            config,
            facts,
            mode,
        })
    }

    pub fn mode(&self) -> ResolvedMode {
        self.mode
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Decide whether tasks can run on this node and annotate `node`.
    ///
    /// A negative result only removes this driver's own attributes.
    pub fn fingerprint(&self, node: &mut Node) -> Result<bool> {
        let mut facts = self.facts.clone();
        if let Some(mount) = node.attribute(CGROUP_MOUNT_ATTR) {
            facts.cgroup_mountpoint = Some(PathBuf::from(mount));
        }
        let mode = self.config.privilege_mode.resolve(&facts);

        let applicable = facts.is_linux()
            && match mode {
                ResolvedMode::Privileged => facts.has_root() && facts.cgroup_mountpoint.is_some(),
                ResolvedMode::Unprivileged => true,
            };

        if !applicable {
            debug!("Exec driver not applicable:\n{}", facts.summary());
            node.attributes
                .retain(|key, _| key != ATTR_PREFIX && !key.starts_with("driver.exec."));
            return Ok(false);
        }

        let attrs = &mut node.attributes;
        attrs.insert(ATTR_PREFIX.to_string(), "1".to_string());
        attrs.insert(format!("{}.version", ATTR_PREFIX), DRIVER_VERSION.to_string());
        attrs.insert(format!("{}.mode", ATTR_PREFIX), mode.to_string());
        attrs.insert(
            format!("{}.supervisor", ATTR_PREFIX),
            self.config.supervisor_bin.display().to_string(),
        );
        Ok(true)
    }

    /// Build the task's sandbox. Safe to call repeatedly before start.
    pub fn prestart(&self, ctx: &ExecContext, task: &Task) -> Result<PrestartResponse> {
        let task_dir = ctx.alloc_dir.verify(&task.name)?;

        if self.mode.is_unprivileged() {
            return Ok(PrestartResponse {
                sandbox: SandboxInfo {
                    mode: self.mode,
                    root: task_dir.dir,
                    cgroup: None,
                    mounts: Vec::new(),
                },
            });
        }

        if !self.facts.has_root() {
            return Err(DriverError::SandboxSetup(
                "privileged mode requires root".to_string(),
            ));
        }

        let plan = plan_mounts(&task_dir.dir, &self.config.chroot_env, &ctx.alloc_dir.shared_dir);
        let mounts = mount_all(&task_dir.dir, &plan)?;

        let cgroup = Cgroup::create(
            &self.config.cgroup_root,
            &self.config.cgroup_parent,
            &task.qualified_name(),
        )
        .map_err(|e| DriverError::SandboxSetup(e.to_string()))?;
        cgroup.apply_config(&CgroupConfig::from_resources(&task.resources))?;

        info!(
            "Prepared sandbox for {} at {} ({} mounts)",
            task.name,
            task_dir.dir.display(),
            mounts.len()
        );
        Ok(PrestartResponse {
            sandbox: SandboxInfo {
                mode: self.mode,
                root: task_dir.dir,
                cgroup: Some(cgroup.path().to_path_buf()),
                mounts,
            },
        })
    }

    /// Launch the task under a new supervisor.
    ///
    /// Either a usable handle is returned or nothing is left running.
    pub fn start(&self, ctx: &ExecContext, task: &Task) -> Result<ExecHandle> {
        let task_dir = ctx.alloc_dir.verify(&task.name)?;
        let spec = self.launch_spec(ctx, &task_dir, task)?;

        let token = Uuid::new_v4().to_string();
        let socket = socket_path(&ctx.alloc_dir.alloc_dir, &task.name);
        let mut child = self.spawn_supervisor(&task_dir, task, &socket, &token)?;
        let client = SupervisorClient::new(&socket, &token, self.config.ipc_timeout);

        let launched = self
            .wait_until_ready(&mut child, &client)
            .and_then(|_| client.launch(spec));
        let supervisor_pid = child.id() as i32;
        reap(child);

        let (_, user_pid) = match launched {
            Ok(pids) => pids,
            Err(e) => {
                // A rejected launch makes the supervisor exit on its own
                if utils::process_alive(supervisor_pid) {
                    let _ = kill(Pid::from_raw(supervisor_pid), Signal::SIGKILL);
                }
                let _ = fs::remove_file(&socket);
                return Err(e);
            }
        };

        let id = HandleId {
            version: PROTOCOL_VERSION,
            task_name: task.name.clone(),
            supervisor_pid,
            user_pid,
            socket,
            token,
            kill_timeout_ms: millis(self.config.kill_timeout(task.kill_timeout)),
        };
        info!(
            "Started task {} (supervisor {}, pid {})",
            task.name, supervisor_pid, user_pid
        );
        ExecHandle::new(id, client)
    }

    /// Reattach to a task from its serialized handle id.
    ///
    /// When the supervisor cannot be reached the task is lost: the
    /// supervisor is killed if it is still around and the user process dies
    /// with it through its parent-death signal.
    pub fn open(&self, raw_id: &str) -> Result<ExecHandle> {
        let id = HandleId::decode(raw_id)?;
        let client = SupervisorClient::new(&id.socket, &id.token, self.config.ipc_timeout);

        if let Err(e) = client.ping() {
            warn!(
                "Supervisor {} of task {} unreachable: {}",
                id.supervisor_pid, id.task_name, e
            );
            discard_supervisor(&id);
            return Err(DriverError::Reattach(format!(
                "supervisor {} of task {} is unreachable: {}",
                id.supervisor_pid, id.task_name, e
            )));
        }

        debug!("Reattached to task {}", id.task_name);
        ExecHandle::new(id, client)
    }

    /// Tear down what Prestart built. Called when the allocation is destroyed.
    pub fn cleanup(&self, response: &PrestartResponse) -> Result<()> {
        let sandbox = &response.sandbox;
        unmount_all(&sandbox.mounts)?;
        if let Some(path) = &sandbox.cgroup {
            Cgroup::open(path).delete()?;
        }
        Ok(())
    }

    fn launch_spec(&self, ctx: &ExecContext, task_dir: &TaskDir, task: &Task) -> Result<LaunchSpec> {
        let (chroot, cgroup) = match self.mode {
            ResolvedMode::Unprivileged => (None, None),
            ResolvedMode::Privileged => {
                let cgroup = self
                    .config
                    .cgroup_root
                    .join(&self.config.cgroup_parent)
                    .join(task.qualified_name());
                if !cgroup.is_dir() {
                    return Err(DriverError::SandboxSetup(format!(
                        "cgroup {} missing; prestart has not run for {}",
                        cgroup.display(),
                        task.name
                    )));
                }
                (Some(task_dir.dir.clone()), Some(cgroup))
            }
        };

        Ok(LaunchSpec {
            task: task.clone(),
            mode: self.mode,
            alloc_dir: ctx.alloc_dir.alloc_dir.clone(),
            shared_dir: ctx.alloc_dir.shared_dir.clone(),
            task_dir: task_dir.dir.clone(),
            local_dir: task_dir.local_dir.clone(),
            log_dir: task_dir.log_dir.clone(),
            chroot,
            cgroup,
            default_user: self.config.default_user.clone(),
            user_denylist: self.config.user_denylist.clone(),
            max_kill_timeout_ms: millis(self.config.max_kill_timeout),
        })
    }

    fn spawn_supervisor(
        &self,
        task_dir: &TaskDir,
        task: &Task,
        socket: &Path,
        token: &str,
    ) -> Result<Child> {
        let log_path = task_dir.log_dir.join(format!("{}.supervisor.log", task.name));
        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;

        let mut cmd = Command::new(&self.config.supervisor_bin);
        cmd.args(&self.config.supervisor_args)
            .arg("--socket")
            .arg(socket)
            .arg("--linger-secs")
            .arg(self.config.supervisor_linger.as_secs().to_string())
            .env(TOKEN_ENV, token)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);

        // SAFETY: setsid is async-signal-safe
        unsafe {
            cmd.pre_exec(|| {
                setsid()?;
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| {
            DriverError::Launch(format!(
                "cannot start supervisor {}: {}",
                self.config.supervisor_bin.display(),
                e
            ))
        })?;
        debug!("Spawned supervisor {} for {}", child.id(), task.name);
        Ok(child)
    }

    fn wait_until_ready(&self, child: &mut Child, client: &SupervisorClient) -> Result<()> {
        let deadline = Instant::now() + self.config.supervisor_start_timeout;
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(200));
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(DriverError::Launch(format!(
                    "supervisor exited during startup ({})",
                    status
                )));
            }
            if client.ping().is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Launch(format!(
                    "supervisor did not answer within {:?}",
                    self.config.supervisor_start_timeout
                )));
            }
            thread::sleep(backoff.next_delay());
        }
    }
}

/// Collect the supervisor's exit status in the background
fn reap(mut child: Child) {
    let pid = child.id();
    let spawned = thread::Builder::new()
        .name(format!("reap-{}", pid))
        .spawn(move || match child.wait() {
            Ok(status) => debug!("Supervisor {} exited: {}", pid, status),
            Err(e) => warn!("Failed to reap supervisor {}: {}", pid, e),
        });
    if let Err(e) = spawned {
        warn!("Cannot reap supervisor {}: {}", pid, e);
    }
}

fn discard_supervisor(id: &HandleId) {
    let socket = id.socket.display().to_string();
    // Only kill the pid if it still is this task's supervisor
    if utils::process_alive(id.supervisor_pid) && utils::cmdline_contains(id.supervisor_pid, &socket) {
        match kill(Pid::from_raw(id.supervisor_pid), Signal::SIGKILL) {
            Ok(()) => info!("Killed unreachable supervisor {}", id.supervisor_pid),
            Err(e) => warn!("Failed to kill supervisor {}: {}", id.supervisor_pid, e),
        }
    }
    if id.socket.exists() {
        if let Err(e) = fs::remove_file(&id.socket) {
            debug!("Could not remove {}: {}", id.socket.display(), e);
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::PrivilegeMode;
    use tempfile::tempdir;

    fn facts(euid: u32, cgroup: bool) -> HostFacts {
        HostFacts {
            os: "linux".to_string(),
            euid,
            cgroup_mountpoint: cgroup.then(|| PathBuf::from("/sys/fs/cgroup")),
            kernel_release: None,
        }
    }

    fn driver(mode: PrivilegeMode, facts: HostFacts) -> ExecDriver {
        ExecDriver::with_facts(DriverConfig::default().privilege_mode(mode), facts).unwrap()
    }

    #[test]
    fn test_fingerprint_sets_attributes() {
        let mut node = Node::default();
        let applies = driver(PrivilegeMode::Auto, facts(0, true)).fingerprint(&mut node).unwrap();
        assert!(applies);
        assert_eq!(node.attribute("driver.exec"), Some("1"));
        assert_eq!(node.attribute("driver.exec.mode"), Some("privileged"));
        assert_eq!(node.attribute("driver.exec.version"), Some(DRIVER_VERSION));
    }

    #[test]
    fn test_fingerprint_negative_keeps_unrelated_attributes() {
        let mut node = Node::default();
        node.attributes.insert("driver.exec".into(), "1".into());
        node.attributes.insert("driver.exec.mode".into(), "privileged".into());
        node.attributes.insert("driver.executor".into(), "keep".into());
        node.attributes.insert("kernel.name".into(), "linux".into());

        let applies = driver(PrivilegeMode::Privileged, facts(1000, true))
            .fingerprint(&mut node)
            .unwrap();
        assert!(!applies);
        assert!(node.attribute("driver.exec").is_none());
        assert!(node.attribute("driver.exec.mode").is_none());
        assert_eq!(node.attribute("driver.executor"), Some("keep"));
        assert_eq!(node.attribute("kernel.name"), Some("linux"));
    }

    #[test]
    fn test_fingerprint_uses_cgroup_mount_attribute() {
        let mut node = Node::default();
        node.attributes
            .insert(CGROUP_MOUNT_ATTR.to_string(), "/custom/cgroup".to_string());
        let applies = driver(PrivilegeMode::Privileged, facts(0, false))
            .fingerprint(&mut node)
            .unwrap();
        assert!(applies);
    }

    #[test]
    fn test_fingerprint_never_applies_off_linux() {
        let mut host = facts(1000, false);
        host.os = "macos".to_string();
        let mut node = Node::default();
        assert!(!driver(PrivilegeMode::Unprivileged, host).fingerprint(&mut node).unwrap());
    }

    #[test]
    fn test_unprivileged_prestart_is_idempotent() {
        let tmp = tempdir().unwrap();
        let alloc = AllocDir::new(tmp.path().join("a1"));
        alloc.build().unwrap();
        alloc.task_dir("web").build().unwrap();
        let ctx = ExecContext::new(alloc.clone());
        let task = Task::new("a1", "web", "/bin/true");

        let d = driver(PrivilegeMode::Unprivileged, facts(1000, false));
        let first = d.prestart(&ctx, &task).unwrap();
        let second = d.prestart(&ctx, &task).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.sandbox.root, alloc.task_dir("web").dir);
        assert!(first.sandbox.cgroup.is_none());
        d.cleanup(&first).unwrap();
    }

    #[test]
    fn test_default_config_refuses_hosts_without_root() {
        let tmp = tempdir().unwrap();
        let alloc = AllocDir::new(tmp.path().join("a1"));
        alloc.build().unwrap();
        alloc.task_dir("web").build().unwrap();
        let ctx = ExecContext::new(alloc);
        let task = Task::new("a1", "web", "/bin/true");

        let d = ExecDriver::with_facts(DriverConfig::default(), facts(1000, true)).unwrap();
        assert_eq!(d.mode(), ResolvedMode::Privileged);

        let mut node = Node::default();
        assert!(!d.fingerprint(&mut node).unwrap());
        assert!(node.attribute("driver.exec").is_none());

        let err = d.prestart(&ctx, &task).unwrap_err();
        assert!(matches!(err, DriverError::SandboxSetup(_)));
        assert!(err.to_string().contains("requires root"));
    }

    #[test]
    fn test_launch_spec_carries_default_user() {
        let tmp = tempdir().unwrap();
        let alloc = AllocDir::new(tmp.path().join("a1"));
        alloc.build().unwrap();
        let task_dir = alloc.task_dir("web");
        task_dir.build().unwrap();
        let ctx = ExecContext::new(alloc);
        let task = Task::new("a1", "web", "/bin/true");

        let d = driver(PrivilegeMode::Unprivileged, facts(1000, false));
        let spec = d.launch_spec(&ctx, &task_dir, &task).unwrap();
        assert_eq!(spec.default_user.as_deref(), Some("nobody"));
    }

    #[test]
    fn test_prestart_requires_allocation_layout() {
        let tmp = tempdir().unwrap();
        let ctx = ExecContext::new(AllocDir::new(tmp.path().join("missing")));
        let task = Task::new("a1", "web", "/bin/true");
        let err = driver(PrivilegeMode::Unprivileged, facts(1000, false))
            .prestart(&ctx, &task)
            .unwrap_err();
        assert!(matches!(err, DriverError::SandboxSetup(_)));
    }

    #[test]
    fn test_privileged_start_requires_prestart_cgroup() {
        let tmp = tempdir().unwrap();
        let alloc = AllocDir::new(tmp.path().join("a1"));
        alloc.build().unwrap();
        let task_dir = alloc.task_dir("web");
        task_dir.build().unwrap();
        let ctx = ExecContext::new(alloc);
        let task = Task::new("a1", "web", "/bin/true");

        let config = DriverConfig::default()
            .privilege_mode(PrivilegeMode::Privileged)
            .cgroup_root(tmp.path().join("cgroup"))
            .user_denylist(&["root", "daemon"]);
        let d = ExecDriver::with_facts(config, facts(0, true)).unwrap();

        let err = d.start(&ctx, &task).err().unwrap();
        assert!(matches!(err, DriverError::SandboxSetup(_)));

        fs::create_dir_all(tmp.path().join("cgroup/exec-driver/a1-web")).unwrap();
        let spec = d.launch_spec(&ctx, &task_dir, &task).unwrap();
        assert_eq!(spec.chroot, Some(task_dir.dir.clone()));
        assert_eq!(spec.user_denylist, vec!["root", "daemon"]);
        assert_eq!(spec.max_kill_timeout_ms, 30_000);
    }

    #[test]
    fn test_open_rejects_malformed_id() {
        let d = driver(PrivilegeMode::Unprivileged, facts(1000, false));
        assert!(matches!(d.open("{"), Err(DriverError::Reattach(_))));
    }

    #[test]
    fn test_open_unreachable_supervisor_removes_stale_socket() {
        let tmp = tempdir().unwrap();
        let socket = tmp.path().join(".web.sock");
        fs::write(&socket, "").unwrap();
        let id = HandleId {
            version: PROTOCOL_VERSION,
            task_name: "web".to_string(),
            supervisor_pid: 999_999_999,
            user_pid: 999_999_998,
            socket: socket.clone(),
            token: "t".to_string(),
            kill_timeout_ms: 0,
        };

        let d = driver(PrivilegeMode::Unprivileged, facts(1000, false));
        let err = d.open(&id.encode().unwrap()).unwrap_err();
        assert!(matches!(err, DriverError::Reattach(_)));
        assert!(!socket.exists());
    }
}
