//! Process execution within a task sandbox
//!
//! Everything that changes the child's view of the system happens in a
//! `pre_exec` hook, in this order:
//! 1. Join the task cgroup (so every later fork is accounted)
//! 2. Arm the parent-death signal and re-check the parent
//! 3. Apply resource limits
//! 4. Chroot and chdir
//! 5. Drop supplementary groups, GID, UID
//!
//! std applies `uid`/`gid`/`current_dir` before `pre_exec`, which would
//! break step 4, so none of those builder methods are used.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::fcntl::OFlag;
use nix::sys::prctl;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{access, chdir, chroot, getpid, getppid, pipe2, AccessFlags, Pid};

use crate::errors::{DriverError, Result};
use crate::isolation::chroot::host_path;
use crate::isolation::RunAs;
use crate::resources::RlimitConfig;
use crate::structs::Task;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Exec output kept per command; the rest is read and dropped
pub const MAX_EXEC_OUTPUT: u64 = 2 * 1024 * 1024;

/// Process execution configuration
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Program to execute
    pub program: String,
    /// Program arguments
    pub args: Vec<String>,
    /// Complete environment (nothing is inherited)
    pub env: Vec<(String, String)>,
    /// Working directory (inside the sandbox)
    pub cwd: PathBuf,
    /// Root directory for chroot
    pub chroot_dir: Option<PathBuf>,
    /// `cgroup.procs` of the task's cgroup
    pub cgroup_procs: Option<PathBuf>,
    /// Resource limits (unprivileged fallback via setrlimit)
    pub rlimits: RlimitConfig,
    /// Identity to switch to
    pub run_as: Option<RunAs>,
    /// SIGKILL the child when the spawning thread dies
    pub die_with_parent: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: PathBuf::from("/"),
            chroot_dir: None,
            cgroup_procs: None,
            rlimits: RlimitConfig::default(),
            run_as: None,
            die_with_parent: true,
        }
    }
}

impl ProcessConfig {
    /// Build a command that sets up the sandbox in the child before exec
    pub fn command(&self) -> Result<Command> {
        let program = resolve_program_path(&self.program, &self.env, self.chroot_dir.as_deref())?;

        let cgroup_procs = self
            .cgroup_procs
            .as_ref()
            .map(|path| {
                OpenOptions::new().write(true).open(path).map_err(|e| {
                    DriverError::Cgroup(format!("Failed to open {}: {}", path.display(), e))
                })
            })
            .transpose()?;
        let chroot_dir = self.chroot_dir.as_deref().map(path_cstring).transpose()?;
        let cwd = path_cstring(&self.cwd)?;
        let run_as = self.run_as.clone();
        let groups = run_as.as_ref().map(RunAs::gids).unwrap_or_default();
        let rlimits = self.rlimits;
        let parent = self.die_with_parent.then(getpid);

        let mut cmd = Command::new(&program);
        cmd.args(&self.args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .process_group(0);

        // SAFETY: the hook only issues syscalls and touches memory prepared
        // before fork; nothing in it allocates.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(mut procs) = cgroup_procs.as_ref() {
                    procs.write_all(b"0")?;
                }

                if let Some(parent) = parent {
                    prctl::set_pdeathsig(Signal::SIGKILL)?;
                    // The parent may have died before the signal was armed
                    if getppid() != parent {
                        return Err(io::Error::from_raw_os_error(libc::ESRCH));
                    }
                }

                rlimits.apply()?;

                if let Some(root) = chroot_dir.as_ref() {
                    chroot(root.as_c_str())?;
                }
                chdir(cwd.as_c_str())?;

                if let Some(user) = run_as.as_ref() {
                    user.apply(&groups)?;
                }
                Ok(())
            });
        }

        Ok(cmd)
    }

    /// Spawn with stdout and stderr piped back to the caller
    pub fn spawn_piped(&self) -> Result<Child> {
        let mut cmd = self.command()?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|e| {
            DriverError::Launch(format!("failed to start {}: {}", self.program, e))
        })?;
        debug!("Started {} as pid {}", self.program, child.id());
        Ok(child)
    }

    /// Run to completion, returning combined stdout+stderr and the exit code.
    ///
    /// A nonzero exit code is a normal result. Only a failure to start or
    /// an expired `timeout` is an error. Output past [`MAX_EXEC_OUTPUT`]
    /// bytes is discarded.
    pub fn run_combined(&self, timeout: Option<Duration>) -> Result<(Vec<u8>, i32)> {
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| DriverError::Syscall(format!("pipe failed: {}", e)))?;
        let write_clone = write_end.try_clone()?;

        let mut cmd = self.command()?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(write_clone));
        let spawned = cmd.spawn();
        // The command owns our copies of the write end; EOF needs them closed.
        drop(cmd);
        let mut child = spawned
            .map_err(|e| DriverError::Exec(format!("failed to start {}: {}", self.program, e)))?;

        let reader = thread::spawn(move || {
            let mut pipe = File::from(read_end);
            let mut output = Vec::new();
            if let Err(e) = std::io::Read::by_ref(&mut pipe).take(MAX_EXEC_OUTPUT).read_to_end(&mut output) {
                warn!("Failed to read exec output: {}", e);
            }
            // Keep the pipe drained so the command cannot block on it
            match io::copy(&mut pipe, &mut io::sink()) {
                Ok(0) => {}
                Ok(dropped) => warn!("Exec output truncated, {} bytes dropped", dropped),
                Err(e) => debug!("Failed to drain exec output: {}", e),
            }
            output
        });

        let status = match wait_with_timeout(&mut child, timeout)? {
            Some(status) => status,
            None => {
                let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
                let _ = child.wait();
                let _ = reader.join();
                return Err(DriverError::Timeout);
            }
        };

        let output = reader.join().unwrap_or_default();
        Ok((output, exit_status_parts(status).0))
    }
}

/// Split an exit status into (exit code, signal); signals map to 128 + signal
pub fn exit_status_parts(status: ExitStatus) -> (i32, i32) {
    match (status.code(), status.signal()) {
        (Some(code), _) => (code, 0),
        (None, Some(signal)) => (128 + signal, signal),
        (None, None) => (-1, 0),
    }
}

/// Environment a task process starts with.
///
/// `alloc_dir`, `local_dir` and `task_dir` are given as the task sees them.
pub fn build_task_env(
    task: &Task,
    alloc_dir: &Path,
    local_dir: &Path,
    task_dir: &Path,
) -> Vec<(String, String)> {
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), DEFAULT_PATH.to_string());
    for (key, value) in &task.env {
        env.insert(key.clone(), value.clone());
    }
    env.insert("TASK_NAME".to_string(), task.name.clone());
    env.insert("TASK_ALLOC_ID".to_string(), task.alloc_id.clone());
    env.insert("TASK_ALLOC_DIR".to_string(), alloc_dir.display().to_string());
    env.insert("TASK_LOCAL_DIR".to_string(), local_dir.display().to_string());
    env.insert("TASK_DIR".to_string(), task_dir.display().to_string());
    env.into_iter().collect()
}

/// Resolve a program name to an absolute in-sandbox path using PATH semantics.
fn resolve_program_path(
    program: &str,
    env: &[(String, String)],
    root: Option<&Path>,
) -> Result<String> {
    if program.is_empty() {
        return Err(DriverError::InvalidConfig("empty command".to_string()));
    }
    if program.contains('/') {
        return Ok(program.to_string());
    }

    let path_value = env
        .iter()
        .find(|(key, _)| key == "PATH")
        .map(|(_, value)| value.as_str())
        .unwrap_or(DEFAULT_PATH);

    for entry in path_value.split(':').filter(|e| !e.is_empty()) {
        let candidate = Path::new(entry).join(program);
        let on_host = match root {
            Some(root) => host_path(root, &candidate),
            None => candidate.clone(),
        };

        if access(&on_host, AccessFlags::X_OK).is_ok() {
            return Ok(candidate.to_string_lossy().into_owned());
        }
    }

    Err(DriverError::Exec(format!("command not found: {}", program)))
}

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        DriverError::InvalidConfig(format!("path contains a NUL byte: {}", path.display()))
    })
}

/// Wait for the child, giving up after `timeout`. `None` means it expired.
fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return Ok(Some(child.wait()?));
    };

    let deadline = Instant::now() + timeout;
    let mut backoff = Duration::from_millis(5);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(backoff.min(deadline - now));
        backoff = (backoff * 2).min(Duration::from_millis(100));
    }
}
