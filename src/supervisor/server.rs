//! Supervisor side of the control socket
//!
//! The thread that calls [`serve`] forks the user process, so it must stay
//! alive until the supervisor exits: the child's parent-death signal is bound
//! to it. Launch is therefore handled inline and every other request on a
//! thread of its own.

use std::fs;
use std::io::{self, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::{getpid, Pid};

use super::protocol::{read_message, write_message, Envelope, LaunchSpec, Request, Response};
use crate::errors::{DriverError, Result};
use crate::execution::{build_task_env, exit_status_parts, spawn_log_copier, FileRotator, ProcessConfig};
use crate::isolation::{resolve_user, RunAs};
use crate::monitoring::ProcessMonitor;
use crate::resources::{Cgroup, CgroupConfig, RlimitConfig};
use crate::structs::WaitResult;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const WAITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Supervisor runtime options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub socket: PathBuf,
    pub token: String,
    /// How long to keep serving without a task, or after the task exited
    pub linger: Duration,
}

struct RunningTask {
    user_pid: Pid,
    spec: LaunchSpec,
    /// Template for exec-in-sandbox commands
    base: ProcessConfig,
    cgroup: Option<Cgroup>,
}

#[derive(Default)]
struct State {
    task: Option<Arc<RunningTask>>,
    result: Option<WaitResult>,
    /// Set as soon as the user pid was reaped; its number may be reused after
    exited: bool,
    killed: bool,
    shutdown: bool,
    launch_failed: bool,
    pending_waiters: usize,
    idle_since: Option<Instant>,
}

struct Supervisor {
    token: String,
    state: Mutex<State>,
    changed: Condvar,
}

impl Supervisor {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_waiter(&self) -> bool {
        let mut state = self.lock();
        if state.task.is_none() {
            return false;
        }
        state.pending_waiters += 1;
        true
    }

    fn release_waiter(&self) {
        let mut state = self.lock();
        state.pending_waiters = state.pending_waiters.saturating_sub(1);
        self.changed.notify_all();
    }

    fn running_task(&self) -> Result<Arc<RunningTask>> {
        self.lock()
            .task
            .clone()
            .ok_or_else(|| DriverError::Protocol("no task has been launched".to_string()))
    }
}

/// Serve the control socket until the supervisor is done.
///
/// Returns after a failed launch, after `Shutdown` once the task exited, or
/// once `linger` passed with nobody collecting the result.
pub fn serve(options: ServerOptions) -> Result<()> {
    let listener = bind(&options.socket)?;
    listener.set_nonblocking(true)?;
    info!(
        "Supervisor {} listening on {}",
        getpid(),
        options.socket.display()
    );

    let supervisor = Arc::new(Supervisor {
        token: options.token,
        state: Mutex::new(State {
            idle_since: Some(Instant::now()),
            ..Default::default()
        }),
        changed: Condvar::new(),
    });

    while !should_exit(&supervisor, options.linger) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = dispatch(&supervisor, stream) {
                    warn!("Failed to handle control connection: {}", e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!("accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }

    drain_waiters(&supervisor);
    if let Err(e) = fs::remove_file(&options.socket) {
        debug!("Could not remove {}: {}", options.socket.display(), e);
    }
    info!("Supervisor {} exiting", getpid());
    Ok(())
}

fn bind(socket: &Path) -> Result<UnixListener> {
    if socket.exists() {
        fs::remove_file(socket)?;
    }
    let listener = UnixListener::bind(socket).map_err(|e| {
        DriverError::Launch(format!("cannot bind {}: {}", socket.display(), e))
    })?;
    fs::set_permissions(socket, fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

fn should_exit(supervisor: &Supervisor, linger: Duration) -> bool {
    let state = supervisor.lock();
    if state.launch_failed {
        return true;
    }
    let task_done = state.task.is_none() || state.result.is_some();
    if state.shutdown && task_done {
        return true;
    }
    match state.idle_since {
        Some(since) => since.elapsed() >= linger,
        None => false,
    }
}

fn drain_waiters(supervisor: &Supervisor) {
    let deadline = Instant::now() + WAITER_DRAIN_TIMEOUT;
    let mut state = supervisor.lock();
    while state.pending_waiters > 0 {
        let now = Instant::now();
        if now >= deadline {
            warn!("{} waiters still pending at exit", state.pending_waiters);
            break;
        }
        state = supervisor
            .changed
            .wait_timeout(state, deadline - now)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
}

fn dispatch(supervisor: &Arc<Supervisor>, stream: UnixStream) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT))?;
    let envelope: Envelope = read_message(&mut BufReader::new(stream.try_clone()?))?;
    stream.set_read_timeout(None)?;

    if envelope.token != supervisor.token {
        warn!("Rejected control request with an invalid token");
        let err = DriverError::Protocol("invalid supervisor token".to_string());
        return reply(stream, Response::error(&err));
    }

    match envelope.request {
        Request::Launch(spec) => {
            let response = match launch(supervisor, spec) {
                Ok(user_pid) => Response::Launched {
                    supervisor_pid: getpid().as_raw(),
                    user_pid: user_pid.as_raw(),
                },
                Err(e) => {
                    error!("Launch failed: {}", e);
                    let mut state = supervisor.lock();
                    if state.task.is_none() {
                        state.launch_failed = true;
                    }
                    Response::error(&e)
                }
            };
            reply(stream, response)
        }
        request => {
            // Registered here so an exit decided on this thread still waits for the reply
            let waiting = matches!(request, Request::Wait) && supervisor.register_waiter();
            let supervisor = Arc::clone(supervisor);
            thread::Builder::new()
                .name("control".to_string())
                .spawn(move || {
                    let response = handle(&supervisor, request);
                    if let Err(e) = reply(stream, response) {
                        debug!("Failed to send reply: {}", e);
                    }
                    if waiting {
                        supervisor.release_waiter();
                    }
                })?;
            Ok(())
        }
    }
}

fn reply(mut stream: UnixStream, response: Response) -> Result<()> {
    write_message(&mut stream, &response)
}

fn handle(supervisor: &Arc<Supervisor>, request: Request) -> Response {
    let result = match request {
        Request::Ping => Ok(Response::Pong),
        Request::Wait => return wait(supervisor),
        Request::Signal { signal } => forward_signal(supervisor, signal).map(|_| Response::Ok),
        Request::Kill { grace_ms } => {
            kill_task(supervisor, Duration::from_millis(grace_ms)).map(|_| Response::Ok)
        }
        Request::Exec {
            path,
            args,
            timeout_ms,
        } => exec(supervisor, path, args, timeout_ms.map(Duration::from_millis)),
        Request::Stats => stats(supervisor),
        Request::Update { resources } => supervisor.running_task().and_then(|task| {
            if let Some(cgroup) = &task.cgroup {
                cgroup.apply_config(&CgroupConfig::from_resources(&resources))?;
            }
            Ok(Response::Ok)
        }),
        Request::Shutdown => {
            supervisor.lock().shutdown = true;
            Ok(Response::Ok)
        }
        Request::Launch(_) => Err(DriverError::Protocol(
            "launch must be the supervisor's first request".to_string(),
        )),
    };
    result.unwrap_or_else(|e| Response::error(&e))
}

/// Start the user process; runs on the serving thread.
fn launch(supervisor: &Arc<Supervisor>, spec: LaunchSpec) -> Result<Pid> {
    if supervisor.lock().task.is_some() {
        return Err(DriverError::Protocol("task already launched".to_string()));
    }

    let task = &spec.task;
    let run_as = resolve_user(
        task.user.as_deref(),
        spec.default_user.as_deref(),
        &spec.user_denylist,
        spec.mode,
    )?;
    let base = process_template(&spec, run_as)?;

    let cgroup = spec.cgroup.as_ref().map(Cgroup::open);
    if let Some(cgroup) = &cgroup {
        cgroup.apply_config(&CgroupConfig::from_resources(&task.resources))?;
    }

    let policy = task.log_config;
    let stdout_log = FileRotator::new(
        &spec.log_dir,
        format!("{}.stdout", task.name),
        policy.max_files,
        policy.max_file_size_bytes(),
    )?;
    let stderr_log = FileRotator::new(
        &spec.log_dir,
        format!("{}.stderr", task.name),
        policy.max_files,
        policy.max_file_size_bytes(),
    )?;

    let mut config = base.clone();
    config.program = task.command.clone();
    config.args = task.args.clone();
    let mut child = config.spawn_piped()?;
    let user_pid = Pid::from_raw(child.id() as i32);
    info!("Task {} started as pid {}", task.name, user_pid);

    let mut copiers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        copiers.push(spawn_log_copier(stdout, stdout_log)?);
    }
    if let Some(stderr) = child.stderr.take() {
        copiers.push(spawn_log_copier(stderr, stderr_log)?);
    }

    {
        let mut state = supervisor.lock();
        state.task = Some(Arc::new(RunningTask {
            user_pid,
            spec: spec.clone(),
            base,
            cgroup,
        }));
        state.idle_since = None;
    }

    let waiter = Arc::clone(supervisor);
    thread::Builder::new()
        .name("task-waiter".to_string())
        .spawn(move || {
            await_exit(user_pid);
            {
                let mut state = waiter.lock();
                state.exited = true;
                waiter.changed.notify_all();
            }
            let status = child.wait();
            drain_logs(copiers);

            let mut state = waiter.lock();
            let result = match status {
                Ok(status) => {
                    let (exit_code, signal) = exit_status_parts(status);
                    WaitResult {
                        exit_code,
                        signal,
                        killed: state.killed,
                        error: None,
                    }
                }
                Err(e) => WaitResult::failed(format!("wait failed: {}", e)),
            };
            info!("Task exited: {}", result);
            state.result = Some(result);
            state.idle_since = Some(Instant::now());
            waiter.changed.notify_all();
        })?;

    Ok(user_pid)
}

/// Settings shared by the task process and every exec
fn process_template(spec: &LaunchSpec, run_as: Option<RunAs>) -> Result<ProcessConfig> {
    let chrooted = spec.chroot.is_some();
    let env = if chrooted {
        build_task_env(&spec.task, Path::new("/alloc"), Path::new("/local"), Path::new("/"))
    } else {
        build_task_env(&spec.task, &spec.shared_dir, &spec.local_dir, &spec.task_dir)
    };

    let rlimits = if spec.mode.is_unprivileged() {
        RlimitConfig::from_resources(&spec.task.resources)
    } else {
        RlimitConfig::default()
    };

    Ok(ProcessConfig {
        program: String::new(),
        args: Vec::new(),
        env,
        cwd: if chrooted {
            PathBuf::from("/")
        } else {
            spec.task_dir.clone()
        },
        chroot_dir: spec.chroot.clone(),
        cgroup_procs: spec.cgroup.as_ref().map(|c| Cgroup::open(c).procs_file()),
        rlimits,
        run_as,
        die_with_parent: true,
    })
}

/// Block until `pid` exited, leaving it unreaped
fn await_exit(pid: Pid) {
    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Err(Errno::EINTR) => continue,
            Err(e) => {
                debug!("waitid({}) failed: {}", pid, e);
                return;
            }
            Ok(_) => return,
        }
    }
}

fn drain_logs(copiers: Vec<thread::JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for copier in copiers {
            let _ = copier.join();
        }
        let _ = tx.send(());
    });
    // A descendant that inherited the pipes can keep them open indefinitely
    if rx.recv_timeout(LOG_DRAIN_TIMEOUT).is_err() {
        warn!("Log copiers did not drain within {:?}", LOG_DRAIN_TIMEOUT);
    }
}

fn wait(supervisor: &Arc<Supervisor>) -> Response {
    let mut state = supervisor.lock();
    if state.task.is_none() {
        return Response::error(&DriverError::Protocol("no task has been launched".to_string()));
    }
    loop {
        if let Some(result) = &state.result {
            return Response::Exited(result.clone());
        }
        state = supervisor
            .changed
            .wait(state)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

fn forward_signal(supervisor: &Arc<Supervisor>, signal: i32) -> Result<()> {
    if !(1..=libc::SIGRTMAX()).contains(&signal) {
        return Err(DriverError::Protocol(format!("invalid signal {}", signal)));
    }
    let task = supervisor.running_task()?;
    let state = supervisor.lock();
    if state.exited {
        debug!("Not delivering {} to exited task", signal_name(signal));
        return Ok(());
    }
    // The pid is only reaped after `exited` is set under this lock
    deliver(task.user_pid, signal)
}

/// Send a raw signal number; real-time signals have no nix `Signal` variant
fn deliver(pid: Pid, signal: i32) -> Result<()> {
    let name = signal_name(signal);
    // SAFETY: kill has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid.as_raw(), signal) };
    if rc == 0 {
        debug!("Delivered {} to {}", name, pid);
        return Ok(());
    }
    match Errno::last() {
        Errno::ESRCH => {
            debug!("{} already gone, {} not delivered", pid, name);
            Ok(())
        }
        e => Err(DriverError::Syscall(format!("kill({}, {}) failed: {}", pid, name, e))),
    }
}

fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|sig| sig.to_string())
        .unwrap_or_else(|_| format!("signal {}", signal))
}

fn kill_task(supervisor: &Arc<Supervisor>, grace: Duration) -> Result<()> {
    let task = supervisor.running_task()?;
    let grace = grace.min(Duration::from_millis(task.spec.max_kill_timeout_ms));
    {
        let mut state = supervisor.lock();
        if state.exited {
            return Ok(());
        }
        state.killed = true;
        deliver(task.user_pid, Signal::SIGINT as i32)?;
    }

    let supervisor = Arc::clone(supervisor);
    thread::Builder::new()
        .name("kill-escalation".to_string())
        .spawn(move || {
            let state = supervisor.lock();
            let (state, _) = supervisor
                .changed
                .wait_timeout_while(state, grace, |s| !s.exited)
                .unwrap_or_else(PoisonError::into_inner);
            if state.exited {
                return;
            }

            warn!("Task did not exit within {:?}, sending SIGKILL", grace);
            match killpg(task.user_pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("killpg({}) failed: {}", task.user_pid, e),
            }
            if let Some(cgroup) = &task.cgroup {
                if let Err(e) = cgroup.kill_all() {
                    warn!("Failed to kill cgroup members: {}", e);
                }
            }
        })?;
    Ok(())
}

fn exec(
    supervisor: &Arc<Supervisor>,
    path: String,
    args: Vec<String>,
    timeout: Option<Duration>,
) -> Result<Response> {
    let task = supervisor.running_task()?;
    let mut config = task.base.clone();
    config.program = path;
    config.args = args;
    let (output, exit_code) = config.run_combined(timeout)?;
    Ok(Response::ExecOutput { output, exit_code })
}

fn stats(supervisor: &Arc<Supervisor>) -> Result<Response> {
    let task = supervisor.running_task()?;
    let usage = ProcessMonitor::new(task.user_pid, task.cgroup.clone()).collect()?;
    Ok(Response::Stats(usage))
}
