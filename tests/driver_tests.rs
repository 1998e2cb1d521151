//! End-to-end tests driving real supervisor processes
//!
//! The supervisor is this crate's own binary. Tests that need root are
//! marked with #[ignore] and can be run with:
//!   sudo cargo test -- --ignored

use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use exec_driver::utils::process_alive;
use exec_driver::{
    AllocDir, DriverConfig, DriverError, ExecContext, ExecDriver, ExecHandle, HandleId, Node,
    PrivilegeMode, Resources, Task,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::{tempdir, TempDir};

static DRIVER_TEST_LOCK: Mutex<()> = Mutex::new(());

const WAIT_LIMIT: Duration = Duration::from_secs(20);

fn config(mode: PrivilegeMode) -> DriverConfig {
    DriverConfig::default()
        .supervisor(env!("CARGO_BIN_EXE_exec-driver"), &["supervisor"])
        .privilege_mode(mode)
        .supervisor_linger(Duration::from_secs(30))
}

struct Harness {
    _tmp: TempDir,
    driver: ExecDriver,
    ctx: ExecContext,
}

impl Harness {
    fn new(mode: PrivilegeMode) -> Self {
        let tmp = tempdir().unwrap();
        let alloc = AllocDir::new(tmp.path().join("a1"));
        alloc.build().unwrap();
        Self {
            _tmp: tmp,
            driver: ExecDriver::new(config(mode)).unwrap(),
            ctx: ExecContext::new(alloc),
        }
    }

    fn unprivileged() -> Self {
        Self::new(PrivilegeMode::Unprivileged)
    }

    fn start(&self, task: &Task) -> exec_driver::Result<ExecHandle> {
        self.ctx.alloc_dir.task_dir(&task.name).build().unwrap();
        self.driver.prestart(&self.ctx, task)?;
        self.driver.start(&self.ctx, task)
    }

    fn log_dir(&self, task: &str) -> std::path::PathBuf {
        self.ctx.alloc_dir.task_dir(task).log_dir
    }
}

fn shell(name: &str, script: &str) -> Task {
    Task::new("a1", name, "/bin/sh").args(["-c", script])
}

fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(50));
    }
}

fn wait_for_file(path: &Path) {
    wait_for(&path.display().to_string(), || path.exists());
}

#[test]
fn test_fingerprint_reports_driver() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let driver = ExecDriver::new(config(PrivilegeMode::Unprivileged)).unwrap();
    let mut node = Node::default();

    let healthy = driver.fingerprint(&mut node).unwrap();
    assert_eq!(healthy, node.attribute("driver.exec") == Some("1"));
}

#[test]
fn test_start_open_wait() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();
    let task = shell("sleeper", "sleep 1");

    let handle = h.start(&task).unwrap();
    assert!(handle.user_pid() > 0);
    assert!(process_alive(handle.user_pid()));

    let reopened = h.driver.open(&handle.id().unwrap()).unwrap();
    assert_eq!(reopened.user_pid(), handle.user_pid());
    assert_eq!(reopened.supervisor_pid(), handle.supervisor_pid());

    let first = handle.wait_ch().recv_timeout(WAIT_LIMIT).unwrap();
    let second = reopened.wait_ch().recv_timeout(WAIT_LIMIT).unwrap();
    assert!(first.successful(), "{}", first);
    assert_eq!(first, second);
}

#[test]
fn test_reopened_handles_control_the_task() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();
    let script = "trap 'echo usr1 >> \"$TASK_DIR/seen\"' USR1; touch \"$TASK_DIR/ready\"; \
                  while true; do sleep 0.1; done";
    let task = shell("shared", script).kill_timeout(Duration::from_millis(500));
    let task_dir = h.ctx.alloc_dir.task_dir("shared").dir;

    let handle = h.start(&task).unwrap();
    wait_for_file(&task_dir.join("ready"));

    // Two agents reattaching to the same identity at once
    let id = handle.id().unwrap();
    let (first, second) = thread::scope(|s| {
        let a = s.spawn(|| h.driver.open(&id));
        let b = s.spawn(|| h.driver.open(&id));
        (a.join().unwrap().unwrap(), b.join().unwrap().unwrap())
    });
    assert_eq!(first.id().unwrap(), id);
    assert_eq!(second.user_pid(), handle.user_pid());

    let echo = ["-c".to_string(), "echo $TASK_NAME".to_string()];
    let (output, code) = first.exec(Some(Duration::from_secs(5)), "sh", &echo).unwrap();
    assert_eq!(code, 0);
    assert_eq!(String::from_utf8_lossy(&output), "shared\n");

    first.signal(Signal::SIGUSR1 as i32).unwrap();
    let seen = task_dir.join("seen");
    wait_for("forwarded USR1", || {
        fs::read_to_string(&seen).map(|s| s == "usr1\n").unwrap_or(false)
    });
    assert!(handle.wait_ch().try_recv().is_none());

    second.kill().unwrap();
    let results: Vec<_> = [&handle, &first, &second]
        .iter()
        .map(|each| each.wait_ch().recv_timeout(WAIT_LIMIT).unwrap())
        .collect();
    assert!(results[0].killed, "{}", results[0]);
    assert!(!results[0].successful());
    assert!(results.iter().all(|r| *r == results[0]));
}

#[test]
fn test_start_wait_success() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();
    let task = shell("ok", "echo \"started $TASK_NAME\"");

    let handle = h.start(&task).unwrap();
    let result = handle.wait_ch().recv_timeout(WAIT_LIMIT).unwrap();
    assert!(result.successful());
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.signal, 0);

    let stdout = fs::read_to_string(h.log_dir("ok").join("ok.stdout.0")).unwrap();
    assert_eq!(stdout, "started ok\n");
}

#[test]
fn test_nonzero_exit_is_reported() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();

    let handle = h.start(&shell("fails", "echo oops >&2; exit 7")).unwrap();
    let result = handle.wait_ch().recv_timeout(WAIT_LIMIT).unwrap();
    assert_eq!(result.exit_code, 7);
    assert!(!result.successful());

    let stderr = fs::read_to_string(h.log_dir("fails").join("fails.stderr.0")).unwrap();
    assert_eq!(stderr, "oops\n");
}

#[test]
fn test_update_is_applied_in_place() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();
    let task = shell("upd", "exec sleep 30");

    let handle = h.start(&task).unwrap();
    let revised = task
        .clone()
        .kill_timeout(Duration::from_secs(7))
        .resources(Resources {
            memory_mb: Some(512),
            ..Default::default()
        });
    handle.update(&revised).unwrap();

    let id = HandleId::decode(&handle.id().unwrap()).unwrap();
    assert_eq!(id.kill_timeout_ms, 7_000);

    handle.kill().unwrap();
    handle.wait_ch().recv_timeout(WAIT_LIMIT).unwrap();
}

#[test]
fn test_shared_dir_is_writable() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();
    let task = shell("writer", "echo payload > \"$TASK_ALLOC_DIR/out.txt\"");

    let handle = h.start(&task).unwrap();
    let result = handle.wait_ch().recv_timeout(WAIT_LIMIT).unwrap();
    assert!(result.successful(), "{}", result);

    let written = fs::read_to_string(h.ctx.alloc_dir.shared_dir.join("out.txt")).unwrap();
    assert_eq!(written, "payload\n");
}

#[test]
fn test_kill_is_not_successful() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();

    let handle = h.start(&shell("victim", "exec sleep 30")).unwrap();
    handle.kill().unwrap();

    let result = handle.wait_ch().recv_timeout(WAIT_LIMIT).unwrap();
    assert!(result.killed);
    assert!(!result.successful());

    // Killing again after exit is a no-op
    handle.kill().unwrap();
}

#[test]
fn test_kill_escalates_after_timeout() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();
    let task = shell("stubborn", "trap '' INT; sleep 30").kill_timeout(Duration::from_millis(500));

    let handle = h.start(&task).unwrap();
    let started = Instant::now();
    handle.kill().unwrap();

    let result = handle.wait_ch().recv_timeout(WAIT_LIMIT).unwrap();
    assert_eq!(result.signal, Signal::SIGKILL as i32);
    assert!(started.elapsed() >= Duration::from_millis(500));
}

#[test]
fn test_signal_is_forwarded() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();
    let script = "trap 'echo Terminated.; exit 3' USR1; touch \"$TASK_DIR/ready\"; \
                  while true; do sleep 0.1; done";

    let handle = h.start(&shell("trapper", script)).unwrap();
    wait_for_file(&h.ctx.alloc_dir.task_dir("trapper").dir.join("ready"));

    handle.signal(Signal::SIGUSR1 as i32).unwrap();
    let result = handle.wait_ch().recv_timeout(WAIT_LIMIT).unwrap();
    assert_eq!(result.exit_code, 3);
    assert!(!result.killed);

    let stdout = fs::read_to_string(h.log_dir("trapper").join("trapper.stdout.0")).unwrap();
    assert_eq!(stdout, "Terminated.\n");
}

#[test]
fn test_unknown_user_is_rejected() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();
    let task = shell("who", "true").user("exec-driver-no-such-user");

    let err = h.start(&task).err().unwrap();
    assert!(matches!(err, DriverError::Permission { .. }), "{:?}", err);
    assert!(err.to_string().contains("user exec-driver-no-such-user"));

    // Nothing keeps the socket alive after a rejected launch
    let socket = h.ctx.alloc_dir.alloc_dir.join(".who.sock");
    wait_for("socket removal", || !socket.exists());
}

#[test]
fn test_denylisted_user_is_rejected() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();

    let err = h.start(&shell("as-root", "true").user("root")).err().unwrap();
    assert!(err.to_string().contains("user root"));
}

#[test]
fn test_exec_success_and_failure() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();

    let handle = h.start(&shell("host", "exec sleep 30")).unwrap();

    let shared = h.ctx.alloc_dir.shared_dir.display().to_string();
    let (output, code) = handle
        .exec(Some(Duration::from_secs(5)), "stat", &[shared.clone()])
        .unwrap();
    assert_eq!(code, 0);
    assert!(String::from_utf8_lossy(&output).contains(&shared));

    let (output, code) = handle
        .exec(None, "ls", &["/definitely/not/here".to_string()])
        .unwrap();
    assert_ne!(code, 0);
    assert!(String::from_utf8_lossy(&output).contains("No such file or directory"));

    handle.kill().unwrap();
    handle.wait_ch().recv_timeout(WAIT_LIMIT).unwrap();
}

#[test]
fn test_exec_timeout() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();

    let handle = h.start(&shell("slowexec", "exec sleep 30")).unwrap();
    let err = handle
        .exec(Some(Duration::from_millis(300)), "sleep", &["10".to_string()])
        .err()
        .unwrap();
    assert!(matches!(err, DriverError::Timeout), "{:?}", err);

    handle.kill().unwrap();
    handle.wait_ch().recv_timeout(WAIT_LIMIT).unwrap();
}

#[test]
fn test_stats_reports_usage() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();

    let handle = h.start(&shell("busy", "exec sleep 30")).unwrap();
    let usage = handle.stats().unwrap();
    assert!(usage.pids >= 1);
    assert!(usage.timestamp_ms > 0);

    handle.kill().unwrap();
    handle.wait_ch().recv_timeout(WAIT_LIMIT).unwrap();
}

#[test]
fn test_reattach_fails_after_supervisor_dies() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();

    let handle = h.start(&shell("orphan", "exec sleep 30")).unwrap();
    let id = handle.id().unwrap();
    let user_pid = handle.user_pid();

    kill(Pid::from_raw(handle.supervisor_pid()), Signal::SIGKILL).unwrap();
    wait_for("supervisor exit", || !process_alive(handle.supervisor_pid()));

    let err = h.driver.open(&id).err().unwrap();
    assert!(matches!(err, DriverError::Reattach(_)), "{:?}", err);

    // The user process follows its supervisor
    wait_for("user process exit", || !process_alive(user_pid));

    let result = handle.wait_ch().recv_timeout(WAIT_LIMIT).unwrap();
    assert!(result.error.is_some());
    assert!(!result.successful());
}

#[test]
fn test_open_rejects_garbage() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::unprivileged();
    assert!(matches!(
        h.driver.open("not a handle"),
        Err(DriverError::Reattach(_))
    ));
}

#[test]
#[ignore] // Requires root and cgroup v2
fn test_privileged_task_is_chrooted() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::new(PrivilegeMode::Privileged);
    let task = shell(
        "jailed",
        "test -d /alloc && test -d /local && test \"$TASK_DIR\" = / && test \"$(id -u)\" != 0 \
         && echo inside > /alloc/mark",
    )
    .resources(Resources {
        memory_mb: Some(128),
        ..Default::default()
    });

    h.ctx.alloc_dir.task_dir("jailed").build().unwrap();
    let sandbox = h.driver.prestart(&h.ctx, &task).unwrap();
    assert!(sandbox.sandbox.cgroup.is_some());
    assert!(!sandbox.sandbox.mounts.is_empty());

    let handle = h.driver.start(&h.ctx, &task).unwrap();
    let result = handle.wait_ch().recv_timeout(WAIT_LIMIT).unwrap();
    assert!(result.successful(), "{}", result);
    assert_eq!(
        fs::read_to_string(h.ctx.alloc_dir.shared_dir.join("mark")).unwrap(),
        "inside\n"
    );

    h.driver.cleanup(&sandbox).unwrap();
}

#[test]
#[ignore] // Requires root and cgroup v2
fn test_privileged_kill_reaches_whole_cgroup() {
    let _lock = DRIVER_TEST_LOCK.lock();
    let h = Harness::new(PrivilegeMode::Privileged);
    let task = shell("tree", "trap '' INT; (trap '' INT; sleep 60) & sleep 60")
        .kill_timeout(Duration::from_millis(500));

    h.ctx.alloc_dir.task_dir("tree").build().unwrap();
    let sandbox = h.driver.prestart(&h.ctx, &task).unwrap();
    let handle = h.driver.start(&h.ctx, &task).unwrap();

    handle.kill().unwrap();
    let result = handle.wait_ch().recv_timeout(WAIT_LIMIT).unwrap();
    assert!(result.killed);

    let procs = sandbox.sandbox.cgroup.as_ref().unwrap().join("cgroup.procs");
    wait_for("empty cgroup", || {
        fs::read_to_string(&procs).map(|s| s.trim().is_empty()).unwrap_or(true)
    });
    h.driver.cleanup(&sandbox).unwrap();
}
