//! Wire protocol for supervisor communication (JSON lines)

use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::monitoring::ResourceUsage;
use crate::privilege::ResolvedMode;
use crate::structs::{Resources, Task, WaitResult};

/// Major version of the protocol and of the serialized handle
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the supervisor's access token
pub const TOKEN_ENV: &str = "EXEC_DRIVER_SUPERVISOR_TOKEN";

/// Longest accepted message line
const MAX_MESSAGE_BYTES: u64 = 16 * 1024 * 1024;

// sun_path is 108 bytes including the terminating NUL
const MAX_SOCKET_PATH: usize = 107;

/// Everything the supervisor needs to start the user process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub task: Task,
    pub mode: ResolvedMode,
    /// Host paths of the allocation layout
    pub alloc_dir: PathBuf,
    pub shared_dir: PathBuf,
    pub task_dir: PathBuf,
    pub local_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Task root to chroot into (privileged mode)
    #[serde(default)]
    pub chroot: Option<PathBuf>,
    /// Task cgroup directory (privileged mode)
    #[serde(default)]
    pub cgroup: Option<PathBuf>,
    /// Run-as user for privileged tasks that name none
    #[serde(default)]
    pub default_user: Option<String>,
    #[serde(default)]
    pub user_denylist: Vec<String>,
    /// Upper bound for any kill grace period
    pub max_kill_timeout_ms: u64,
}

/// Request types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Liveness check
    Ping,
    /// Start the user process
    Launch(LaunchSpec),
    /// Block until the user process exited
    Wait,
    /// Forward a signal to the user process
    Signal { signal: i32 },
    /// Interrupt, then force-kill after `grace_ms`
    Kill { grace_ms: u64 },
    /// Run an additional command inside the sandbox
    Exec {
        path: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Resource usage snapshot
    Stats,
    /// Adjust resource limits in place
    Update { resources: Resources },
    /// Exit once the task has exited
    Shutdown,
}

/// Response types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Launched { supervisor_pid: i32, user_pid: i32 },
    Exited(WaitResult),
    Ok,
    ExecOutput { output: Vec<u8>, exit_code: i32 },
    Stats(ResourceUsage),
    Error(RemoteError),
}

/// Authenticated request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub token: String,
    pub request: Request,
}

/// Category of a [`RemoteError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Permission,
    SandboxSetup,
    Launch,
    Exec,
    Timeout,
    Protocol,
    Other,
}

/// A [`DriverError`] carried across the socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub user: Option<String>,
}

impl From<&DriverError> for RemoteError {
    fn from(err: &DriverError) -> Self {
        let (kind, message, user) = match err {
            DriverError::Permission { user, reason } => {
                (ErrorKind::Permission, reason.clone(), Some(user.clone()))
            }
            DriverError::SandboxSetup(msg) => (ErrorKind::SandboxSetup, msg.clone(), None),
            DriverError::Launch(msg) => (ErrorKind::Launch, msg.clone(), None),
            DriverError::Exec(msg) => (ErrorKind::Exec, msg.clone(), None),
            DriverError::Timeout => (ErrorKind::Timeout, err.to_string(), None),
            DriverError::Protocol(msg) => (ErrorKind::Protocol, msg.clone(), None),
            other => (ErrorKind::Other, other.to_string(), None),
        };
        RemoteError { kind, message, user }
    }
}

impl From<RemoteError> for DriverError {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            ErrorKind::Permission => {
                DriverError::permission(err.user.unwrap_or_default(), err.message)
            }
            ErrorKind::SandboxSetup => DriverError::SandboxSetup(err.message),
            ErrorKind::Launch => DriverError::Launch(err.message),
            ErrorKind::Exec => DriverError::Exec(err.message),
            ErrorKind::Timeout => DriverError::Timeout,
            ErrorKind::Protocol => DriverError::Protocol(err.message),
            ErrorKind::Other => DriverError::Protocol(format!("supervisor: {}", err.message)),
        }
    }
}

impl Response {
    pub fn error(err: &DriverError) -> Self {
        Response::Error(err.into())
    }
}

/// Write one message followed by a newline
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// Read one newline-terminated message
pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut line = String::new();
    let read = reader.take(MAX_MESSAGE_BYTES).read_line(&mut line)?;
    if read == 0 {
        return Err(DriverError::Protocol("connection closed before a message arrived".to_string()));
    }
    if !line.ends_with('\n') {
        return Err(DriverError::Protocol("truncated or oversized message".to_string()));
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Control socket location for a task.
///
/// Lives in the allocation directory unless that path is too long for a
/// Unix socket, in which case a unique name in the temp dir is used.
pub fn socket_path(alloc_dir: &Path, task_name: &str) -> PathBuf {
    let preferred = alloc_dir.join(format!(".{}.sock", task_name));
    if preferred.as_os_str().len() <= MAX_SOCKET_PATH {
        return preferred;
    }
    let id = uuid::Uuid::new_v4().simple().to_string();
    std::env::temp_dir().join(format!("exec-driver-{}.sock", &id[..16]))
}
