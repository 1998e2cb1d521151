//! Execution layer: task and exec-in-sandbox processes
//!
//! This module spawns processes inside a task's sandbox and wires their
//! output into the task's log files.
//!
//! # Features
//!
//! - **Sandbox setup in the child**: cgroup join, parent-death signal, rlimits, chroot
//! - **Credential switching**: supplementary groups, GID and UID drop
//! - **Log rotation**: size-bounded `<task>.stdout.<n>` / `<task>.stderr.<n>` files
//!
//! # Examples
//!
//! ```ignore
//! use exec_driver::execution::ProcessConfig;
//!
//! let config = ProcessConfig {
//!     program: "/bin/sh".to_string(),
//!     args: vec!["-c".to_string(), "echo hi".to_string()],
//!     ..Default::default()
//! };
//! let (output, exit_code) = config.run_combined(None)?;
//! ```

pub mod logs;
pub mod process;
pub use logs::{spawn_log_copier, FileRotator};
pub use process::{build_task_env, exit_status_parts, ProcessConfig, MAX_EXEC_OUTPUT};
