//! exec-driver: process-isolation task driver
//!
//! Launches scheduler tasks inside a chroot + cgroup v2 sandbox (or under
//! rlimits when unprivileged), each owned by a detached supervisor process
//! so the task outlives the agent that started it. A serialized handle id
//! is enough to reattach after an agent restart.
//!
//! # Modules
//!
//! - **capabilities**: Host facts for capability detection
//! - **allocdir**: Allocation and task directory layout
//! - **isolation**: Task root filesystem and run-as user
//! - **resources**: Cgroup v2 limits with setrlimit fallback
//! - **execution**: Sandboxed process spawning and log rotation
//! - **monitoring**: Task resource usage
//! - **supervisor**: Per-task supervisor and its control protocol
//! - **driver**: Fingerprint, prestart, start, open and task handles
//!
//! # Example
//!
//! ```ignore
//! use exec_driver::{AllocDir, DriverConfig, ExecContext, ExecDriver, Task};
//!
//! let driver = ExecDriver::new(DriverConfig::from_env()?)?;
//! let ctx = ExecContext::new(AllocDir::new("/var/lib/alloc/a1"));
//! let task = Task::new("a1", "web", "/bin/sleep").args(["60"]);
//!
//! driver.prestart(&ctx, &task)?;
//! let handle = driver.start(&ctx, &task)?;
//! let id = handle.id()?;
//!
//! // later, possibly from another process
//! let handle = driver.open(&id)?;
//! let result = handle.wait_ch().recv();
//! println!("Successful: {}", result.successful());
//! ```

// Core modules
pub mod config;
pub mod errors;
pub mod privilege;
pub mod structs;
pub mod utils;

// Layered modules
pub mod allocdir;
pub mod capabilities;
pub mod execution;
pub mod isolation;
pub mod monitoring;
pub mod resources;
pub mod supervisor;

// Driver entry points
pub mod driver;

// Public API
pub use allocdir::{AllocDir, TaskDir};
pub use capabilities::HostFacts;
pub use config::DriverConfig;
pub use driver::{
    ExecContext, ExecDriver, ExecHandle, HandleId, PrestartResponse, SandboxInfo, ScriptExecutor,
    WaitCh,
};
pub use errors::{DriverError, Result};
pub use monitoring::ResourceUsage;
pub use privilege::{PrivilegeMode, ResolvedMode};
pub use structs::{LogConfig, Node, Resources, Task, WaitResult};
