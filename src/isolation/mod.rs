//! Isolation layer: task root filesystem + run-as user
//!
//! This module provides the filesystem root a privileged task is chrooted
//! into and the identity the task runs as.
//!
//! # Examples
//!
//! ```ignore
//! use exec_driver::isolation::{plan_mounts, resolve_user};
//!
//! let plan = plan_mounts(&task_root, &chroot_env, &shared_dir);
//! let run_as = resolve_user(task.user.as_deref(), Some("nobody"), &denylist, mode)?;
//! ```

pub mod chroot;
pub mod user;
pub use chroot::{mount_all, plan_mounts, unmount_all, MountKind, MountSpec};
pub use user::{resolve_user, RunAs};
