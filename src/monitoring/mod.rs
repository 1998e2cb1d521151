//! Monitoring layer: task resource usage
//!
//! Usage comes from the task's cgroup when it has one, and from /proc for
//! the task's process group otherwise.

pub mod monitor;

pub use monitor::{ProcessMonitor, ProcessStats, ResourceUsage};
