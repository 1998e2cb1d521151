//! Resource limits: cgroup v2 (privileged) with setrlimit fallback

pub mod cgroup;
pub mod rlimit;

pub use cgroup::{cpu_shares_to_weight, Cgroup, CgroupConfig};
pub use rlimit::RlimitConfig;
