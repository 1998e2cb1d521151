//! setrlimit-based resource limits (no privileges needed)
//!
//! Used in unprivileged mode, where the task cannot be placed in its own cgroup.

use nix::sys::resource::{setrlimit, Resource};

use crate::structs::Resources;

/// Resource limits via setrlimit (unprivileged fallback)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RlimitConfig {
    /// Maximum address space size in bytes (RLIMIT_AS)
    pub max_memory: Option<u64>,
}

impl RlimitConfig {
    pub fn from_resources(resources: &Resources) -> Self {
        Self {
            max_memory: resources.memory_bytes(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.max_memory.is_none()
    }

    /// Apply the limits to the calling process.
    ///
    /// Runs between fork and exec, so it must not allocate.
    pub fn apply(&self) -> std::io::Result<()> {
        if let Some(mem) = self.max_memory {
            setrlimit(Resource::RLIMIT_AS, mem, mem)?;
        }
        Ok(())
    }
}
