//! Privilege mode configuration for task isolation

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::capabilities::HostFacts;
use crate::errors::DriverError;

/// Determines which isolation primitives the driver applies to a task
///
/// Tasks of an unprivileged driver share the agent's uid and see the whole
/// host filesystem, so that mode is only ever chosen explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeMode {
    /// Only unprivileged mechanisms: setrlimit, no chroot, no user switching.
    Unprivileged,

    /// Chroot + cgroup v2 + user switching. Requires root.
    #[default]
    Privileged,

    /// Privileged when running as root on a cgroup v2 host, unprivileged otherwise.
    Auto,
}

impl PrivilegeMode {
    /// Resolve Auto mode to a concrete mode based on host facts
    pub fn resolve(&self, facts: &HostFacts) -> ResolvedMode {
        match self {
            PrivilegeMode::Privileged => ResolvedMode::Privileged,
            PrivilegeMode::Unprivileged => ResolvedMode::Unprivileged,
            PrivilegeMode::Auto => {
                if facts.has_root() && facts.cgroup_mountpoint.is_some() {
                    ResolvedMode::Privileged
                } else {
                    ResolvedMode::Unprivileged
                }
            }
        }
    }
}

impl FromStr for PrivilegeMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(PrivilegeMode::Auto),
            "privileged" => Ok(PrivilegeMode::Privileged),
            "unprivileged" => Ok(PrivilegeMode::Unprivileged),
            other => Err(DriverError::InvalidConfig(format!(
                "Unknown privilege mode: {}",
                other
            ))),
        }
    }
}

/// A resolved (non-Auto) privilege mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedMode {
    Unprivileged,
    Privileged,
}

impl ResolvedMode {
    pub fn is_privileged(&self) -> bool {
        matches!(self, ResolvedMode::Privileged)
    }

    pub fn is_unprivileged(&self) -> bool {
        matches!(self, ResolvedMode::Unprivileged)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedMode::Privileged => "privileged",
            ResolvedMode::Unprivileged => "unprivileged",
        }
    }
}

impl fmt::Display for ResolvedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
