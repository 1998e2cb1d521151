//! Run-as user resolution and privilege drop

use std::ffi::CString;

use log::debug;
use nix::unistd::{getgrouplist, setgid, setgroups, setuid, Gid, Uid, User};
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::privilege::ResolvedMode;

/// Identity a task process switches to before exec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAs {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl RunAs {
    /// Drop to this identity.
    ///
    /// Runs between fork and exec, so it must not allocate; `groups` is
    /// converted by the caller beforehand.
    pub fn apply(&self, groups: &[Gid]) -> std::io::Result<()> {
        setgroups(groups)?;
        setgid(Gid::from_raw(self.gid))?;
        setuid(Uid::from_raw(self.uid))?;
        Ok(())
    }

    pub fn gids(&self) -> Vec<Gid> {
        self.groups.iter().copied().map(Gid::from_raw).collect()
    }
}

/// Resolve the requested run-as user.
///
/// `None` means the task keeps the supervisor's identity, which only
/// happens in unprivileged mode. A privileged task without a user runs as
/// `fallback`, and is refused when there is none. Every rejection is a
/// [`DriverError::Permission`] naming the user.
pub fn resolve_user(
    requested: Option<&str>,
    fallback: Option<&str>,
    denylist: &[String],
    mode: ResolvedMode,
) -> Result<Option<RunAs>> {
    let requested = requested.map(str::trim).filter(|name| !name.is_empty());
    let name = match (requested, fallback.map(str::trim)) {
        (Some(name), _) => name,
        (None, _) if mode.is_unprivileged() => return Ok(None),
        (None, Some(name)) if !name.is_empty() => {
            debug!("Task names no user, running as {}", name);
            name
        }
        (None, _) => {
            let current = User::from_uid(Uid::effective())
                .ok()
                .flatten()
                .map(|u| u.name)
                .unwrap_or_else(|| Uid::effective().to_string());
            return Err(DriverError::permission(
                current,
                "privileged tasks must not inherit the supervisor's identity",
            ));
        }
    };

    if denylist.iter().any(|denied| denied == name) {
        return Err(DriverError::permission(name, "user is on the driver's denylist"));
    }

    let user = User::from_name(name)
        .map_err(|e| DriverError::permission(name, format!("lookup failed: {}", e)))?
        .ok_or_else(|| DriverError::permission(name, "no such user on this host"))?;

    let current = Uid::effective();
    if mode.is_unprivileged() {
        if user.uid != current {
            return Err(DriverError::permission(
                name,
                "switching users requires privileged mode",
            ));
        }
        return Ok(None);
    }

    let c_name = CString::new(name)
        .map_err(|_| DriverError::permission(name, "user name contains a NUL byte"))?;
    let groups = getgrouplist(&c_name, user.gid)
        .map_err(|e| DriverError::permission(name, format!("group lookup failed: {}", e)))?;

    debug!("Resolved run-as user {} to uid {} gid {}", name, user.uid, user.gid);
    Ok(Some(RunAs {
        name: name.to_string(),
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
        groups: groups.iter().map(|g| g.as_raw()).collect(),
    }))
}
