//! Task root filesystem built from bind mounts

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::capabilities;
use crate::errors::{DriverError, Result};

/// In-sandbox location of the allocation's shared directory
pub const SHARED_MOUNT: &str = "/alloc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Recursive bind, remounted read-only
    ReadOnlyBind,
    /// Plain read-write bind
    Bind,
    /// Recursive read-write bind (device nodes)
    RecursiveBind,
    /// Fresh procfs instance
    Proc,
}

/// One mount to perform inside a task root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: PathBuf,
    pub kind: MountKind,
}

/// Map an absolute in-sandbox path to its host location under `root`
pub fn host_path(root: &Path, sandbox_path: &Path) -> PathBuf {
    match sandbox_path.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(_) => root.join(sandbox_path),
    }
}

/// Mounts that turn `root` into a usable task root
pub fn plan_mounts(
    root: &Path,
    chroot_env: &BTreeMap<PathBuf, PathBuf>,
    shared_dir: &Path,
) -> Vec<MountSpec> {
    let mut plan: Vec<MountSpec> = chroot_env
        .iter()
        .map(|(source, dest)| MountSpec {
            source: source.clone(),
            target: host_path(root, dest),
            kind: MountKind::ReadOnlyBind,
        })
        .collect();

    plan.push(MountSpec {
        source: shared_dir.to_path_buf(),
        target: host_path(root, Path::new(SHARED_MOUNT)),
        kind: MountKind::Bind,
    });
    plan.push(MountSpec {
        source: PathBuf::from("/dev"),
        target: root.join("dev"),
        kind: MountKind::RecursiveBind,
    });
    plan.push(MountSpec {
        source: PathBuf::from("proc"),
        target: root.join("proc"),
        kind: MountKind::Proc,
    });
    plan
}

/// Perform `plan`, skipping targets that are already mounted.
///
/// Returns every target that is mounted afterwards, in mount order, so a
/// repeated call reports the same set.
pub fn mount_all(root: &Path, plan: &[MountSpec]) -> Result<Vec<PathBuf>> {
    let tmp = root.join("tmp");
    fs::create_dir_all(&tmp)?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o1777))?;

    let mut mounted = Vec::with_capacity(plan.len());
    for spec in plan {
        if spec.kind != MountKind::Proc && !spec.source.exists() {
            debug!("Skipping {}: not present on host", spec.source.display());
            continue;
        }

        prepare_target(spec)?;

        if capabilities::is_mountpoint(&spec.target)? {
            debug!("{} already mounted", spec.target.display());
        } else {
            mount_one(spec)?;
        }
        mounted.push(spec.target.clone());
    }
    Ok(mounted)
}

/// Lazily unmount `mounts` in reverse order
pub fn unmount_all(mounts: &[PathBuf]) -> Result<()> {
    let mut failures = Vec::new();
    for target in mounts.iter().rev() {
        match umount2(target, MntFlags::MNT_DETACH) {
            Ok(()) | Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {}
            Err(e) => {
                warn!("Failed to unmount {}: {}", target.display(), e);
                failures.push(format!("{}: {}", target.display(), e));
            }
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(DriverError::SandboxSetup(format!(
            "Failed to unmount {}",
            failures.join(", ")
        )))
    }
}

fn prepare_target(spec: &MountSpec) -> Result<()> {
    if spec.target.exists() {
        return Ok(());
    }
    if spec.kind != MountKind::Proc && spec.source.is_file() {
        if let Some(parent) = spec.target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::File::create(&spec.target)?;
    } else {
        fs::create_dir_all(&spec.target)?;
    }
    Ok(())
}

fn mount_one(spec: &MountSpec) -> Result<()> {
    let none: Option<&str> = None;
    let result = match spec.kind {
        MountKind::ReadOnlyBind => mount(
            Some(&spec.source),
            &spec.target,
            none,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            none,
        )
        .and_then(|_| {
            mount(
                none,
                &spec.target,
                none,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                none,
            )
        }),
        MountKind::Bind => mount(Some(&spec.source), &spec.target, none, MsFlags::MS_BIND, none),
        MountKind::RecursiveBind => mount(
            Some(&spec.source),
            &spec.target,
            none,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            none,
        ),
        MountKind::Proc => mount(
            Some("proc"),
            &spec.target,
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            none,
        ),
    };

    result.map_err(|e| {
        DriverError::SandboxSetup(format!(
            "mount {} -> {} failed: {}",
            spec.source.display(),
            spec.target.display(),
            e
        ))
    })?;
    debug!("Mounted {} at {}", spec.source.display(), spec.target.display());
    Ok(())
}
