//! Runtime detection of the host facts the driver depends on
//!
//! Inspects the running kernel and mount table to decide whether tasks can be
//! isolated on this node. Detection has no side effects.

use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::utsname::uname;

use crate::errors::{DriverError, Result};
use crate::utils;

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Detected host facts relevant to task isolation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    /// Operating system name (`std::env::consts::OS`)
    pub os: String,
    /// Effective UID of the driver process
    pub euid: u32,
    /// Where the cgroup v2 unified hierarchy is mounted, if anywhere
    pub cgroup_mountpoint: Option<PathBuf>,
    /// Kernel release string
    pub kernel_release: Option<String>,
}

impl HostFacts {
    /// Detect facts for the current host.
    ///
    /// Fails only when the mount table cannot be read; a missing cgroup
    /// hierarchy is a normal negative result.
    pub fn detect() -> Result<Self> {
        let mountinfo = fs::read_to_string(MOUNTINFO)
            .map_err(|e| DriverError::Capability(format!("Failed to read {}: {}", MOUNTINFO, e)))?;

        let kernel_release = uname()
            .ok()
            .map(|uts| uts.release().to_string_lossy().into_owned());

        Ok(Self {
            os: std::env::consts::OS.to_string(),
            euid: utils::get_uid(),
            cgroup_mountpoint: find_cgroup2_mount(&mountinfo),
            kernel_release,
        })
    }

    pub fn has_root(&self) -> bool {
        self.euid == 0
    }

    pub fn is_linux(&self) -> bool {
        self.os == "linux"
    }

    /// Get a human-readable summary of the facts
    pub fn summary(&self) -> String {
        let check = |available: bool| if available { "[ok]" } else { "[--]" };
        let mut lines = vec![
            format!("{} Linux host ({})", check(self.is_linux()), self.os),
            format!("{} Root privileges (euid {})", check(self.has_root()), self.euid),
        ];
        match &self.cgroup_mountpoint {
            Some(path) => lines.push(format!("[ok] Cgroup v2 at {}", path.display())),
            None => lines.push("[--] Cgroup v2".to_string()),
        }
        if let Some(release) = &self.kernel_release {
            lines.push(format!("     Kernel {}", release));
        }
        lines.join("\n")
    }
}

/// One line of `/proc/self/mountinfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
}

/// Parse the mount table format of `/proc/<pid>/mountinfo`
pub fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let (pre, post) = line.split_once(" - ")?;
            let mount_point = pre.split_whitespace().nth(4)?;
            let fs_type = post.split_whitespace().next()?;
            Some(MountEntry {
                mount_point: PathBuf::from(unescape_mount_path(mount_point)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

/// Whether `path` is currently a mount point of this process's namespace
pub fn is_mountpoint(path: &Path) -> Result<bool> {
    let content = fs::read_to_string(MOUNTINFO)?;
    Ok(parse_mountinfo(&content)
        .iter()
        .any(|entry| entry.mount_point == path))
}

fn find_cgroup2_mount(mountinfo: &str) -> Option<PathBuf> {
    parse_mountinfo(mountinfo)
        .into_iter()
        .find(|entry| entry.fs_type == "cgroup2")
        .map(|entry| entry.mount_point)
}

// The kernel escapes space, tab, newline and backslash as three-digit octal.
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 0:21 / /sys rw,nosuid shared:7 - sysfs sysfs rw
26 22 0:23 / /sys/fs/cgroup rw,nosuid,nodev shared:9 - cgroup2 cgroup2 rw,nsdelegate
61 1 8:1 /data /mnt/with\\040space rw,relatime - ext4 /dev/sda1 rw
";

    #[test]
    fn detect_returns_facts() {
        let facts = HostFacts::detect().unwrap();
        assert_eq!(facts.os, std::env::consts::OS);
        assert_eq!(facts.euid, utils::get_uid());
    }

    #[test]
    fn parse_mountinfo_extracts_points_and_types() {
        let entries = parse_mountinfo(SAMPLE);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].mount_point, PathBuf::from("/sys"));
        assert_eq!(entries[1].fs_type, "cgroup2");
    }

    #[test]
    fn parse_mountinfo_unescapes_spaces() {
        let entries = parse_mountinfo(SAMPLE);
        assert_eq!(entries[2].mount_point, PathBuf::from("/mnt/with space"));
    }

    #[test]
    fn cgroup2_mount_is_found() {
        assert_eq!(
            find_cgroup2_mount(SAMPLE),
            Some(PathBuf::from("/sys/fs/cgroup"))
        );
        assert_eq!(find_cgroup2_mount("1 0 0:1 / / rw - ext4 x rw\n"), None);
    }

    #[test]
    fn root_is_a_mountpoint() {
        assert!(is_mountpoint(Path::new("/")).unwrap());
    }

    #[test]
    fn summary_produces_output() {
        let facts = HostFacts {
            os: "linux".to_string(),
            euid: 0,
            cgroup_mountpoint: None,
            kernel_release: Some("6.1.0".to_string()),
        };
        let summary = facts.summary();
        assert!(summary.contains("Root privileges"));
        assert!(summary.contains("[--] Cgroup v2"));
        assert!(summary.contains("6.1.0"));
    }
}
