//! Allocation directory layout
//!
//! An allocation directory holds one shared directory visible to every task
//! of the allocation plus one private directory per task:
//!
//! ```text
//! <alloc_dir>/
//!   alloc/            shared between tasks
//!   <task>/           task root (chroot target in privileged mode)
//!     local/          task-local scratch storage
//!     logs/           rotated stdout/stderr files
//! ```

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::debug;

use crate::errors::{DriverError, Result};

pub const SHARED_DIR_NAME: &str = "alloc";
pub const LOCAL_DIR_NAME: &str = "local";
pub const LOG_DIR_NAME: &str = "logs";

/// Paths of one allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocDir {
    pub alloc_dir: PathBuf,
    pub shared_dir: PathBuf,
}

impl AllocDir {
    pub fn new(alloc_dir: impl AsRef<Path>) -> Self {
        let alloc_dir = alloc_dir.as_ref().to_path_buf();
        Self {
            shared_dir: alloc_dir.join(SHARED_DIR_NAME),
            alloc_dir,
        }
    }

    /// Create the allocation and shared directories
    pub fn build(&self) -> Result<()> {
        fs::create_dir_all(&self.shared_dir).map_err(|e| {
            DriverError::SandboxSetup(format!(
                "Failed to create shared dir {}: {}",
                self.shared_dir.display(),
                e
            ))
        })?;
        // Tasks may run as different users and still exchange files here
        fs::set_permissions(&self.shared_dir, fs::Permissions::from_mode(0o1777))?;
        debug!("Built allocation dir {}", self.alloc_dir.display());
        Ok(())
    }

    pub fn task_dir(&self, task_name: &str) -> TaskDir {
        TaskDir::new(self.alloc_dir.join(task_name))
    }

    /// Whether the layout for `task_name` exists on disk
    pub fn verify(&self, task_name: &str) -> Result<TaskDir> {
        let task_dir = self.task_dir(task_name);
        for path in [&self.shared_dir, &task_dir.dir, &task_dir.log_dir] {
            if !path.is_dir() {
                return Err(DriverError::SandboxSetup(format!(
                    "Allocation directory is missing {}",
                    path.display()
                )));
            }
        }
        Ok(task_dir)
    }

    /// Remove the whole allocation directory
    pub fn destroy(&self) -> Result<()> {
        if self.alloc_dir.exists() {
            fs::remove_dir_all(&self.alloc_dir)?;
        }
        Ok(())
    }
}

/// Paths private to one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDir {
    pub dir: PathBuf,
    pub local_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl TaskDir {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            local_dir: dir.join(LOCAL_DIR_NAME),
            log_dir: dir.join(LOG_DIR_NAME),
            dir,
        }
    }

    pub fn build(&self) -> Result<()> {
        for path in [&self.dir, &self.local_dir, &self.log_dir] {
            fs::create_dir_all(path).map_err(|e| {
                DriverError::SandboxSetup(format!(
                    "Failed to create task dir {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }
        fs::set_permissions(&self.local_dir, fs::Permissions::from_mode(0o777))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout_paths() {
        let alloc = AllocDir::new("/var/alloc/a1");
        let task = alloc.task_dir("web");
        assert_eq!(alloc.shared_dir, PathBuf::from("/var/alloc/a1/alloc"));
        assert_eq!(task.local_dir, PathBuf::from("/var/alloc/a1/web/local"));
        assert_eq!(task.log_dir, PathBuf::from("/var/alloc/a1/web/logs"));
    }

    #[test]
    fn test_build_and_verify() {
        let tmp = tempdir().unwrap();
        let alloc = AllocDir::new(tmp.path().join("a1"));
        assert!(alloc.verify("web").is_err());

        alloc.build().unwrap();
        alloc.task_dir("web").build().unwrap();

        let task = alloc.verify("web").unwrap();
        assert!(task.local_dir.is_dir());
        let mode = fs::metadata(&alloc.shared_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o1777);
    }

    #[test]
    fn test_destroy() {
        let tmp = tempdir().unwrap();
        let alloc = AllocDir::new(tmp.path().join("a1"));
        alloc.build().unwrap();
        alloc.destroy().unwrap();
        assert!(!alloc.alloc_dir.exists());
        alloc.destroy().unwrap();
    }
}
