//! Error types for driver operations

use std::io;
use thiserror::Error;

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors that can occur while probing, preparing, launching or controlling a task
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Capability detection failed: {0}")]
    Capability(String),

    #[error("Sandbox setup failed: {0}")]
    SandboxSetup(String),

    #[error("run-as user {user} rejected: {reason}")]
    Permission { user: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Launch failed: {0}")]
    Launch(String),

    #[error("Reattach failed: {0}")]
    Reattach(String),

    #[error("Supervisor protocol error: {0}")]
    Protocol(String),

    #[error("Exec failed: {0}")]
    Exec(String),

    #[error("Timeout exceeded")]
    Timeout,
}

impl DriverError {
    pub fn permission(user: impl Into<String>, reason: impl Into<String>) -> Self {
        DriverError::Permission {
            user: user.into(),
            reason: reason.into(),
        }
    }
}
