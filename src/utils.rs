//! Utility functions for driver operations

use crate::errors::{DriverError, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::time::Duration;

/// Get current effective UID
pub fn get_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Parse memory size string (e.g., "100M", "1G")
pub fn parse_memory_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('G') {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024u64 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1u64)
    } else {
        (s.as_str(), 1u64)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| DriverError::InvalidConfig(format!("Invalid memory size: {}", s)))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| DriverError::InvalidConfig(format!("Memory size overflow: {}", s)))
}

/// Whether `pid` names a live (non-zombie) process.
///
/// A zombie still answers signal 0, but it will never run again, so it is
/// reported as gone.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

fn is_zombie(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => proc_stat_state(&stat) == Some('Z'),
        // Gone between the liveness check and the read
        Err(_) => true,
    }
}

/// Extract the state character from a `/proc/<pid>/stat` line.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so the state is located after the last `)`.
pub fn proc_stat_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.trim_start().chars().next()
}

/// Whether any argument of `pid`'s command line equals `needle`
pub fn cmdline_contains(pid: i32, needle: &str) -> bool {
    match fs::read(format!("/proc/{}/cmdline", pid)) {
        Ok(raw) => raw
            .split(|b| *b == 0)
            .any(|arg| arg == needle.as_bytes()),
        Err(_) => false,
    }
}

/// Exponential backoff for polling loops.
///
/// The delay doubles after each call, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    max_delay: Duration,
    current_delay: Duration,
    /// Number of delays handed out so far
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_delay,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// Returns the current delay and advances the state
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = (self.current_delay * 2).min(self.max_delay);
        delay
    }

    pub fn exceeded_max_attempts(&self, max: u32) -> bool {
        self.attempt >= max
    }
}
