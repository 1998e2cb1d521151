//! Narrow exec-in-sandbox capability for health checks

use std::time::Duration;

use crate::errors::Result;

use super::handle::ExecHandle;

/// Something that can run a short command inside a task's isolation boundary.
///
/// Health-check runners depend on this rather than on the full handle.
pub trait ScriptExecutor: Send + Sync {
    /// Run `cmd args..`, returning combined output and the exit code.
    ///
    /// A nonzero exit code is a normal result; errors mean the command could
    /// not be run at all or exceeded `timeout`.
    fn exec(&self, timeout: Duration, cmd: &str, args: &[String]) -> Result<(Vec<u8>, i32)>;
}

impl ScriptExecutor for ExecHandle {
    fn exec(&self, timeout: Duration, cmd: &str, args: &[String]) -> Result<(Vec<u8>, i32)> {
        ExecHandle::exec(self, Some(timeout), cmd, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Canned(i32);

    impl ScriptExecutor for Canned {
        fn exec(&self, _timeout: Duration, cmd: &str, args: &[String]) -> Result<(Vec<u8>, i32)> {
            Ok((format!("{} {}", cmd, args.join(" ")).into_bytes(), self.0))
        }
    }

    fn check(executor: &dyn ScriptExecutor) -> bool {
        matches!(executor.exec(Duration::from_secs(1), "stat", &["/alloc".to_string()]), Ok((_, 0)))
    }

    #[test]
    fn test_callers_depend_on_the_trait_object() {
        let healthy: Arc<dyn ScriptExecutor> = Arc::new(Canned(0));
        let failing: Arc<dyn ScriptExecutor> = Arc::new(Canned(1));
        assert!(check(healthy.as_ref()));
        assert!(!check(failing.as_ref()));
    }
}
