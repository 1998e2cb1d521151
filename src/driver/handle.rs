//! Caller-facing task handle and its serializable identity

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::monitoring::ResourceUsage;
use crate::structs::{Task, WaitResult};
use crate::supervisor::{SupervisorClient, PROTOCOL_VERSION};
use crate::utils::{self, Backoff};

const WAIT_RETRIES: u32 = 5;

fn protocol_version() -> u32 {
    PROTOCOL_VERSION
}

/// Everything needed to reach a running task again.
///
/// Serialized as JSON. Unknown fields are ignored and optional fields
/// default, so identities written by a newer minor release still open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleId {
    #[serde(default = "protocol_version")]
    pub version: u32,
    pub task_name: String,
    pub supervisor_pid: i32,
    pub user_pid: i32,
    pub socket: PathBuf,
    pub token: String,
    #[serde(default)]
    pub kill_timeout_ms: u64,
}

impl HandleId {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let id: HandleId = serde_json::from_str(raw)
            .map_err(|e| DriverError::Reattach(format!("malformed handle id: {}", e)))?;
        if id.version != PROTOCOL_VERSION {
            return Err(DriverError::Reattach(format!(
                "handle id version {} is not supported (expected {})",
                id.version, PROTOCOL_VERSION
            )));
        }
        Ok(id)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

/// Single-fire wait notification.
///
/// Clones share the same cell; the first published result is the only one
/// any receiver ever sees.
#[derive(Debug, Clone, Default)]
pub struct WaitCh {
    inner: Arc<(Mutex<Option<WaitResult>>, Condvar)>,
}

impl WaitCh {
    fn lock(&self) -> MutexGuard<'_, Option<WaitResult>> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `result` unless a result was already published
    fn publish(&self, result: WaitResult) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        self.inner.1.notify_all();
        true
    }

    /// Block until the task exited
    pub fn recv(&self) -> WaitResult {
        let mut slot = self.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self.inner.1.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WaitResult> {
        let slot = self.lock();
        let (slot, _) = self
            .inner
            .1
            .wait_timeout_while(slot, timeout, |s| s.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.clone()
    }

    pub fn try_recv(&self) -> Option<WaitResult> {
        self.lock().clone()
    }
}

/// Handle to one running (or finished) task
#[derive(Debug)]
pub struct ExecHandle {
    id: Mutex<HandleId>,
    client: SupervisorClient,
    wait_ch: WaitCh,
}

impl ExecHandle {
    /// Bind to a supervisor and start listening for the task's exit
    pub(crate) fn new(id: HandleId, client: SupervisorClient) -> Result<Self> {
        let wait_ch = WaitCh::default();
        spawn_exit_listener(id.clone(), client.clone(), wait_ch.clone())?;
        Ok(Self {
            id: Mutex::new(id),
            client,
            wait_ch,
        })
    }

    fn identity(&self) -> HandleId {
        self.id.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Serialized identity, accepted by `ExecDriver::open`
    pub fn id(&self) -> Result<String> {
        self.identity().encode()
    }

    pub fn supervisor_pid(&self) -> i32 {
        self.identity().supervisor_pid
    }

    pub fn user_pid(&self) -> i32 {
        self.identity().user_pid
    }

    /// Receiver that yields the task's single Wait Result
    pub fn wait_ch(&self) -> WaitCh {
        self.wait_ch.clone()
    }

    /// Apply the adjustable parts of a revised descriptor.
    ///
    /// The kill timeout and resource limits change in place; everything else
    /// is fixed at launch and silently kept.
    pub fn update(&self, task: &Task) -> Result<()> {
        {
            let mut id = self.id.lock().unwrap_or_else(PoisonError::into_inner);
            id.kill_timeout_ms = u64::try_from(task.kill_timeout.as_millis()).unwrap_or(u64::MAX);
        }
        if self.wait_ch.try_recv().is_some() {
            return Ok(());
        }
        self.client.update(task.resources.clone())
    }

    /// Interrupt the task, escalating to SIGKILL after the kill timeout.
    ///
    /// Returns once termination was requested; use [`ExecHandle::wait_ch`]
    /// to observe the exit.
    pub fn kill(&self) -> Result<()> {
        if self.wait_ch.try_recv().is_some() {
            debug!("Kill on exited task is a no-op");
            return Ok(());
        }
        let id = self.identity();
        self.tolerate_gone(self.client.kill(id.kill_timeout()))
    }

    /// Forward `signal` to the user process unchanged
    pub fn signal(&self, signal: i32) -> Result<()> {
        if self.wait_ch.try_recv().is_some() {
            debug!("Signal {} to exited task is a no-op", signal);
            return Ok(());
        }
        self.tolerate_gone(self.client.signal(signal))
    }

    /// Run `path args..` inside the task's sandbox.
    ///
    /// Returns combined output and exit code; a nonzero exit code is not an error.
    pub fn exec(&self, timeout: Option<Duration>, path: &str, args: &[String]) -> Result<(Vec<u8>, i32)> {
        self.client.exec(path, args, timeout)
    }

    pub fn stats(&self) -> Result<ResourceUsage> {
        self.client.stats()
    }

    // A supervisor that is already gone took its task with it
    fn tolerate_gone(&self, result: Result<()>) -> Result<()> {
        match result {
            Err(e @ (DriverError::Protocol(_) | DriverError::Io(_)))
                if !utils::process_alive(self.supervisor_pid()) =>
            {
                debug!("Supervisor already gone: {}", e);
                Ok(())
            }
            other => other,
        }
    }
}

fn spawn_exit_listener(id: HandleId, client: SupervisorClient, wait_ch: WaitCh) -> Result<()> {
    thread::Builder::new()
        .name(format!("wait-{}", id.task_name))
        .spawn(move || {
            let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
            loop {
                match client.wait() {
                    Ok(result) => {
                        info!("Task {} exited: {}", id.task_name, result);
                        wait_ch.publish(result);
                        if let Err(e) = client.shutdown() {
                            debug!("Supervisor shutdown request failed: {}", e);
                        }
                        return;
                    }
                    Err(e) => {
                        if !utils::process_alive(id.supervisor_pid)
                            || backoff.exceeded_max_attempts(WAIT_RETRIES)
                        {
                            warn!("Lost supervisor of task {}: {}", id.task_name, e);
                            wait_ch.publish(WaitResult::failed(format!("supervisor lost: {}", e)));
                            return;
                        }
                        thread::sleep(backoff.next_delay());
                    }
                }
            }
        })?;
    Ok(())
}
