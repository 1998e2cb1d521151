//! Driver-side connection to a task supervisor

use std::io::BufReader;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;

use super::protocol::{read_message, write_message, Envelope, LaunchSpec, Request, Response};
use crate::errors::{DriverError, Result};
use crate::monitoring::ResourceUsage;
use crate::structs::{Resources, WaitResult};

/// Client for one supervisor's control socket.
///
/// Every call opens its own connection, so a client can be shared freely
/// between threads.
#[derive(Debug, Clone)]
pub struct SupervisorClient {
    socket: PathBuf,
    token: String,
    timeout: Duration,
}

impl SupervisorClient {
    pub fn new(socket: impl AsRef<Path>, token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            socket: socket.as_ref().to_path_buf(),
            token: token.into(),
            timeout,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn ping(&self) -> Result<()> {
        match self.call(Request::Ping, Some(self.timeout))? {
            Response::Pong => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Start the user process; returns (supervisor pid, user pid)
    pub fn launch(&self, spec: LaunchSpec) -> Result<(i32, i32)> {
        match self.call(Request::Launch(spec), Some(self.timeout))? {
            Response::Launched {
                supervisor_pid,
                user_pid,
            } => Ok((supervisor_pid, user_pid)),
            other => Err(unexpected(&other)),
        }
    }

    /// Block until the task exited
    pub fn wait(&self) -> Result<WaitResult> {
        match self.call(Request::Wait, None)? {
            Response::Exited(result) => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    pub fn signal(&self, signal: i32) -> Result<()> {
        self.expect_ok(Request::Signal { signal })
    }

    pub fn kill(&self, grace: Duration) -> Result<()> {
        let grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self.expect_ok(Request::Kill { grace_ms })
    }

    /// Run a command in the sandbox; returns (combined output, exit code)
    pub fn exec(&self, path: &str, args: &[String], timeout: Option<Duration>) -> Result<(Vec<u8>, i32)> {
        let request = Request::Exec {
            path: path.to_string(),
            args: args.to_vec(),
            timeout_ms: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        };
        // Without a command timeout the read must not give up either
        let read_timeout = timeout.map(|t| t + self.timeout);
        match self.call(request, read_timeout)? {
            Response::ExecOutput { output, exit_code } => Ok((output, exit_code)),
            other => Err(unexpected(&other)),
        }
    }

    pub fn stats(&self) -> Result<ResourceUsage> {
        match self.call(Request::Stats, Some(self.timeout))? {
            Response::Stats(usage) => Ok(usage),
            other => Err(unexpected(&other)),
        }
    }

    pub fn update(&self, resources: Resources) -> Result<()> {
        self.expect_ok(Request::Update { resources })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.expect_ok(Request::Shutdown)
    }

    fn expect_ok(&self, request: Request) -> Result<()> {
        match self.call(request, Some(self.timeout))? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    fn call(&self, request: Request, read_timeout: Option<Duration>) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket).map_err(|e| {
            DriverError::Protocol(format!(
                "cannot reach supervisor at {}: {}",
                self.socket.display(),
                e
            ))
        })?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_read_timeout(read_timeout)?;

        let mut writer = stream.try_clone()?;
        write_message(
            &mut writer,
            &Envelope {
                token: self.token.clone(),
                request,
            },
        )?;

        let response: Response = read_message(&mut BufReader::new(stream))?;
        debug!("Supervisor {} answered {:?}", self.socket.display(), response);
        match response {
            Response::Error(err) => Err(err.into()),
            other => Ok(other),
        }
    }
}

fn unexpected(response: &Response) -> DriverError {
    DriverError::Protocol(format!("unexpected supervisor response: {:?}", response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::protocol::RemoteError;
    use std::os::unix::net::UnixListener;
    use std::thread;
    use tempfile::tempdir;

    /// Answer one connection with `response`, returning the envelope received
    fn serve_once(listener: UnixListener, response: Response) -> thread::JoinHandle<Envelope> {
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let envelope: Envelope = read_message(&mut reader).unwrap();
            let mut writer = stream;
            write_message(&mut writer, &response).unwrap();
            envelope
        })
    }

    #[test]
    fn test_ping_sends_token() {
        let tmp = tempdir().unwrap();
        let socket = tmp.path().join("s.sock");
        let server = serve_once(UnixListener::bind(&socket).unwrap(), Response::Pong);

        let client = SupervisorClient::new(&socket, "secret", Duration::from_secs(5));
        client.ping().unwrap();

        let envelope = server.join().unwrap();
        assert_eq!(envelope.token, "secret");
        assert!(matches!(envelope.request, Request::Ping));
    }

    #[test]
    fn test_remote_error_is_rebuilt() {
        let tmp = tempdir().unwrap();
        let socket = tmp.path().join("s.sock");
        let err = DriverError::permission("bob", "user is on the driver's denylist");
        let server = serve_once(
            UnixListener::bind(&socket).unwrap(),
            Response::Error(RemoteError::from(&err)),
        );

        let client = SupervisorClient::new(&socket, "t", Duration::from_secs(5));
        let result = client.signal(10);
        server.join().unwrap();
        assert!(matches!(result, Err(DriverError::Permission { .. })));
    }

    #[test]
    fn test_unexpected_response_is_protocol_error() {
        let tmp = tempdir().unwrap();
        let socket = tmp.path().join("s.sock");
        let server = serve_once(UnixListener::bind(&socket).unwrap(), Response::Pong);

        let client = SupervisorClient::new(&socket, "t", Duration::from_secs(5));
        assert!(matches!(client.shutdown(), Err(DriverError::Protocol(_))));
        server.join().unwrap();
    }

    #[test]
    fn test_missing_socket_is_protocol_error() {
        let client = SupervisorClient::new("/nonexistent/exec-driver.sock", "t", Duration::from_secs(1));
        assert!(matches!(client.ping(), Err(DriverError::Protocol(_))));
    }
}
