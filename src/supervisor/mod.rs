//! Per-task supervisor process and its control protocol
//!
//! The driver re-executes its own binary as `exec-driver supervisor`, once per
//! task. The supervisor owns the user process, outlives the driver and is
//! reached over a Unix socket with newline-delimited JSON messages.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::SupervisorClient;
pub use protocol::{Envelope, LaunchSpec, RemoteError, Request, Response, PROTOCOL_VERSION, TOKEN_ENV};
pub use server::{serve, ServerOptions};
