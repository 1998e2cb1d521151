use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "exec-driver")]
#[command(version, about = "Run tasks under detached, reattachable supervisors", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Inspect what this node supports
    exec-driver fingerprint

    # Start a task and keep its handle id
    ID=$(exec-driver run --alloc-dir /var/lib/allocs/a1 --task web -- /bin/sleep 600)

    # Operate on it later, from another process
    exec-driver stats \"$ID\"
    exec-driver exec \"$ID\" -- /bin/ls /alloc
    exec-driver kill \"$ID\"

    # Without root, opt in to rlimit-only isolation
    EXEC_DRIVER_MODE=unprivileged exec-driver fingerprint
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Report host capabilities as node attributes
    Fingerprint,

    /// Prepare a sandbox and start a task, printing its handle id
    Run {
        /// Allocation directory (created if missing)
        #[arg(short, long, value_name = "PATH")]
        alloc_dir: PathBuf,

        /// Task name
        #[arg(short, long, value_name = "NAME")]
        task: String,

        /// Allocation id exported to the task (defaults to the directory name)
        #[arg(long, value_name = "ID")]
        alloc_id: Option<String>,

        /// User to run the task as
        #[arg(short, long, value_name = "USER")]
        user: Option<String>,

        /// Memory limit (100M, 1G, 2G)
        #[arg(short, long, value_name = "SIZE")]
        memory: Option<String>,

        /// CPU shares
        #[arg(short, long, value_name = "SHARES")]
        cpu: Option<u64>,

        /// Grace period between the interrupt and the kill, in seconds
        #[arg(short, long, value_name = "SECONDS")]
        kill_timeout: Option<u64>,

        /// Environment variables for the task (KEY=VALUE)
        #[arg(short, long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Block until the task exits and report its result
        #[arg(short, long)]
        wait: bool,

        /// Program to run
        program: String,

        /// Program arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Block until the task exits
    Wait {
        /// Handle id printed by `run`
        id: String,
    },

    /// Interrupt the task, killing it after its grace period
    Kill { id: String },

    /// Forward a signal to the task
    Signal {
        id: String,

        /// Signal name or number (TERM, SIGUSR1, 9)
        signal: String,
    },

    /// Run a command inside the task's sandbox
    Exec {
        id: String,

        /// Give up after this many seconds
        #[arg(short, long, value_name = "SECONDS")]
        timeout: Option<u64>,

        /// Command to run
        command: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print the task's resource usage
    Stats { id: String },

    /// Run as a task supervisor (started by the driver)
    #[command(hide = true)]
    Supervisor {
        #[arg(long, value_name = "PATH")]
        socket: PathBuf,

        #[arg(long, value_name = "SECONDS", default_value_t = 300)]
        linger_secs: u64,
    },
}
