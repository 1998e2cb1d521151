use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use console::style;
use log::info;
use nix::sys::signal::Signal;

use exec_driver::supervisor::{serve, ServerOptions, TOKEN_ENV};
use exec_driver::utils::parse_memory_size;
use exec_driver::{
    AllocDir, DriverConfig, DriverError, ExecContext, ExecDriver, Node, Resources, Result, Task,
    WaitResult,
};

pub struct RunConfig {
    pub alloc_dir: PathBuf,
    pub task: String,
    pub alloc_id: Option<String>,
    pub user: Option<String>,
    pub memory: Option<String>,
    pub cpu: Option<u64>,
    pub kill_timeout: Option<u64>,
    pub env: Vec<String>,
    pub wait: bool,
    pub program: String,
    pub args: Vec<String>,
}

fn driver() -> Result<ExecDriver> {
    ExecDriver::new(DriverConfig::from_env()?)
}

pub fn fingerprint() -> Result<i32> {
    let driver = driver()?;
    let mut node = Node::default();
    let healthy = driver.fingerprint(&mut node)?;

    if healthy {
        println!("{} exec driver available\n", style("[ok]").green());
    } else {
        println!("{} exec driver unavailable\n", style("[--]").red());
    }
    for (key, value) in &node.attributes {
        println!("  {} = {}", key, value);
    }
    Ok(if healthy { 0 } else { 1 })
}

pub fn run(config: RunConfig) -> Result<i32> {
    let driver = driver()?;
    let task = build_task(&config)?;

    let alloc = AllocDir::new(&config.alloc_dir);
    alloc.build()?;
    alloc.task_dir(&task.name).build()?;
    let ctx = ExecContext::new(alloc);

    let sandbox = driver.prestart(&ctx, &task)?;
    info!(
        "Prepared {} sandbox at {}",
        sandbox.sandbox.mode,
        sandbox.sandbox.root.display()
    );

    let handle = driver.start(&ctx, &task)?;
    println!("{}", handle.id()?);

    if !config.wait {
        return Ok(0);
    }
    let result = handle.wait_ch().recv();
    Ok(report(&result))
}

pub fn wait(id: &str) -> Result<i32> {
    let handle = driver()?.open(id)?;
    let result = handle.wait_ch().recv();
    Ok(report(&result))
}

pub fn kill(id: &str) -> Result<i32> {
    let handle = driver()?.open(id)?;
    handle.kill()?;
    Ok(0)
}

pub fn signal(id: &str, signal: &str) -> Result<i32> {
    let signal = parse_signal(signal)?;
    let handle = driver()?.open(id)?;
    handle.signal(signal)?;
    Ok(0)
}

pub fn exec(id: &str, timeout: Option<u64>, command: &str, args: &[String]) -> Result<i32> {
    let handle = driver()?.open(id)?;
    let (output, exit_code) = handle.exec(timeout.map(Duration::from_secs), command, args)?;
    print!("{}", String::from_utf8_lossy(&output));
    Ok(exit_code)
}

pub fn stats(id: &str) -> Result<i32> {
    let handle = driver()?.open(id)?;
    let usage = handle.stats()?;
    println!("{}", serde_json::to_string_pretty(&usage)?);
    Ok(0)
}

pub fn supervisor(socket: &Path, linger_secs: u64) -> Result<i32> {
    let token = std::env::var(TOKEN_ENV)
        .map_err(|_| DriverError::InvalidConfig(format!("{} is not set", TOKEN_ENV)))?;
    // Children must not see the token
    std::env::remove_var(TOKEN_ENV);

    serve(ServerOptions {
        socket: socket.to_path_buf(),
        token,
        linger: Duration::from_secs(linger_secs),
    })?;
    Ok(0)
}

fn build_task(config: &RunConfig) -> Result<Task> {
    let alloc_id = match &config.alloc_id {
        Some(id) => id.clone(),
        None => config
            .alloc_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local".to_string()),
    };

    let memory_mb = config
        .memory
        .as_deref()
        .map(parse_memory_size)
        .transpose()?
        .map(|bytes| bytes.div_ceil(1024 * 1024));

    let mut task = Task::new(alloc_id, &config.task, &config.program)
        .args(&config.args)
        .resources(Resources {
            cpu: config.cpu,
            memory_mb,
            max_pids: None,
        });
    if let Some(user) = &config.user {
        task = task.user(user);
    }
    if let Some(secs) = config.kill_timeout {
        task = task.kill_timeout(Duration::from_secs(secs));
    }
    for pair in &config.env {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            DriverError::InvalidConfig(format!("expected KEY=VALUE, got {:?}", pair))
        })?;
        task = task.env(key, value);
    }
    Ok(task)
}

/// Accepts `TERM`, `SIGTERM`, `15`, and real-time forms like `RTMIN+1`.
fn parse_signal(raw: &str) -> Result<i32> {
    let invalid = || DriverError::InvalidConfig(format!("unknown signal {:?}", raw));
    let valid = |number: i32| (1..=libc::SIGRTMAX()).contains(&number).then_some(number);

    if let Ok(number) = raw.trim().parse::<i32>() {
        return valid(number).ok_or_else(invalid);
    }
    let name = raw.trim().to_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);

    let realtime = if let Some(offset) = name.strip_prefix("RTMIN") {
        Some((libc::SIGRTMIN(), offset, 1))
    } else {
        name.strip_prefix("RTMAX").map(|offset| (libc::SIGRTMAX(), offset, -1))
    };
    if let Some((base, offset, direction)) = realtime {
        let offset = match offset {
            "" => 0,
            _ => offset
                .strip_prefix(if direction > 0 { '+' } else { '-' })
                .and_then(|n| n.parse::<i32>().ok())
                .ok_or_else(invalid)?,
        };
        return valid(base + direction * offset)
            .filter(|n| (libc::SIGRTMIN()..=libc::SIGRTMAX()).contains(n))
            .ok_or_else(invalid);
    }

    Signal::from_str(&format!("SIG{}", name))
        .map(|sig| sig as i32)
        .map_err(|_| invalid())
}

fn report(result: &WaitResult) -> i32 {
    if result.successful() {
        eprintln!("{} {}", style("task:").green().bold(), result);
    } else {
        eprintln!("{} {}", style("task:").yellow().bold(), result);
    }
    if result.exit_code >= 0 {
        result.exit_code
    } else {
        1
    }
}
