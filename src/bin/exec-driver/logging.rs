use console::style;
use env_logger::{Builder, Env};
use log::Level;
use std::io::Write;

/// Initialize the logger; `RUST_LOG` wins over the verbose flag.
pub fn init_logger(verbose: bool) {
    let env = Env::default().filter_or("RUST_LOG", if verbose { "debug" } else { "warn" });

    Builder::from_env(env)
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => format!("{}", style("ERROR").red().bold()),
                Level::Warn => format!("{}", style("WARN ").yellow().bold()),
                Level::Info => format!("{}", style("INFO ").green()),
                Level::Debug => format!("{}", style("DEBUG").cyan()),
                Level::Trace => format!("{}", style("TRACE").dim()),
            };
            writeln!(buf, "{} [{}] {}", level, std::process::id(), record.args())
        })
        .init();
}

/// Supervisor output goes to its log file, so colors are plain and every
/// line carries a timestamp.
pub fn init_supervisor_logger() {
    let env = Env::default().filter_or("RUST_LOG", "info");

    Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:5} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                record.level(),
                std::process::id(),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .init();
}
