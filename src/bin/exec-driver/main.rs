//! exec-driver CLI - start, inspect and control supervised tasks

mod cli;
mod commands;
mod logging;

use clap::Parser;
use cli::{Cli, Commands};
use commands::RunConfig;
use console::style;

fn main() {
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Supervisor { .. }) {
        logging::init_supervisor_logger();
    } else {
        logging::init_logger(cli.verbose);
    }

    let result = match cli.command {
        Commands::Fingerprint => commands::fingerprint(),
        Commands::Run {
            alloc_dir,
            task,
            alloc_id,
            user,
            memory,
            cpu,
            kill_timeout,
            env,
            wait,
            program,
            args,
        } => commands::run(RunConfig {
            alloc_dir,
            task,
            alloc_id,
            user,
            memory,
            cpu,
            kill_timeout,
            env,
            wait,
            program,
            args,
        }),
        Commands::Wait { id } => commands::wait(&id),
        Commands::Kill { id } => commands::kill(&id),
        Commands::Signal { id, signal } => commands::signal(&id, &signal),
        Commands::Exec {
            id,
            timeout,
            command,
            args,
        } => commands::exec(&id, timeout, &command, &args),
        Commands::Stats { id } => commands::stats(&id),
        Commands::Supervisor {
            socket,
            linger_secs,
        } => commands::supervisor(&socket, linger_secs),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_parses_trailing_program_args() {
        let cli = Cli::try_parse_from([
            "exec-driver", "run", "--alloc-dir", "/tmp/a", "--task", "t", "--", "sh", "-c", "exit 1",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { program, args, .. } => {
                assert_eq!(program, "sh");
                assert_eq!(args, vec!["-c", "exit 1"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn supervisor_subcommand_is_hidden_but_parses() {
        let cli = Cli::try_parse_from([
            "exec-driver", "supervisor", "--socket", "/tmp/s.sock", "--linger-secs", "5",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Supervisor { linger_secs: 5, .. }));
    }
}
