use clap::Parser;
use tracing::error;

use tunbox::cli::{Cli, TopCommand};
use tunbox::{handlers, logging};

fn main() {
    let cli = Cli::parse();

    match cli.command {
        // The session runs on the multi-threaded runtime and may log to a file.
        TopCommand::Run {
            key,
            no_system_proxy,
            log_file,
        } => {
            match log_file {
                Some(path) => {
                    if let Err(e) = logging::init_file(&path, cli.verbose) {
                        eprintln!("failed to open log file {}: {}", path.display(), e);
                        std::process::exit(1);
                    }
                }
                None => init_logging(cli.verbose),
            }
            let rt = runtime_or_exit();
            if let Err(e) = rt.block_on(handlers::cmd_run(key, no_system_proxy)) {
                error!(command = ?"run", error = ?format!("{:#}", e), "command_failed");
                eprintln!("Error: {:#}", e);
                std::process::exit(1);
            }
        }

        TopCommand::Ping { key } => {
            init_logging(cli.verbose);
            let rt = runtime_or_exit();
            if let Err(e) = rt.block_on(handlers::cmd_ping(&key)) {
                error!(command = ?"ping", error = ?e.to_string(), "command_failed");
                std::process::exit(1);
            }
        }

        // Everything else is quick file or subprocess work, no tokio needed.
        other => {
            init_logging(cli.verbose);
            let (name, result) = match other {
                TopCommand::Config { key } => ("config", handlers::cmd_config(&key)),
                TopCommand::ResetProxy => ("reset-proxy", handlers::cmd_reset_proxy()),
                TopCommand::Profile { command } => ("profile", handlers::dispatch_profile(command)),
                TopCommand::Sub { command } => ("sub", handlers::dispatch_sub(command)),
                TopCommand::Settings { command } => {
                    ("settings", handlers::dispatch_settings(command))
                }
                TopCommand::Run { .. } | TopCommand::Ping { .. } => unreachable!(),
            };
            if let Err(e) = result {
                error!(command = ?name, error = ?e.to_string(), "command_failed");
                std::process::exit(1);
            }
        }
    }
}

fn init_logging(verbose: bool) {
    logging::init_terminal(verbose);
}

fn runtime_or_exit() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = ?e.to_string(), "tokio_runtime_failed");
            std::process::exit(1);
        }
    }
}
