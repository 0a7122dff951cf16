//! `focus-stack` CLI binary (spec §6 "CLI surface"). Parses argv into a
//! `Cli`/`EngineConfig`, drives the library's `Orchestrator` to completion,
//! and maps the run outcome onto the documented exit codes: success 0,
//! processing failure 1 with the sink error message, usage error 1 with
//! clap's own message (fewer than two positional inputs).

use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use focus_stack::cli::Cli;
use focus_stack::logger::{LogLevel, Logger};
use focus_stack::Orchestrator;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let verbose = cli.verbose;
    let inputs = cli.inputs.clone();

    let config = match cli.into_config() {
        Ok(cfg) => cfg,
        Err(msg) => {
            error!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let logger = Logger::new();
    if verbose {
        logger.set_level(LogLevel::Verbose);
    }

    let orchestrator = match Orchestrator::new(config, logger) {
        Ok(o) => o,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let (_outputs, outcome) = match orchestrator.run(inputs, None) {
        Ok(result) => result,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if outcome.success {
        info!("focus stack complete");
        ExitCode::SUCCESS
    } else {
        let message = outcome.error_message.unwrap_or_else(|| "run failed".to_string());
        error!("{message}");
        ExitCode::FAILURE
    }
}
