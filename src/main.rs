use std::sync::Arc;

use clap::Parser;

use leger::config::{CliArgs, LegerConfig};
use leger::exec::{ProcessRunner, require_binary};
use leger::orchestrator::Orchestrator;
use leger::telemetry;

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    let config = match LegerConfig::from_env_and_args(&cli.global) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(err.exit_code());
        }
    };

    if let Err(err) = telemetry::init(&config) {
        eprintln!("warning: {err}");
    }
    for binary in [&config.engine_bin, &config.sm_bin] {
        if let Err(err) = require_binary(binary) {
            eprintln!("warning: {err}");
        }
    }

    let orchestrator = match Orchestrator::new(config, Arc::new(ProcessRunner)) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.exit_code());
        }
    };

    if let Err(err) = orchestrator.run(cli.command).await {
        eprintln!("error: {err}");
        std::process::exit(err.exit_code());
    }
}
