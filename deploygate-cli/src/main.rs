mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use deploygate::errors::ConfigError;
use deploygate::observability::init_tracing;

/// Exit code for invalid configuration or arguments.
const EXIT_CONFIG: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_format.into(), cli.verbose) {
        eprintln!("warning: {e}");
    }

    let result = match cli.command {
        Commands::Run(args) => commands::run(args).await,
        Commands::Plan(args) => commands::plan(&args),
        Commands::Check(args) => commands::check(&args),
        Commands::Backends(args) => commands::backends(&args).await,
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        EXIT_CONFIG
    } else {
        1
    }
}
