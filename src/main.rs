use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use classify_trainer::cli::{exit_code, Cli};

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("classify_trainer=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.run() {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            eprintln!("Error: {err:?}");
            Ok(ExitCode::from(exit_code(&err)))
        }
    }
}
