//! Praktor CLI entry point

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

use praktor::cli::commands::{backup, vault};
use praktor::cli::{Cli, Commands};
use praktor::infrastructure::config::ConfigLoader;
use praktor::services::Gateway;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Version needs no configuration at all.
    if matches!(cli.command, Commands::Version) {
        println!("praktor {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config_path = ConfigLoader::resolve_path(cli.config.as_deref());

    match cli.command {
        Commands::Gateway => {
            let gateway = Gateway::build(&config_path).await?;
            gateway.run().await
        }
        Commands::Vault(command) => {
            let config = ConfigLoader::load(&config_path)?;
            vault::handle(&config, command).await
        }
        Commands::Backup { file } => {
            let config = ConfigLoader::load(&config_path)?;
            backup::backup(&config, &file)
        }
        Commands::Restore { file, overwrite } => {
            let config = ConfigLoader::load(&config_path)?;
            backup::restore(&config, &file, overwrite)
        }
        Commands::Version => unreachable!("handled above"),
    }
}
