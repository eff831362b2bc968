use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::ArbiterConfig;
use crate::error::Result;
use crate::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "arbiter", version, about = "Autonomous agent orchestrator")]
pub struct Cli {
    /// Path to the configuration document.
    #[arg(long, global = true, default_value = ".arbiter/config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the orchestrator: one dispatch loop per configured project.
    Serve,
    /// Validate the configuration document and exit.
    CheckConfig,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::CheckConfig => {
            let config = ArbiterConfig::load(&cli.config).await?;
            println!(
                "ok: {} providers, {} projects",
                config.providers.len(),
                config.projects.len()
            );
            Ok(())
        }
        Command::Serve => {
            let config = ArbiterConfig::load(&cli.config).await?;
            let orchestrator = Orchestrator::from_config(config).await?;

            let cancel = orchestrator.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested");
                    cancel.cancel();
                }
            });

            let result = orchestrator.run().await;
            orchestrator.shutdown();
            result
        }
    }
}
