//! The `run` subcommand: start the engine and trade until interrupted.

use tokio::signal;
use tracing::{error, info};

use crate::app::Supervisor;
use crate::cli::{Cli, RunArgs};
use crate::error::Result;

/// Run the engine in the foreground until Ctrl-C.
pub async fn run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let mut config = cli.load_config()?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json = true;
    }
    config.logging.init();

    info!(config = %cli.config.display(), "tradewind starting");
    let engine = Supervisor::start(config).await?;

    match signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received"),
        Err(err) => error!(error = %err, "Signal listener failed; shutting down"),
    }

    engine.shutdown().await;
    info!("tradewind stopped");
    Ok(())
}
