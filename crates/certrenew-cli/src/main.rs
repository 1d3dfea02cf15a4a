mod cli_types;
mod commands;

use anyhow::Result;
use certrenew_core::RunContext;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cli_types::Cli;

fn init_logging(verbosity: u8) {
    let default_level = if verbosity >= 2 { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Passphrase variables may live in .env
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.verbosity());

    let ctx = RunContext::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⚠ Interrupted, stopping after the current remote command");
            interrupt.cancel();
        }
    });

    commands::handle_command(&ctx, cli.command).await
}
