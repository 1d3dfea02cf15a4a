// Command handlers: wire configuration and core types, no renewal logic here
pub mod renew;

use anyhow::Result;
use certrenew_core::RunContext;

use crate::cli_types::{Commands, RenewCommands};

pub async fn handle_command(ctx: &RunContext, command: Commands) -> Result<()> {
    match command {
        Commands::Renew { command } => match command {
            RenewCommands::Certificates(args) => renew::renew_certificates(ctx, args).await,
        },
    }
}
