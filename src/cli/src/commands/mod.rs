//! CLI command definitions and dispatch.

mod publish;
mod version;

use clap::{Parser, Subcommand};

use setmirror_core::error::Result;

/// setmirror: publish image set archives to a registry.
#[derive(Parser)]
#[command(name = "setmirror", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Publish an image set archive to a destination registry
    Publish(publish::PublishArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Publish(args) => publish::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
