//! setmirror CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use setmirror_cli::commands::{dispatch, Cli};
use setmirror_core::error::MirrorError;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e}");
        let code = match e {
            MirrorError::ConfigInvalid(_) => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}
