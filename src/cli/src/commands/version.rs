//! `setmirror version` command.

use clap::Args;

use setmirror_core::error::Result;

#[derive(Args)]
pub struct VersionArgs {
    /// Print only the version number
    #[arg(short, long)]
    pub short: bool,
}

pub async fn execute(args: VersionArgs) -> Result<()> {
    if args.short {
        println!("{}", setmirror_core::VERSION);
    } else {
        println!("setmirror {}", setmirror_core::VERSION);
        println!("publish pipeline {}", setmirror_publish::VERSION);
    }
    Ok(())
}
