//! `setmirror publish` command.

use std::path::PathBuf;

use clap::Args;
use tokio_util::sync::CancellationToken;

use setmirror_core::config::{PublishConfig, StorageConfig, DEFAULT_WORKSPACE_DIR};
use setmirror_core::error::Result;
use setmirror_publish::Publisher;

#[derive(Args)]
pub struct PublishArgs {
    /// Path to the image set archive (a tar file or a directory of tars)
    #[arg(long)]
    pub from: PathBuf,

    /// Destination registry, optionally with a path prefix
    /// (e.g. "reg.example.com:5000/mirror")
    #[arg(long)]
    pub to_mirror: String,

    /// Extra namespace prefix under the destination
    #[arg(long, default_value = "")]
    pub user_namespace: String,

    /// Directory for Helm charts and release signatures
    /// (default: results-<timestamp> under the current directory)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Working directory root for temporary files
    #[arg(long, default_value = "")]
    pub dir: PathBuf,

    /// Keep metadata in a local file under --dir instead of a registry
    /// image at the destination
    #[arg(long)]
    pub local_metadata: bool,

    /// Destination registry speaks plain HTTP
    #[arg(long)]
    pub dest_plain_http: bool,

    /// Skip TLS verification against the destination registry
    #[arg(long)]
    pub dest_skip_tls: bool,

    /// Plan the publish without pushing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Tolerate mappings whose source files are missing
    #[arg(long)]
    pub skip_missing: bool,

    /// Keep mirroring after per-image errors
    #[arg(long)]
    pub continue_on_error: bool,

    /// Disable content verification of back-filled blobs
    #[arg(long)]
    pub skip_verification: bool,

    /// Retain temporary directories after the run
    #[arg(long)]
    pub skip_cleanup: bool,
}

impl PublishArgs {
    fn into_config(self) -> PublishConfig {
        let metadata_storage = if self.local_metadata {
            let path = if self.dir.as_os_str().is_empty() {
                PathBuf::from(DEFAULT_WORKSPACE_DIR)
            } else {
                self.dir.clone()
            };
            Some(StorageConfig::Local { path })
        } else {
            None
        };

        PublishConfig {
            from: self.from,
            to_mirror: self.to_mirror,
            user_namespace: self.user_namespace,
            output_dir: self.output_dir,
            dir: self.dir,
            dest_plain_http: self.dest_plain_http,
            dest_skip_tls: self.dest_skip_tls,
            dry_run: self.dry_run,
            skip_missing: self.skip_missing,
            continue_on_error: self.continue_on_error,
            skip_verification: self.skip_verification,
            skip_cleanup: self.skip_cleanup,
            metadata_storage,
        }
    }
}

pub async fn execute(args: PublishArgs) -> Result<()> {
    let publisher = Publisher::new(args.into_config())?;

    // Ctrl-C cancels in-flight registry I/O and lets cleanups run.
    let ctx = CancellationToken::new();
    let cancel = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling publish");
            cancel.cancel();
        }
    });

    let mappings = publisher.publish(&ctx).await?;

    println!("Published {} image(s):", mappings.len());
    let mut lines: Vec<String> = mappings
        .iter()
        .map(|(source, entry)| format!("  {} -> {}", source, entry.destination))
        .collect();
    lines.sort();
    for line in lines {
        println!("{line}");
    }

    Ok(())
}
