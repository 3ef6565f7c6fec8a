//! Configuration types shared between the archive generator and the
//! publish pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Relative path of the serialized metadata record inside an archive
/// and inside a metadata backend. Shared with the generator.
pub const METADATA_BASE_PATH: &str = "publish/.metadata.json";

/// Top-level manifests tree inside an archive.
pub const V2_DIR: &str = "v2";

/// Flat content-addressed blob store inside an archive.
pub const BLOB_DIR: &str = "blobs";

/// Helm charts tree inside an archive.
pub const HELM_DIR: &str = "charts";

/// Release signatures tree inside an archive.
pub const RELEASE_SIGNATURE_DIR: &str = "release-signatures";

/// File-based operator catalogs tree inside an archive.
pub const CATALOGS_DIR: &str = "catalogs";

/// Upgrade-graph data tree inside an archive.
pub const GRAPH_DATA_DIR: &str = "graph-data";

/// Repository name used for the metadata image on the registry backend.
pub const METADATA_IMAGE_NAME: &str = "setmirror-metadata";

/// Default workspace directory when the configuration names none.
pub const DEFAULT_WORKSPACE_DIR: &str = "setmirror-workspace";

/// Where the persistent metadata record lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    /// JSON file under a local directory
    Local {
        /// Root directory for metadata and buffered objects
        path: PathBuf,
    },

    /// Single-layer container image in a registry, buffered through a
    /// local directory
    Registry {
        /// Image reference for the metadata image (tag defaults to "latest")
        image_url: String,
        /// Accept plain HTTP and skip TLS verification
        #[serde(default)]
        skip_tls: bool,
    },
}

/// Configuration surface of a publish invocation.
#[derive(Debug, Clone, Default)]
pub struct PublishConfig {
    /// Path to the image set archive (a tar file or a directory of tars)
    pub from: PathBuf,
    /// Destination registry, optionally with a path prefix
    pub to_mirror: String,
    /// Extra namespace prefix under the destination
    pub user_namespace: String,
    /// Where Helm charts and release signatures are emitted.
    /// Defaults to `results-<timestamp>` under the working directory.
    pub output_dir: Option<PathBuf>,
    /// Root directory for temporary workspaces
    pub dir: PathBuf,
    /// Destination registry speaks plain HTTP
    pub dest_plain_http: bool,
    /// Skip TLS verification against the destination registry
    pub dest_skip_tls: bool,
    /// Plan only; simulate pushes
    pub dry_run: bool,
    /// Forwarded to the mirror driver: tolerate missing source blobs
    pub skip_missing: bool,
    /// Forwarded to the mirror driver: keep pushing after per-mapping errors
    pub continue_on_error: bool,
    /// Disable registry-client content verification
    pub skip_verification: bool,
    /// Retain temporary directories after the run
    pub skip_cleanup: bool,
    /// Explicit metadata storage selection. Defaults to a registry image
    /// under the destination; single-use metadata always forces a local
    /// stateless store.
    pub metadata_storage: Option<StorageConfig>,
}

impl PublishConfig {
    /// Collapsed insecure flag for registry clients.
    pub fn insecure(&self) -> bool {
        self.dest_plain_http || self.dest_skip_tls
    }
}
