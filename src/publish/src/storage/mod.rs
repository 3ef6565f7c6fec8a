//! Persistent metadata storage.
//!
//! Two backends expose the same operations: a local directory holding a
//! JSON file, and a registry image wrapping that local directory as a
//! buffer. `read_metadata` returns [`MirrorError::MetadataNotExist`] when
//! no metadata has ever been committed; the coordinator branches on that
//! sentinel to take the first-run path.

mod local;
mod registry;

pub use local::LocalDirBackend;
pub use registry::RegistryBackend;

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use setmirror_core::config::StorageConfig;
use setmirror_core::error::Result;
use setmirror_core::metadata::Metadata;

/// Size and existence information for a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
}

/// A metadata storage backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Read the metadata record at `path`.
    async fn read_metadata(&self, ctx: &CancellationToken, path: &str) -> Result<Metadata>;

    /// Replace the metadata record at `path`.
    async fn write_metadata(
        &self,
        ctx: &CancellationToken,
        meta: &Metadata,
        path: &str,
    ) -> Result<()>;

    /// Read a free-form object at a relative path.
    async fn read_object(&self, ctx: &CancellationToken, path: &str) -> Result<Vec<u8>>;

    /// Write a free-form object at a relative path.
    async fn write_object(&self, ctx: &CancellationToken, path: &str, data: &[u8]) -> Result<()>;

    /// Open an object for streaming reads.
    async fn open(
        &self,
        ctx: &CancellationToken,
        path: &str,
    ) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>>;

    /// Existence and size of an object.
    async fn stat(&self, ctx: &CancellationToken, path: &str) -> Result<ObjectStat>;

    /// Remove the object at `path` from the backend.
    async fn cleanup(&self, ctx: &CancellationToken, path: &str) -> Result<()>;

    /// Verify that `cfg` selects this backend kind.
    fn check_config(&self, cfg: &StorageConfig) -> Result<()>;
}

/// Construct the backend selected by `cfg`. `dir` roots the local
/// directory the registry backend buffers through.
pub fn by_config(dir: &Path, cfg: &StorageConfig) -> Result<Box<dyn Backend>> {
    match cfg {
        StorageConfig::Local { path } => Ok(Box::new(LocalDirBackend::new(path)?)),
        StorageConfig::Registry { image_url, skip_tls } => Ok(Box::new(RegistryBackend::new(
            image_url, *skip_tls, dir,
        )?)),
    }
}
