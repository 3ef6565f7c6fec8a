//! Local-directory metadata backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use setmirror_core::config::StorageConfig;
use setmirror_core::error::{MirrorError, Result};
use setmirror_core::metadata::Metadata;

use super::{Backend, ObjectStat};

/// Metadata backend rooted at a directory; object paths are file paths
/// below the root.
#[derive(Debug, Clone)]
pub struct LocalDirBackend {
    dir: PathBuf,
}

impl LocalDirBackend {
    /// Create the backend, creating the root directory if needed.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Root directory of this backend.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.dir.join(path)
    }

    fn check_cancelled(ctx: &CancellationToken) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for LocalDirBackend {
    async fn read_metadata(&self, ctx: &CancellationToken, path: &str) -> Result<Metadata> {
        let data = self.read_object(ctx, path).await?;
        let meta: Metadata = serde_json::from_slice(&data)?;
        Ok(meta)
    }

    async fn write_metadata(
        &self,
        ctx: &CancellationToken,
        meta: &Metadata,
        path: &str,
    ) -> Result<()> {
        let data = serde_json::to_vec(meta)?;
        self.write_object(ctx, path, &data).await
    }

    async fn read_object(&self, ctx: &CancellationToken, path: &str) -> Result<Vec<u8>> {
        Self::check_cancelled(ctx)?;
        match tokio::fs::read(self.resolve(path)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MirrorError::MetadataNotExist)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_object(&self, ctx: &CancellationToken, path: &str, data: &[u8]) -> Result<()> {
        Self::check_cancelled(ctx)?;
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, data).await?;
        Ok(())
    }

    async fn open(
        &self,
        ctx: &CancellationToken,
        path: &str,
    ) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>> {
        Self::check_cancelled(ctx)?;
        match tokio::fs::File::open(self.resolve(path)).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MirrorError::MetadataNotExist)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, ctx: &CancellationToken, path: &str) -> Result<ObjectStat> {
        Self::check_cancelled(ctx)?;
        match tokio::fs::metadata(self.resolve(path)).await {
            Ok(info) => Ok(ObjectStat { size: info.len() }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MirrorError::MetadataNotExist)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cleanup(&self, ctx: &CancellationToken, path: &str) -> Result<()> {
        Self::check_cancelled(ctx)?;
        match tokio::fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn check_config(&self, cfg: &StorageConfig) -> Result<()> {
        match cfg {
            StorageConfig::Local { .. } => Ok(()),
            _ => Err(MirrorError::ConfigInvalid(
                "not a local backend configuration".to_string(),
            )),
        }
    }
}
