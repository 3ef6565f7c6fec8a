//! Registry-image metadata backend.
//!
//! Mirrors the local-directory backend into a single-layer container image
//! at a configured reference. Reads pull the image and export its
//! filesystem into the local buffer directory; writes update the buffer
//! and push a fresh single-blob image holding just the metadata file.

use std::path::Path;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tokio_util::sync::CancellationToken;

use setmirror_core::config::StorageConfig;
use setmirror_core::error::{MirrorError, Result};
use setmirror_core::metadata::Metadata;
use setmirror_core::reference::ImageReference;

use crate::registry::{ManifestProbe, RegistryAuth, RegistryClient};

use super::{Backend, LocalDirBackend, ObjectStat};

/// Metadata backend backed by a registry image, buffered through a local
/// directory.
pub struct RegistryBackend {
    /// Image contents are represented locally as files, so the local dir
    /// backend is the underlying store.
    local: LocalDirBackend,
    /// Image used when pushing and pulling
    src: ImageReference,
    client: RegistryClient,
}

impl RegistryBackend {
    /// Create the backend for the metadata image at `image_url`.
    /// The tag defaults to `latest` when the reference carries neither a
    /// tag nor a digest.
    pub fn new(image_url: &str, skip_tls: bool, dir: &Path) -> Result<Self> {
        let mut src = ImageReference::parse(image_url)?;
        if src.tag.is_none() && src.digest.is_none() {
            src.tag = Some("latest".to_string());
        }
        if src.registry.is_empty() || src.name.is_empty() {
            return Err(MirrorError::ConfigInvalid(format!(
                "metadata image {} must name a registry repository",
                image_url
            )));
        }

        let auth = RegistryAuth::from_credential_store(&src.registry);
        let client = RegistryClient::new(skip_tls, auth);
        let local = LocalDirBackend::new(dir)?;

        Ok(Self { local, src, client })
    }

    /// Check that the metadata image exists.
    ///
    /// 404 means no metadata has been committed yet. 401 is followed by a
    /// push-permission probe: when the credentials could write the image,
    /// the repository simply does not exist yet and this is a first run.
    async fn exists(&self, ctx: &CancellationToken) -> Result<()> {
        tracing::debug!(image = %self.src, "Checking for existing metadata image");
        match self.client.probe_manifest(ctx, &self.src).await? {
            ManifestProbe::Exists => Ok(()),
            ManifestProbe::NotFound => Err(MirrorError::MetadataNotExist),
            ManifestProbe::Unauthorized => {
                self.client.check_push_permission(ctx, &self.src).await?;
                // Push permission without a readable manifest means the
                // image has not been pushed yet.
                Err(MirrorError::MetadataNotExist)
            }
            ManifestProbe::Failed(err) => Err(err),
        }
    }

    /// Pull the metadata image and export its filesystem into the local
    /// buffer directory.
    async fn unpack(&self, ctx: &CancellationToken, path: &str) -> Result<()> {
        let layers = self.client.pull_layers(ctx, &self.src).await?;
        for layer in layers {
            let gzipped = layer.media_type.contains("gzip")
                || layer.data.starts_with(&[0x1f, 0x8b]);
            if gzipped {
                let decoder = GzDecoder::new(layer.data.as_slice());
                let mut archive = tar::Archive::new(decoder);
                archive.unpack(self.local.dir())?;
            } else {
                let mut archive = tar::Archive::new(layer.data.as_slice());
                archive.unpack(self.local.dir())?;
            }
        }
        // The exported file arrives with the image's permissions; make
        // sure later writes to the buffer succeed.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let full = self.local.dir().join(path);
            if full.exists() {
                std::fs::set_permissions(&full, std::fs::Permissions::from_mode(0o600))?;
            }
        }
        #[cfg(not(unix))]
        let _ = path;
        Ok(())
    }

    /// Push a fresh single-blob metadata image containing `data` at `path`.
    async fn push_image(&self, ctx: &CancellationToken, path: &str, data: &[u8]) -> Result<()> {
        tracing::debug!(image = %self.src, "Pushing metadata to registry");
        self.client
            .push_file_image(ctx, &self.src, &[(path.to_string(), data.to_vec())])
            .await
    }
}

#[async_trait]
impl Backend for RegistryBackend {
    async fn read_metadata(&self, ctx: &CancellationToken, path: &str) -> Result<Metadata> {
        self.exists(ctx).await?;
        self.unpack(ctx, path).await?;
        self.local.read_metadata(ctx, path).await
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
        self.local.read_object(ctx, path).await
    }

    async fn write_object(&self, ctx: &CancellationToken, path: &str, data: &[u8]) -> Result<()> {
        // Buffer locally for packing into archives, then mirror to the
        // registry.
        self.local.write_object(ctx, path, data).await?;
        self.push_image(ctx, path, data).await
    }

    async fn open(
        &self,
        ctx: &CancellationToken,
        path: &str,
    ) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>> {
        match self.local.stat(ctx, path).await {
            Ok(_) => {}
            Err(MirrorError::MetadataNotExist) => self.unpack(ctx, path).await?,
            Err(e) => return Err(e),
        }
        self.local.open(ctx, path).await
    }

    async fn stat(&self, ctx: &CancellationToken, path: &str) -> Result<ObjectStat> {
        self.exists(ctx).await?;
        self.local.stat(ctx, path).await
    }

    async fn cleanup(&self, ctx: &CancellationToken, path: &str) -> Result<()> {
        // The distribution API has no portable delete; the remote image is
        // left for registry garbage collection.
        tracing::debug!(image = %self.src, "Leaving metadata image in place during cleanup");
        self.local.cleanup(ctx, path).await
    }

    fn check_config(&self, cfg: &StorageConfig) -> Result<()> {
        match cfg {
            StorageConfig::Registry { .. } => Ok(()),
            _ => Err(MirrorError::ConfigInvalid(
                "not a registry backend configuration".to_string(),
            )),
        }
    }
}
