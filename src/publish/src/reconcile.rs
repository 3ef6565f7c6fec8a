//! Blob back-filling for differential archives.
//!
//! A differential archive omits layer blobs that a previous publish
//! already placed in the destination registry. For each missing layer the
//! reconciler looks up a source image in the prior run's cumulative
//! associations, rewrites that reference onto the destination registry,
//! fetches the blob once and copies it into every path that needs it.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use setmirror_core::association::AssociationSet;
use setmirror_core::error::{MirrorError, Result};
use setmirror_core::metadata::Metadata;
use setmirror_core::reference::{join_namespace, ImageReference};

use crate::registry::RegistryClient;

/// Layer digest -> destination blob paths waiting for its content.
pub type MissingLayers = HashMap<String, Vec<PathBuf>>;

/// Source of blob content by digest.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    /// Fetch the blob `digest` from the repository of `reference`.
    async fn fetch_blob(
        &self,
        ctx: &CancellationToken,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<Vec<u8>>;
}

/// Blob fetcher backed by the registry client.
pub struct RegistryBlobFetcher {
    client: RegistryClient,
}

impl RegistryBlobFetcher {
    pub fn new(client: RegistryClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlobFetcher for RegistryBlobFetcher {
    async fn fetch_blob(
        &self,
        ctx: &CancellationToken,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<Vec<u8>> {
        self.client.fetch_blob(ctx, reference, digest).await
    }
}

/// Back-fills missing layer blobs from the destination registry.
pub struct BlobReconciler<'a> {
    /// Parsed destination registry (host plus optional path prefix)
    dest: &'a ImageReference,
    /// Extra namespace prefix configured by the user
    user_namespace: &'a str,
    fetcher: &'a dyn BlobFetcher,
    /// Skip sha256 verification of fetched content
    skip_verification: bool,
}

impl<'a> BlobReconciler<'a> {
    pub fn new(
        dest: &'a ImageReference,
        user_namespace: &'a str,
        fetcher: &'a dyn BlobFetcher,
        skip_verification: bool,
    ) -> Self {
        Self {
            dest,
            user_namespace,
            fetcher,
            skip_verification,
        }
    }

    /// Fetch every missing layer and write it to each destination path.
    ///
    /// A layer with no source in the prior metadata fails the run: the
    /// metadata is inconsistent with the destination state. Every other
    /// failure (transport, digest mismatch, copy) is returned with its
    /// original error kind for the caller to accumulate with the
    /// per-image errors; the image loop then continues.
    pub async fn fetch_blobs(
        &self,
        ctx: &CancellationToken,
        current: &Metadata,
        missing: &MissingLayers,
    ) -> Result<Vec<MirrorError>> {
        let past = AssociationSet::from_associations(&current.past_associations);

        let mut digests: Vec<&String> = missing.keys().collect();
        digests.sort();

        let mut errs: Vec<MirrorError> = Vec::new();
        for digest in digests {
            let source = self.find_blob_repo(&past, digest)?;
            tracing::debug!(digest = %digest, source = %source, "Copying blob");

            let data = match self.fetcher.fetch_blob(ctx, &source, digest).await {
                Ok(data) => data,
                Err(MirrorError::Cancelled) => return Err(MirrorError::Cancelled),
                Err(e) => {
                    tracing::debug!(layer = %digest, error = %e, "blob fetch failed");
                    errs.push(e);
                    continue;
                }
            };

            if !self.skip_verification {
                if let Err(e) = verify_digest(digest, &data) {
                    errs.push(e);
                    continue;
                }
            }

            for dst in &missing[digest.as_str()] {
                if let Err(e) = copy_blob_file(&data, dst) {
                    errs.push(MirrorError::Other(format!(
                        "copy blob for {}: {}",
                        source, e
                    )));
                }
            }
        }

        Ok(errs)
    }

    /// Locate the image that owned `digest` in a prior run and rewrite its
    /// reference onto the destination registry. A prior publish put the
    /// blob there, which is why the destination (not the origin) is the
    /// fetch source.
    fn find_blob_repo(&self, past: &AssociationSet, digest: &str) -> Result<ImageReference> {
        let source = past
            .image_for_blob(digest)
            .ok_or_else(|| MirrorError::BlobSourceUnavailable {
                digest: digest.to_string(),
            })?;

        let mut reference = ImageReference::parse(source)?;
        reference.registry = self.dest.registry.clone();
        reference.namespace = join_namespace(&[
            &self.dest.repository(),
            self.user_namespace,
            &reference.namespace,
        ]);
        Ok(reference)
    }
}

/// Verify the sha256 of fetched blob content against its digest.
fn verify_digest(digest: &str, data: &[u8]) -> Result<()> {
    let hex = match digest.strip_prefix("sha256:") {
        Some(hex) => hex,
        // Unknown algorithms are passed through unverified.
        None => return Ok(()),
    };
    let actual = format!("{:x}", Sha256::digest(data));
    if actual != hex {
        return Err(MirrorError::DigestMismatch {
            digest: digest.to_string(),
            actual: format!("sha256:{}", actual),
        });
    }
    Ok(())
}

/// Write blob content to a destination path, truncating any previous
/// content so repeated writes of the same digest converge.
fn copy_blob_file(data: &[u8], dst: &Path) -> Result<()> {
    tracing::debug!(path = %dst.display(), "copying blob");
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(dst)?;
    file.write_all(data)?;
    Ok(())
}
