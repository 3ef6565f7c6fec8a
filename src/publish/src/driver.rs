//! Mirror driver: pushes assembled per-image layouts to the destination.
//!
//! The coordinator hands the driver one image's mappings plus the temp
//! directory holding its file layout. Everything below that call is the
//! mirroring library's concern: reading manifests and blobs out of the
//! layout and uploading them, honoring the fixed option surface the
//! publisher configures.

use std::path::Path;

use async_trait::async_trait;
use oci_distribution::client::{Config, ImageLayer};
use oci_distribution::manifest::{OciImageIndex, OciImageManifest};
use tokio_util::sync::CancellationToken;

use setmirror_core::config::{PublishConfig, BLOB_DIR, V2_DIR};
use setmirror_core::error::{MirrorError, Result};
use setmirror_core::mapping::Mapping;

use crate::registry::RegistryClient;

/// Fixed option surface forwarded to the mirroring layer.
#[derive(Debug, Clone)]
pub struct MirrorFlags {
    /// Plan only; simulate pushes
    pub dry_run: bool,
    /// Tolerate mappings whose source files are missing
    pub skip_missing: bool,
    /// Keep pushing after per-mapping errors
    pub continue_on_error: bool,
    /// Plain HTTP / skip TLS verification
    pub insecure: bool,
    /// Disable content verification
    pub skip_verification: bool,
    /// OS filter regex. Publishing always uses the wildcard: filtering
    /// already happened on the producer side and catalogs cannot be
    /// filtered per-image.
    pub os_filter: String,
    /// Preserve manifest lists instead of resolving one platform
    pub keep_manifest_list: bool,
    /// Skip multi-scope de-duplication
    pub skip_multiple_scopes: bool,
}

impl MirrorFlags {
    /// Driver flags for a publish run.
    pub fn from_config(cfg: &PublishConfig) -> Self {
        Self {
            dry_run: cfg.dry_run,
            skip_missing: cfg.skip_missing,
            continue_on_error: cfg.continue_on_error,
            insecure: cfg.insecure(),
            skip_verification: cfg.skip_verification,
            os_filter: ".*".to_string(),
            keep_manifest_list: true,
            skip_multiple_scopes: true,
        }
    }
}

/// Pushes one image's mappings out of a local file layout.
#[async_trait]
pub trait MirrorDriver: Send + Sync {
    async fn mirror(
        &self,
        ctx: &CancellationToken,
        mappings: &[Mapping],
        from_dir: &Path,
    ) -> Result<()>;
}

/// Driver implementation over the registry client.
pub struct RegistryMirror {
    client: RegistryClient,
    flags: MirrorFlags,
}

/// A mapping paired with its parsed manifest payload.
enum LoadedMapping<'a> {
    Image(&'a Mapping, OciImageManifest),
    Index(&'a Mapping, OciImageIndex),
}

impl RegistryMirror {
    pub fn new(client: RegistryClient, flags: MirrorFlags) -> Self {
        Self { client, flags }
    }

    /// Read and classify the manifest behind one mapping.
    fn load_manifest<'a>(
        &self,
        mapping: &'a Mapping,
        from_dir: &Path,
    ) -> Result<Option<LoadedMapping<'a>>> {
        let digest = mapping
            .source
            .reference
            .digest
            .as_deref()
            .ok_or_else(|| MirrorError::Other(format!("mapping {} has no digest", mapping.name)))?;
        let manifest_path = from_dir
            .join(V2_DIR)
            .join(mapping.source.reference.repository())
            .join("manifests")
            .join(digest);

        let data = match std::fs::read(&manifest_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && self.flags.skip_missing => {
                tracing::warn!(
                    mapping = %mapping.name,
                    path = %manifest_path.display(),
                    "Skipping mapping with missing manifest"
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let value: serde_json::Value = serde_json::from_slice(&data)?;
        if value.get("manifests").is_some() {
            let index: OciImageIndex = serde_json::from_value(value)?;
            Ok(Some(LoadedMapping::Index(mapping, index)))
        } else {
            let manifest: OciImageManifest = serde_json::from_value(value)?;
            Ok(Some(LoadedMapping::Image(mapping, manifest)))
        }
    }

    /// Read a blob out of the mapping's layout directory.
    fn read_blob(
        &self,
        mapping: &Mapping,
        from_dir: &Path,
        digest: &str,
    ) -> Result<Option<Vec<u8>>> {
        let blob_path = from_dir
            .join(V2_DIR)
            .join(mapping.source.reference.repository())
            .join(BLOB_DIR)
            .join(digest);
        match std::fs::read(&blob_path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && self.flags.skip_missing => {
                tracing::warn!(
                    mapping = %mapping.name,
                    blob = %digest,
                    "Skipping mapping with missing blob"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn push_image_mapping(
        &self,
        ctx: &CancellationToken,
        mapping: &Mapping,
        manifest: OciImageManifest,
        from_dir: &Path,
    ) -> Result<()> {
        let config_data = match self.read_blob(mapping, from_dir, &manifest.config.digest)? {
            Some(data) => data,
            None => return Ok(()),
        };
        let config = Config {
            data: config_data,
            media_type: manifest.config.media_type.clone(),
            annotations: None,
        };

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for descriptor in &manifest.layers {
            let data = match self.read_blob(mapping, from_dir, &descriptor.digest)? {
                Some(data) => data,
                None => return Ok(()),
            };
            layers.push(ImageLayer {
                data,
                media_type: descriptor.media_type.clone(),
                annotations: None,
            });
        }

        tracing::debug!(
            source = %mapping.source,
            destination = %mapping.destination,
            "mirroring image"
        );
        self.client
            .push_image(
                ctx,
                &mapping.destination.reference,
                layers,
                config,
                Some(manifest),
            )
            .await
    }

    async fn push_index_mapping(
        &self,
        ctx: &CancellationToken,
        mapping: &Mapping,
        index: OciImageIndex,
    ) -> Result<()> {
        tracing::debug!(
            source = %mapping.source,
            destination = %mapping.destination,
            "mirroring manifest list"
        );
        self.client
            .push_index(ctx, &mapping.destination.reference, index)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MirrorDriver for RegistryMirror {
    async fn mirror(
        &self,
        ctx: &CancellationToken,
        mappings: &[Mapping],
        from_dir: &Path,
    ) -> Result<()> {
        if self.flags.dry_run {
            for mapping in mappings {
                tracing::info!(
                    source = %mapping.source,
                    destination = %mapping.destination,
                    "dry-run: would mirror"
                );
            }
            return Ok(());
        }

        let mut loaded = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            if let Some(entry) = self.load_manifest(mapping, from_dir)? {
                loaded.push(entry);
            }
        }
        // Child platform manifests must reach the registry before the
        // index that references them.
        loaded.sort_by_key(|entry| matches!(entry, LoadedMapping::Index(..)));

        let mut errs: Vec<MirrorError> = Vec::new();
        for entry in loaded {
            let result = match entry {
                LoadedMapping::Image(mapping, manifest) => {
                    self.push_image_mapping(ctx, mapping, manifest, from_dir).await
                }
                LoadedMapping::Index(mapping, index) => {
                    if !self.flags.keep_manifest_list {
                        tracing::warn!(
                            mapping = %mapping.name,
                            "manifest list encountered with keep_manifest_list disabled"
                        );
                    }
                    self.push_index_mapping(ctx, mapping, index).await
                }
            };
            match result {
                Ok(()) => {}
                Err(MirrorError::Cancelled) => return Err(MirrorError::Cancelled),
                Err(e) if self.flags.continue_on_error => errs.push(e),
                Err(e) => return Err(e),
            }
        }

        match MirrorError::aggregate(errs) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use setmirror_core::reference::TypedImageReference;
    use tempfile::TempDir;

    fn flags() -> MirrorFlags {
        MirrorFlags {
            dry_run: false,
            skip_missing: false,
            continue_on_error: false,
            insecure: true,
            skip_verification: false,
            os_filter: ".*".to_string(),
            keep_manifest_list: true,
            skip_multiple_scopes: true,
        }
    }

    fn mapping_for(path: &str, digest: &str) -> Mapping {
        let mut source = TypedImageReference::parse(&format!("file://{}", path)).unwrap();
        source.reference.digest = Some(digest.to_string());
        let mut destination =
            TypedImageReference::parse(&format!("reg.test/{}", path)).unwrap();
        destination.reference.digest = Some(digest.to_string());
        Mapping {
            name: path.to_string(),
            source,
            destination,
        }
    }

    #[test]
    fn test_flags_from_config() {
        let cfg = PublishConfig {
            dry_run: true,
            dest_plain_http: true,
            ..Default::default()
        };
        let flags = MirrorFlags::from_config(&cfg);
        assert!(flags.dry_run);
        assert!(flags.insecure);
        assert_eq!(flags.os_filter, ".*");
        assert!(flags.keep_manifest_list);
        assert!(flags.skip_multiple_scopes);
    }

    #[test]
    fn test_load_manifest_classifies_kinds() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();

        let image_manifest = r#"{
            "schemaVersion": 2,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:c0ff", "size": 2},
            "layers": [{"mediaType": "application/vnd.oci.image.layer.v1.tar", "digest": "sha256:aaa1", "size": 9}]
        }"#;
        let index_manifest = r#"{
            "schemaVersion": 2,
            "manifests": [{"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:bab3", "size": 4}]
        }"#;

        std::fs::create_dir_all(dir.join("v2/app/manifests")).unwrap();
        std::fs::write(dir.join("v2/app/manifests/sha256:img1"), image_manifest).unwrap();
        std::fs::write(dir.join("v2/app/manifests/sha256:idx1"), index_manifest).unwrap();

        let mirror = RegistryMirror::new(
            RegistryClient::new(true, crate::registry::RegistryAuth::anonymous()),
            flags(),
        );

        let loaded = mirror
            .load_manifest(&mapping_for("app", "sha256:img1"), dir)
            .unwrap()
            .unwrap();
        assert!(matches!(loaded, LoadedMapping::Image(..)));

        let loaded = mirror
            .load_manifest(&mapping_for("app", "sha256:idx1"), dir)
            .unwrap()
            .unwrap();
        assert!(matches!(loaded, LoadedMapping::Index(..)));
    }

    #[test]
    fn test_load_manifest_missing_without_skip() {
        let tmp = TempDir::new().unwrap();
        let mirror = RegistryMirror::new(
            RegistryClient::new(true, crate::registry::RegistryAuth::anonymous()),
            flags(),
        );
        let err = mirror
            .load_manifest(&mapping_for("app", "sha256:gone"), tmp.path())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_load_manifest_missing_with_skip() {
        let tmp = TempDir::new().unwrap();
        let mut f = flags();
        f.skip_missing = true;
        let mirror = RegistryMirror::new(
            RegistryClient::new(true, crate::registry::RegistryAuth::anonymous()),
            f,
        );
        let loaded = mirror
            .load_manifest(&mapping_for("app", "sha256:gone"), tmp.path())
            .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_dry_run_pushes_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut f = flags();
        f.dry_run = true;
        let mirror = RegistryMirror::new(
            RegistryClient::new(true, crate::registry::RegistryAuth::anonymous()),
            f,
        );

        // No layout exists; a real push would fail reading files. Dry run
        // never touches the layout or the network.
        let ctx = CancellationToken::new();
        mirror
            .mirror(&ctx, &[mapping_for("app", "sha256:img1")], tmp.path())
            .await
            .unwrap();
    }
}
