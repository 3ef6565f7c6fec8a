//! Publish coordinator.
//!
//! Drives a full publish run: index the archive, load and validate
//! metadata, assemble each image's layout, back-fill missing blobs, push
//! through the mirror driver, process derivative images and finally commit
//! the incoming metadata as the new current state.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use setmirror_core::config::{
    PublishConfig, StorageConfig, BLOB_DIR, CATALOGS_DIR, DEFAULT_WORKSPACE_DIR,
    GRAPH_DATA_DIR, HELM_DIR, METADATA_BASE_PATH, METADATA_IMAGE_NAME,
    RELEASE_SIGNATURE_DIR, V2_DIR,
};
use setmirror_core::error::{MirrorError, Result};
use setmirror_core::mapping::TypedImageMapping;
use setmirror_core::metadata::Metadata;
use setmirror_core::reference::{join_namespace, ImageReference, TypedImageReference};

use crate::archive::ArchiveReader;
use crate::custom::{CustomImageBuilder, CustomImageProcessor, GraphImageBuilder};
use crate::driver::{MirrorDriver, MirrorFlags, RegistryMirror};
use crate::layout::ImageAssembler;
use crate::reconcile::{BlobFetcher, BlobReconciler, RegistryBlobFetcher};
use crate::registry::{RegistryAuth, RegistryClient};
use crate::sequence::verify_sequence;
use crate::storage::{by_config, Backend, LocalDirBackend};

/// Top-level publish driver wiring the pipeline together.
pub struct Publisher {
    config: PublishConfig,
    /// Parsed destination registry (host plus optional path prefix)
    dest: ImageReference,
    driver: Box<dyn MirrorDriver>,
    fetcher: Box<dyn BlobFetcher>,
    custom: Box<dyn CustomImageBuilder>,
}

impl Publisher {
    /// Create a publisher with production components.
    pub fn new(config: PublishConfig) -> Result<Self> {
        let dest = Self::validate(&config)?;
        let insecure = config.insecure();
        let auth = RegistryAuth::from_credential_store(&dest.registry);

        let driver = RegistryMirror::new(
            RegistryClient::new(insecure, auth.clone()),
            MirrorFlags::from_config(&config),
        );
        let fetcher = RegistryBlobFetcher::new(RegistryClient::new(insecure, auth.clone()));
        let custom = GraphImageBuilder::new(
            RegistryClient::new(insecure, auth),
            dest.clone(),
            config.user_namespace.clone(),
        );

        Ok(Self {
            config,
            dest,
            driver: Box::new(driver),
            fetcher: Box::new(fetcher),
            custom: Box::new(custom),
        })
    }

    /// Create a publisher with caller-supplied components. Used by tests
    /// and by embedders that bring their own mirroring layer.
    pub fn with_components(
        config: PublishConfig,
        driver: Box<dyn MirrorDriver>,
        fetcher: Box<dyn BlobFetcher>,
        custom: Box<dyn CustomImageBuilder>,
    ) -> Result<Self> {
        let dest = Self::validate(&config)?;
        Ok(Self {
            config,
            dest,
            driver,
            fetcher,
            custom,
        })
    }

    /// Pre-flight validation of the configuration surface.
    fn validate(config: &PublishConfig) -> Result<ImageReference> {
        if config.from.as_os_str().is_empty() {
            return Err(MirrorError::ConfigInvalid(
                "an archive path is required".to_string(),
            ));
        }
        if config.to_mirror.is_empty() {
            return Err(MirrorError::ConfigInvalid(
                "a destination registry is required".to_string(),
            ));
        }
        let dest = TypedImageReference::parse(&config.to_mirror).map_err(|e| {
            MirrorError::ConfigInvalid(format!(
                "error parsing mirror registry {:?}: {}",
                config.to_mirror, e
            ))
        })?;
        if !dest.is_registry() || dest.reference.registry.is_empty() {
            return Err(MirrorError::ConfigInvalid(format!(
                "destination {:?} must be a registry reference",
                config.to_mirror
            )));
        }
        Ok(dest.reference)
    }

    /// Root directory for workspaces and the local metadata buffer.
    fn workspace_root(&self) -> PathBuf {
        if self.config.dir.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_WORKSPACE_DIR)
        } else {
            self.config.dir.clone()
        }
    }

    /// Reference of the metadata image for this lineage: distinct uids
    /// get distinct images.
    fn metadata_image(&self, uid: &uuid::Uuid) -> String {
        let repo = join_namespace(&[
            &self.dest.repository(),
            &self.config.user_namespace,
            METADATA_IMAGE_NAME,
        ]);
        format!("{}/{}:{}", self.dest.registry, repo, uid)
    }

    /// Target directory for Helm charts and release signatures.
    fn results_dir(&self) -> Result<PathBuf> {
        let dir = match &self.config.output_dir {
            Some(dir) => dir.clone(),
            None => PathBuf::from(format!(
                "results-{}",
                Utc::now().format("%Y-%m-%d-%H%M%S")
            )),
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Plan and run a publish of the configured archive to the configured
    /// destination. Returns the top-level source-to-destination mappings.
    pub async fn publish(&self, ctx: &CancellationToken) -> Result<TypedImageMapping> {
        tracing::info!(
            archive = %self.config.from.display(),
            registry = %self.config.to_mirror,
            "Publishing image set"
        );

        let output_dir = self.results_dir()?;
        let workspace_root = self.workspace_root();
        let workspace = WorkDir::new(&workspace_root, self.config.skip_cleanup)?;
        let tmpdir = workspace.path().to_path_buf();

        tracing::debug!(dir = %tmpdir.display(), "Unarchiving metadata");

        // Index the source archives, then eagerly materialize only the
        // metadata and small control files.
        let archive = ArchiveReader::index(&self.config.from)?;
        archive.unpack_all(
            &tmpdir,
            &[
                V2_DIR,
                BLOB_DIR,
                HELM_DIR,
                CATALOGS_DIR,
                GRAPH_DATA_DIR,
                RELEASE_SIGNATURE_DIR,
            ],
        )?;

        // Incoming metadata comes from the unpacked workspace.
        let workspace_backend = LocalDirBackend::new(&tmpdir)?;
        let incoming = workspace_backend
            .read_metadata(ctx, METADATA_BASE_PATH)
            .await
            .map_err(|e| match e {
                MirrorError::Cancelled => MirrorError::Cancelled,
                e => MirrorError::Other(format!("error reading incoming metadata: {}", e)),
            })?;

        // Stateless runs keep no metadata; stateful runs persist it at the
        // configured backend, defaulting to a registry image under the
        // destination.
        let stateless = incoming.single_use;
        let storage_cfg = if stateless {
            tracing::warn!("metadata has single-use label, using stateless mode");
            StorageConfig::Local {
                path: workspace_root.clone(),
            }
        } else if let Some(cfg) = &self.config.metadata_storage {
            cfg.clone()
        } else {
            StorageConfig::Registry {
                image_url: self.metadata_image(&incoming.uid),
                skip_tls: self.config.insecure(),
            }
        };
        let backend = by_config(&workspace_root, &storage_cfg)?;

        let result = self
            .execute(ctx, &archive, backend.as_ref(), incoming, &tmpdir, &output_dir)
            .await;

        if stateless {
            if let Err(e) = backend.cleanup(ctx, METADATA_BASE_PATH).await {
                tracing::error!(error = %e, "stateless metadata cleanup failed");
            }
        }

        result
    }

    /// The fallible middle of a run, split out so stateless cleanup runs
    /// on every exit path.
    async fn execute(
        &self,
        ctx: &CancellationToken,
        archive: &ArchiveReader,
        backend: &dyn Backend,
        incoming: Metadata,
        tmpdir: &Path,
        output_dir: &Path,
    ) -> Result<TypedImageMapping> {
        let mut all_mappings = TypedImageMapping::new();

        // Load current metadata, if any, and gate on the sequence.
        let current = match backend.read_metadata(ctx, METADATA_BASE_PATH).await {
            Ok(meta) => Some(meta),
            Err(MirrorError::MetadataNotExist) => {
                tracing::info!("No existing metadata found. Setting up new workspace");
                None
            }
            Err(e) => return Err(e),
        };
        tracing::debug!("Check metadata sequence number");
        verify_sequence(current.as_ref(), &incoming)?;

        // Helm charts go straight to the results directory.
        tracing::debug!(dir = %output_dir.display(), "Unpacking any provided Helm charts");
        archive.extract_prefix(HELM_DIR, output_dir)?;

        // Image associations drive the per-image loop.
        let mut assocs =
            setmirror_core::association::AssociationSet::from_associations(
                &incoming.past_mirror.associations,
            );
        assocs.update_path()?;

        let assembler =
            ImageAssembler::new(archive, &assocs, &self.dest, &self.config.user_namespace);
        let current_meta = current.clone().unwrap_or_default();
        let reconciler = BlobReconciler::new(
            &self.dest,
            &self.config.user_namespace,
            self.fetcher.as_ref(),
            self.config.skip_verification,
        );

        let mut errs: Vec<MirrorError> = Vec::new();
        for image_name in assocs.keys() {
            if ctx.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }

            // Each image gets its own disjoint workspace, released as the
            // loop advances.
            let image_dir = WorkDir::new(tmpdir, self.config.skip_cleanup)?;
            let assembled = assembler.assemble(&image_name, image_dir.path());
            errs.extend(assembled.errors);
            all_mappings.merge(assembled.top_level);

            if !assembled.missing_layers.is_empty() {
                // Fetch all layers and mount them at the recorded paths.
                // Only a layer with no known source aborts the run; other
                // fetch failures accumulate and the loop moves on.
                let blob_errs = reconciler
                    .fetch_blobs(ctx, &current_meta, &assembled.missing_layers)
                    .await?;
                errs.extend(blob_errs);
            }

            if !assembled.mappings.is_empty() {
                match self
                    .driver
                    .mirror(ctx, &assembled.mappings, image_dir.path())
                    .await
                {
                    Ok(()) => {}
                    Err(MirrorError::Cancelled) => return Err(MirrorError::Cancelled),
                    Err(e) => errs.push(e),
                }
            }
        }

        if let Some(agg) = MirrorError::aggregate(errs) {
            return Err(agg);
        }

        tracing::debug!("unpack release signatures");
        archive.extract_prefix(RELEASE_SIGNATURE_DIR, output_dir)?;

        let processor = CustomImageProcessor::new(archive, self.custom.as_ref());
        let custom_mappings = processor.process(ctx, tmpdir).await?;
        all_mappings.merge(custom_mappings);

        // Replace old metadata with new metadata.
        backend
            .write_metadata(ctx, &incoming, METADATA_BASE_PATH)
            .await?;

        Ok(all_mappings)
    }
}

/// Scoped workspace directory: removed on drop unless the run asked to
/// keep temp directories.
enum WorkDir {
    Guarded(TempDir),
    Kept(PathBuf),
}

impl WorkDir {
    fn new(parent: &Path, keep: bool) -> Result<Self> {
        std::fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new()
            .prefix("images.")
            .tempdir_in(parent)?;
        if keep {
            return Ok(WorkDir::Kept(dir.into_path()));
        }
        Ok(WorkDir::Guarded(dir))
    }

    fn path(&self) -> &Path {
        match self {
            WorkDir::Guarded(dir) => dir.path(),
            WorkDir::Kept(path) => path.as_path(),
        }
    }
}
