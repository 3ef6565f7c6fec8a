//! Derived-image processing after the main per-image loop.
//!
//! When the archive carries a file-based operator catalog tree or
//! upgrade-graph data, those trees are extracted and a builder turns them
//! into images at the destination. The builder is an invocation contract:
//! catalog rebuilds need tooling outside this repository, while the graph
//! image is a plain single-layer image the registry client can produce.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use setmirror_core::association::ImageType;
use setmirror_core::config::{CATALOGS_DIR, GRAPH_DATA_DIR};
use setmirror_core::error::{MirrorError, Result};
use setmirror_core::mapping::TypedImageMapping;
use setmirror_core::reference::{
    join_namespace, ImageReference, RefKind, TypedImageReference,
};

use crate::archive::ArchiveReader;
use crate::registry::RegistryClient;

/// Repository name for the upgrade-graph image at the destination.
const GRAPH_IMAGE_NAME: &str = "graph-image";

/// Builds derivative images out of extracted archive trees.
#[async_trait]
pub trait CustomImageBuilder: Send + Sync {
    /// Rebuild operator catalog images from the file-based catalogs under
    /// `dir` and return their mappings.
    async fn rebuild_catalogs(
        &self,
        ctx: &CancellationToken,
        dir: &Path,
    ) -> Result<TypedImageMapping>;

    /// Build and push the upgrade-graph image from the graph data under
    /// `dir` and return its mapping.
    async fn build_graph_image(
        &self,
        ctx: &CancellationToken,
        dir: &Path,
    ) -> Result<TypedImageMapping>;
}

/// Extracts catalog and graph trees and invokes the builder for the ones
/// present.
pub struct CustomImageProcessor<'a> {
    archive: &'a ArchiveReader,
    builder: &'a dyn CustomImageBuilder,
}

impl<'a> CustomImageProcessor<'a> {
    pub fn new(archive: &'a ArchiveReader, builder: &'a dyn CustomImageBuilder) -> Self {
        Self { archive, builder }
    }

    /// Process whichever custom-image trees the archive carries. Errors
    /// from either build abort the run.
    pub async fn process(
        &self,
        ctx: &CancellationToken,
        dir: &Path,
    ) -> Result<TypedImageMapping> {
        let mut all = TypedImageMapping::new();

        tracing::debug!("rebuilding catalog images");
        let extracted = self.archive.extract_prefix(CATALOGS_DIR, dir)?;
        if extracted > 0 {
            let refs = self
                .builder
                .rebuild_catalogs(ctx, dir)
                .await
                .map_err(|e| {
                    MirrorError::Other(format!(
                        "error rebuilding catalog images from file-based catalogs: {}",
                        e
                    ))
                })?;
            all.merge(refs);
        }

        tracing::debug!("building upgrade-graph image");
        let extracted = self.archive.extract_prefix(GRAPH_DATA_DIR, dir)?;
        if extracted > 0 {
            let refs = self
                .builder
                .build_graph_image(ctx, dir)
                .await
                .map_err(|e| {
                    MirrorError::Other(format!("error building upgrade-graph image: {}", e))
                })?;
            all.merge(refs);
        }

        Ok(all)
    }
}

/// Production builder: pushes the upgrade-graph image in-process and
/// leaves catalog rebuilds to external tooling.
pub struct GraphImageBuilder {
    client: RegistryClient,
    /// Parsed destination registry (host plus optional path prefix)
    dest: ImageReference,
    user_namespace: String,
}

impl GraphImageBuilder {
    pub fn new(client: RegistryClient, dest: ImageReference, user_namespace: String) -> Self {
        Self {
            client,
            dest,
            user_namespace,
        }
    }

    fn graph_image_reference(&self) -> ImageReference {
        ImageReference {
            registry: self.dest.registry.clone(),
            namespace: join_namespace(&[&self.dest.repository(), &self.user_namespace]),
            name: GRAPH_IMAGE_NAME.to_string(),
            tag: Some("latest".to_string()),
            digest: None,
        }
    }

    /// Collect the extracted graph tree into (relative path, contents)
    /// pairs for the image layer.
    fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::collect_files(root, &path, out)?;
            } else {
                let rel = path
                    .strip_prefix(root)
                    .map_err(|e| MirrorError::Other(e.to_string()))?
                    .to_string_lossy()
                    .replace('\\', "/");
                out.push((rel, std::fs::read(&path)?));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CustomImageBuilder for GraphImageBuilder {
    async fn rebuild_catalogs(
        &self,
        _ctx: &CancellationToken,
        _dir: &Path,
    ) -> Result<TypedImageMapping> {
        Err(MirrorError::ConfigInvalid(
            "archive contains operator catalogs, but catalog rebuilding requires \
             external catalog tooling"
                .to_string(),
        ))
    }

    async fn build_graph_image(
        &self,
        ctx: &CancellationToken,
        dir: &Path,
    ) -> Result<TypedImageMapping> {
        let graph_dir = dir.join(GRAPH_DATA_DIR);
        let mut files = Vec::new();
        Self::collect_files(dir, &graph_dir, &mut files)?;
        if files.is_empty() {
            return Err(MirrorError::Other(
                "graph data directory is empty".to_string(),
            ));
        }

        let reference = self.graph_image_reference();
        tracing::info!(image = %reference, files = files.len(), "Pushing upgrade-graph image");
        self.client.push_file_image(ctx, &reference, &files).await?;

        let destination = TypedImageReference {
            kind: RefKind::Registry,
            reference,
        };
        let source = TypedImageReference {
            kind: RefKind::File,
            reference: ImageReference {
                name: GRAPH_IMAGE_NAME.to_string(),
                tag: Some("latest".to_string()),
                ..Default::default()
            },
        };

        let mut mappings = TypedImageMapping::new();
        mappings.add(source, destination, ImageType::UpgradeGraph);
        Ok(mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn create_test_archive(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.finish().unwrap();
    }

    #[derive(Default)]
    struct RecordingBuilder {
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl CustomImageBuilder for RecordingBuilder {
        async fn rebuild_catalogs(
            &self,
            _ctx: &CancellationToken,
            dir: &Path,
        ) -> Result<TypedImageMapping> {
            assert!(dir.join(CATALOGS_DIR).exists());
            self.calls.lock().unwrap().push("catalogs");
            let mut mappings = TypedImageMapping::new();
            mappings.add(
                TypedImageReference::parse("catalog:latest").unwrap(),
                TypedImageReference::parse("reg.test/catalog:latest").unwrap(),
                ImageType::OperatorCatalog,
            );
            Ok(mappings)
        }

        async fn build_graph_image(
            &self,
            _ctx: &CancellationToken,
            dir: &Path,
        ) -> Result<TypedImageMapping> {
            assert!(dir.join(GRAPH_DATA_DIR).exists());
            self.calls.lock().unwrap().push("graph");
            let mut mappings = TypedImageMapping::new();
            mappings.add(
                TypedImageReference::parse("graph-image:latest").unwrap(),
                TypedImageReference::parse("reg.test/graph-image:latest").unwrap(),
                ImageType::UpgradeGraph,
            );
            Ok(mappings)
        }
    }

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_process_both_trees() {
        let tmp = TempDir::new().unwrap();
        let tar_path = tmp.path().join("set.tar");
        create_test_archive(
            &tar_path,
            &[
                ("catalogs/op/index.json", b"{}"),
                ("graph-data/graph.json", b"{}"),
            ],
        );

        let archive = ArchiveReader::index(&tar_path).unwrap();
        let builder = RecordingBuilder::default();
        let processor = CustomImageProcessor::new(&archive, &builder);

        let out_dir = tmp.path().join("work");
        let mappings = processor.process(&ctx(), &out_dir).await.unwrap();

        assert_eq!(mappings.len(), 2);
        let calls = builder.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["catalogs", "graph"]);
    }

    #[tokio::test]
    async fn test_process_absent_trees_is_noop() {
        let tmp = TempDir::new().unwrap();
        let tar_path = tmp.path().join("set.tar");
        create_test_archive(&tar_path, &[("blobs/sha256:abc", b"x")]);

        let archive = ArchiveReader::index(&tar_path).unwrap();
        let builder = RecordingBuilder::default();
        let processor = CustomImageProcessor::new(&archive, &builder);

        let mappings = processor.process(&ctx(), tmp.path()).await.unwrap();
        assert!(mappings.is_empty());
        assert!(builder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_builder_error_aborts() {
        struct FailingBuilder;

        #[async_trait]
        impl CustomImageBuilder for FailingBuilder {
            async fn rebuild_catalogs(
                &self,
                _ctx: &CancellationToken,
                _dir: &Path,
            ) -> Result<TypedImageMapping> {
                Err(MirrorError::Other("catalog build failed".to_string()))
            }

            async fn build_graph_image(
                &self,
                _ctx: &CancellationToken,
                _dir: &Path,
            ) -> Result<TypedImageMapping> {
                unreachable!("catalog failure aborts before the graph step")
            }
        }

        let tmp = TempDir::new().unwrap();
        let tar_path = tmp.path().join("set.tar");
        create_test_archive(&tar_path, &[("catalogs/op/index.json", b"{}")]);

        let archive = ArchiveReader::index(&tar_path).unwrap();
        let processor = CustomImageProcessor::new(&archive, &FailingBuilder);
        let err = processor.process(&ctx(), tmp.path()).await.unwrap_err();
        assert!(err.to_string().contains("catalog"));
    }

    #[test]
    fn test_graph_image_reference() {
        let client = RegistryClient::new(true, crate::registry::RegistryAuth::anonymous());
        let dest = ImageReference::parse("reg.test/ns").unwrap();
        let builder = GraphImageBuilder::new(client, dest, "user".to_string());

        let reference = builder.graph_image_reference();
        assert_eq!(
            reference.full_reference(),
            "reg.test/ns/user/graph-image:latest"
        );
    }
}
