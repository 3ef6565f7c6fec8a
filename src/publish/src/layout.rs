//! Per-image OCI layout assembly.
//!
//! For each top-level image the assembler materializes the image's portion
//! of the archive's `v2/` tree under a per-image temp directory: child
//! manifests of an index, the association's own manifest, its layer blobs
//! (recording the ones a differential archive omitted) and the tag alias
//! file. Alongside the files it produces the source/destination mappings
//! handed to the mirror driver.

use std::path::Path;

use setmirror_core::association::AssociationSet;
use setmirror_core::config::{BLOB_DIR, V2_DIR};
use setmirror_core::error::{MirrorError, Result};
use setmirror_core::mapping::{Mapping, TypedImageMapping};
use setmirror_core::reference::{join_namespace, ImageReference, RefKind, TypedImageReference};

use crate::archive::ArchiveReader;
use crate::reconcile::MissingLayers;

/// Everything the per-image pass produced for one image.
#[derive(Debug, Default)]
pub struct AssembledImage {
    /// One mapping per association in the image group
    pub mappings: Vec<Mapping>,
    /// Top-level mapping recorded for the caller
    pub top_level: TypedImageMapping,
    /// Layers the archive omitted, keyed by digest
    pub missing_layers: MissingLayers,
    /// Non-fatal per-association errors
    pub errors: Vec<MirrorError>,
}

/// Assembles per-image layouts out of the archive.
pub struct ImageAssembler<'a> {
    archive: &'a ArchiveReader,
    assocs: &'a AssociationSet,
    /// Parsed destination registry (host plus optional path prefix)
    dest: &'a ImageReference,
    user_namespace: &'a str,
}

impl<'a> ImageAssembler<'a> {
    pub fn new(
        archive: &'a ArchiveReader,
        assocs: &'a AssociationSet,
        dest: &'a ImageReference,
        user_namespace: &'a str,
    ) -> Self {
        Self {
            archive,
            assocs,
            dest,
            user_namespace,
        }
    }

    /// Materialize the layout for `image_name` under `unpack_dir`.
    pub fn assemble(&self, image_name: &str, unpack_dir: &Path) -> AssembledImage {
        let mut out = AssembledImage::default();

        let group = match self.assocs.search(image_name) {
            Some(group) => group,
            None => return out,
        };

        for assoc in group {
            tracing::debug!(assoc = %assoc.name, "reading association");
            let manifest_dir = format!("{}/{}/manifests", V2_DIR, assoc.path);

            // Ensure child manifests of an index are all unpacked. A child
            // the archive lacks must at least exist in the association
            // set; its content then comes from its own association entry.
            for manifest_digest in &assoc.manifest_digests {
                if !self.assocs.contains_key(image_name, manifest_digest) {
                    out.errors.push(MirrorError::MissingManifest {
                        image: image_name.to_string(),
                        digest: manifest_digest.clone(),
                    });
                    continue;
                }
                let entry = format!("{}/{}", manifest_dir, manifest_digest);
                if unpack_dir.join(&entry).exists() {
                    tracing::debug!(
                        digest = %manifest_digest,
                        path = %assoc.path,
                        "Child manifest already unpacked"
                    );
                    continue;
                }
                if let Err(e) = self.archive.extract(&entry, unpack_dir) {
                    out.errors.push(e);
                }
            }

            // Unpack the association's own manifest.
            let manifest_entry = format!("{}/{}", manifest_dir, assoc.id);
            if let Err(e) = self.archive.extract(&manifest_entry, unpack_dir) {
                out.errors.push(MirrorError::Other(format!(
                    "unpacking manifest for {}: {}",
                    assoc.name, e
                )));
                continue;
            }

            // Unpack layer blobs, recording the ones the archive omitted.
            let image_dir = unpack_dir.join(V2_DIR).join(&assoc.path);
            for layer_digest in &assoc.layer_digests {
                tracing::debug!(layer = %layer_digest, image = %image_name, "Found layer");
                let blob_entry = format!("{}/{}", BLOB_DIR, layer_digest);
                let blob_path = image_dir.join(BLOB_DIR).join(layer_digest);
                match self.archive.extract(&blob_entry, &image_dir) {
                    Ok(_) => {
                        tracing::debug!(blob = %layer_digest, path = %assoc.path, "Blob found");
                    }
                    Err(e) if e.is_not_found() => {
                        // The layer must already live in the destination
                        // registry from a previous publish; the reconciler
                        // fetches it back.
                        out.missing_layers
                            .entry(layer_digest.clone())
                            .or_default()
                            .push(blob_path);
                    }
                    Err(e) => {
                        out.errors.push(MirrorError::Other(format!(
                            "accessing image {} blob {}: {}",
                            image_name, layer_digest, e
                        )));
                    }
                }
            }

            // Build the mapping for this association.
            let mut source = match TypedImageReference::parse(&format!("file://{}", assoc.path)) {
                Ok(source) => source,
                Err(e) => {
                    out.errors.push(MirrorError::Other(format!(
                        "parsing source ref {}: {}",
                        assoc.path, e
                    )));
                    continue;
                }
            };

            if !assoc.tag_symlink.is_empty() {
                let tag_entry = format!("{}/{}", manifest_dir, assoc.tag_symlink);
                if let Err(e) = self.archive.extract(&tag_entry, unpack_dir) {
                    out.errors.push(MirrorError::Other(format!(
                        "unpacking tag symlink for {}: {}",
                        assoc.name, e
                    )));
                    continue;
                }
                source.reference.tag = Some(assoc.tag_symlink.clone());
            }
            source.reference.digest = Some(assoc.id.clone());

            let destination = self.destination_for(&source.reference);
            out.mappings.push(Mapping {
                name: assoc.name.clone(),
                source: source.clone(),
                destination: destination.clone(),
            });

            // Record the top-level association for the caller's mapping
            // result.
            if assoc.name == image_name {
                match TypedImageReference::parse(image_name) {
                    Ok(original) => out.top_level.add(original, destination, assoc.kind),
                    Err(e) => out.errors.push(e),
                }
            }
        }

        out
    }

    /// Destination reference for a file-backed source: same name, tag and
    /// digest, under the destination registry with the configured
    /// namespace prefixes applied.
    fn destination_for(&self, source: &ImageReference) -> TypedImageReference {
        TypedImageReference {
            kind: RefKind::Registry,
            reference: ImageReference {
                registry: self.dest.registry.clone(),
                namespace: join_namespace(&[
                    &self.dest.repository(),
                    self.user_namespace,
                    &source.namespace,
                ]),
                name: source.name.clone(),
                tag: source.tag.clone(),
                digest: source.digest.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use setmirror_core::association::{Association, ImageType};
    use std::fs::File;
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

    fn single_image_assocs() -> AssociationSet {
        AssociationSet::from_associations(&[Association {
            name: "imgname:latest".to_string(),
            path: "single_manifest".to_string(),
            id: "sha256:d31c".to_string(),
            tag_symlink: "latest".to_string(),
            kind: ImageType::Generic,
            manifest_digests: vec![],
            layer_digests: vec!["sha256:aaa1".to_string(), "sha256:aaa2".to_string()],
        }])
    }

    #[test]
    fn test_assemble_simple_image() {
        let tmp = TempDir::new().unwrap();
        let tar_path = tmp.path().join("set.tar");
        create_test_archive(
            &tar_path,
            &[
                ("v2/single_manifest/manifests/sha256:d31c", b"manifest"),
                ("v2/single_manifest/manifests/latest", b"manifest"),
                ("blobs/sha256:aaa1", b"layer-one"),
                ("blobs/sha256:aaa2", b"layer-two"),
            ],
        );

        let archive = ArchiveReader::index(&tar_path).unwrap();
        let assocs = single_image_assocs();
        let dest = ImageReference::parse("reg.test/ns").unwrap();
        let assembler = ImageAssembler::new(&archive, &assocs, &dest, "");

        let unpack_dir = tmp.path().join("img");
        let out = assembler.assemble("imgname:latest", &unpack_dir);

        assert!(out.errors.is_empty(), "{:?}", out.errors);
        assert!(out.missing_layers.is_empty());
        assert_eq!(out.mappings.len(), 1);

        // Files land in the per-image layout.
        assert!(unpack_dir
            .join("v2/single_manifest/manifests/sha256:d31c")
            .exists());
        assert!(unpack_dir
            .join("v2/single_manifest/manifests/latest")
            .exists());
        assert!(unpack_dir
            .join("v2/single_manifest/blobs/sha256:aaa1")
            .exists());
        assert!(unpack_dir
            .join("v2/single_manifest/blobs/sha256:aaa2")
            .exists());

        // Mapping formation.
        let mapping = &out.mappings[0];
        assert_eq!(mapping.source.kind, RefKind::File);
        assert_eq!(mapping.source.reference.tag, Some("latest".to_string()));
        assert_eq!(
            mapping.source.reference.digest,
            Some("sha256:d31c".to_string())
        );
        assert_eq!(
            mapping.destination.reference.full_reference(),
            "reg.test/ns/single_manifest:latest@sha256:d31c"
        );

        // Top-level mapping keyed by the original reference.
        let entry = out.top_level.get("imgname:latest").unwrap();
        assert_eq!(entry.kind, ImageType::Generic);
        assert_eq!(entry.destination.reference.registry, "reg.test");
    }

    #[test]
    fn test_assemble_records_missing_layers() {
        let tmp = TempDir::new().unwrap();
        let tar_path = tmp.path().join("set.tar");
        // Differential archive: manifest present, blobs omitted.
        create_test_archive(
            &tar_path,
            &[
                ("v2/single_manifest/manifests/sha256:d31c", b"manifest"),
                ("v2/single_manifest/manifests/latest", b"manifest"),
            ],
        );

        let archive = ArchiveReader::index(&tar_path).unwrap();
        let assocs = single_image_assocs();
        let dest = ImageReference::parse("reg.test").unwrap();
        let assembler = ImageAssembler::new(&archive, &assocs, &dest, "");

        let unpack_dir = tmp.path().join("img");
        let out = assembler.assemble("imgname:latest", &unpack_dir);

        assert!(out.errors.is_empty(), "{:?}", out.errors);
        assert_eq!(out.missing_layers.len(), 2);
        let paths = &out.missing_layers["sha256:aaa1"];
        assert_eq!(
            paths[0],
            unpack_dir.join("v2/single_manifest/blobs/sha256:aaa1")
        );
    }

    #[test]
    fn test_assemble_index_image() {
        let tmp = TempDir::new().unwrap();
        let tar_path = tmp.path().join("set.tar");
        create_test_archive(
            &tar_path,
            &[
                ("v2/index_manifest/manifests/sha256:d15a", b"index"),
                ("v2/index_manifest/manifests/latest", b"index"),
                ("v2/index_manifest/manifests/sha256:bab3", b"child-a"),
                ("v2/index_manifest/manifests/sha256:9574", b"child-b"),
                ("blobs/sha256:b538", b"layer-a"),
                ("blobs/sha256:b4b7", b"layer-b"),
            ],
        );

        let assocs = AssociationSet::from_associations(&[
            Association {
                name: "imgname:latest".to_string(),
                path: "index_manifest".to_string(),
                id: "sha256:d15a".to_string(),
                tag_symlink: "latest".to_string(),
                kind: ImageType::Generic,
                manifest_digests: vec!["sha256:bab3".to_string(), "sha256:9574".to_string()],
                layer_digests: vec![],
            },
            Association {
                name: "sha256:bab3".to_string(),
                path: "index_manifest".to_string(),
                id: "sha256:bab3".to_string(),
                layer_digests: vec!["sha256:b538".to_string()],
                ..Default::default()
            },
            Association {
                name: "sha256:9574".to_string(),
                path: "index_manifest".to_string(),
                id: "sha256:9574".to_string(),
                layer_digests: vec!["sha256:b4b7".to_string()],
                ..Default::default()
            },
        ]);

        let archive = ArchiveReader::index(&tar_path).unwrap();
        let dest = ImageReference::parse("reg.test/ns").unwrap();
        let assembler = ImageAssembler::new(&archive, &assocs, &dest, "");

        let unpack_dir = tmp.path().join("img");
        let out = assembler.assemble("imgname:latest", &unpack_dir);

        assert!(out.errors.is_empty(), "{:?}", out.errors);
        // One mapping per association, all under one temp dir.
        assert_eq!(out.mappings.len(), 3);
        assert_eq!(out.top_level.len(), 1);
        for digest in ["sha256:d15a", "sha256:bab3", "sha256:9574"] {
            assert!(unpack_dir
                .join("v2/index_manifest/manifests")
                .join(digest)
                .exists());
        }
        for digest in ["sha256:b538", "sha256:b4b7"] {
            assert!(unpack_dir
                .join("v2/index_manifest/blobs")
                .join(digest)
                .exists());
        }
    }

    #[test]
    fn test_missing_child_manifest_reported() {
        let tmp = TempDir::new().unwrap();
        let tar_path = tmp.path().join("set.tar");
        create_test_archive(
            &tar_path,
            &[
                ("v2/index_manifest/manifests/sha256:d15a", b"index"),
                ("v2/index_manifest/manifests/latest", b"index"),
            ],
        );

        // The index names a child the association set does not carry.
        let assocs = AssociationSet::from_associations(&[Association {
            name: "imgname:latest".to_string(),
            path: "index_manifest".to_string(),
            id: "sha256:d15a".to_string(),
            tag_symlink: "latest".to_string(),
            kind: ImageType::Generic,
            manifest_digests: vec!["sha256:gone".to_string()],
            layer_digests: vec![],
        }]);

        let archive = ArchiveReader::index(&tar_path).unwrap();
        let dest = ImageReference::parse("reg.test").unwrap();
        let assembler = ImageAssembler::new(&archive, &assocs, &dest, "");

        let out = assembler.assemble("imgname:latest", &tmp.path().join("img"));
        assert_eq!(out.errors.len(), 1);
        assert!(matches!(
            out.errors[0],
            MirrorError::MissingManifest { .. }
        ));
        // The index itself still maps.
        assert_eq!(out.mappings.len(), 1);
    }

    #[test]
    fn test_user_namespace_in_destination() {
        let tmp = TempDir::new().unwrap();
        let tar_path = tmp.path().join("set.tar");
        create_test_archive(
            &tar_path,
            &[
                ("v2/team/app/manifests/sha256:d31c", b"manifest"),
                ("v2/team/app/manifests/latest", b"manifest"),
            ],
        );

        let assocs = AssociationSet::from_associations(&[Association {
            name: "team/app:latest".to_string(),
            path: "team/app".to_string(),
            id: "sha256:d31c".to_string(),
            tag_symlink: "latest".to_string(),
            kind: ImageType::AdditionalImage,
            manifest_digests: vec![],
            layer_digests: vec![],
        }]);

        let archive = ArchiveReader::index(&tar_path).unwrap();
        let dest = ImageReference::parse("reg.test").unwrap();
        let assembler = ImageAssembler::new(&archive, &assocs, &dest, "mirror");

        let out = assembler.assemble("team/app:latest", &tmp.path().join("img"));
        assert!(out.errors.is_empty(), "{:?}", out.errors);
        assert_eq!(
            out.mappings[0].destination.reference.full_reference(),
            "reg.test/mirror/team/app:latest@sha256:d31c"
        );
    }
}
