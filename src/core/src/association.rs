//! Per-image bookkeeping tying a logical image name to its manifest and
//! layer digests.
//!
//! A simple image is one association. An image index is one association for
//! the index itself (carrying `manifest_digests`) plus one association per
//! child platform manifest, keyed by the child digest within the same image
//! group. Children never point back at their parent; the group is a DAG
//! represented as a flat two-level map.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// Category of a mirrored image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ImageType {
    /// Plain container image
    #[default]
    Generic,
    /// Release payload image
    Release,
    /// Operator catalog image
    OperatorCatalog,
    /// User-requested additional image
    AdditionalImage,
    /// Upgrade-graph data image
    UpgradeGraph,
}

/// Bookkeeping for one image identity inside an archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    /// Human-readable image reference (e.g. "imgname:latest"), or the
    /// child digest for a platform manifest inside an index group
    pub name: String,

    /// Image directory relative to the archive's `v2/` tree
    pub path: String,

    /// Manifest digest (`sha256:...`)
    pub id: String,

    /// Tag-named alias file pointing at the manifest, when the image was
    /// mirrored by tag
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag_symlink: String,

    /// Image category
    #[serde(rename = "type", default)]
    pub kind: ImageType,

    /// Child manifest digests; non-empty only for an image index
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifest_digests: Vec<String>,

    /// Layer digests; empty for an image index
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layer_digests: Vec<String>,
}

/// Associations for one top-level image, keyed by member name.
pub type Associations = HashMap<String, Association>;

/// Mapping from top-level image key to its association group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssociationSet(HashMap<String, Associations>);

impl AssociationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group a flat association list into a set.
    ///
    /// Top-level entries are the associations not named as a child in any
    /// other association's `manifest_digests`; each top-level entry pulls
    /// its children into its own group.
    pub fn from_associations(assocs: &[Association]) -> Self {
        let by_name: HashMap<&str, &Association> =
            assocs.iter().map(|a| (a.name.as_str(), a)).collect();

        let mut referenced: Vec<&str> = Vec::new();
        for assoc in assocs {
            for digest in &assoc.manifest_digests {
                referenced.push(digest.as_str());
            }
        }

        let mut set = AssociationSet::new();
        for assoc in assocs {
            if referenced.contains(&assoc.name.as_str()) {
                continue;
            }
            set.add(&assoc.name, assoc.clone());
            for digest in &assoc.manifest_digests {
                if let Some(child) = by_name.get(digest.as_str()) {
                    set.add(&assoc.name, (*child).clone());
                }
            }
        }
        set
    }

    /// All top-level image keys. Ordering is unspecified.
    pub fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Associations for one top-level image.
    pub fn search(&self, key: &str) -> Option<Vec<&Association>> {
        self.0.get(key).map(|group| group.values().collect())
    }

    /// True when `member` exists inside the group of `top`.
    pub fn contains_key(&self, top: &str, member: &str) -> bool {
        self.0
            .get(top)
            .map(|group| group.contains_key(member))
            .unwrap_or(false)
    }

    /// Insert an association into the group of `top`.
    pub fn add(&mut self, top: &str, assoc: Association) {
        self.0
            .entry(top.to_string())
            .or_default()
            .insert(assoc.name.clone(), assoc);
    }

    /// Merge another set into this one.
    pub fn merge(&mut self, other: AssociationSet) {
        for (top, group) in other.0 {
            let entry = self.0.entry(top).or_default();
            for (name, assoc) in group {
                entry.insert(name, assoc);
            }
        }
    }

    /// Flatten back into a single association list.
    pub fn flatten(&self) -> Vec<Association> {
        let mut out: Vec<Association> = self
            .0
            .values()
            .flat_map(|group| group.values().cloned())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out.dedup_by(|a, b| a.name == b.name);
        out
    }

    /// Normalize `path` fields for consumption: the generator may record
    /// absolute workspace paths, which are rewritten to be relative to the
    /// archive's `v2/` tree.
    pub fn update_path(&mut self) -> Result<()> {
        for group in self.0.values_mut() {
            for assoc in group.values_mut() {
                if !assoc.path.starts_with('/') {
                    continue;
                }
                let parts: Vec<&str> = assoc.path.split('/').collect();
                match parts.iter().position(|p| *p == crate::config::V2_DIR) {
                    Some(idx) => {
                        let rebased = parts[idx + 1..].join("/");
                        assoc.path = rebased;
                    }
                    None => {
                        return Err(MirrorError::Other(format!(
                            "association path {} has no {} component",
                            assoc.path,
                            crate::config::V2_DIR
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Top-level image key of the first association carrying `digest` as a
    /// layer. Keys are scanned in sorted order so the answer is stable.
    pub fn image_for_blob(&self, digest: &str) -> Option<&str> {
        let mut keys: Vec<&String> = self.0.keys().collect();
        keys.sort();
        for key in keys {
            let group = &self.0[key];
            let mut names: Vec<&String> = group.keys().collect();
            names.sort();
            for name in names {
                if group[name].layer_digests.iter().any(|l| l == digest) {
                    return Some(key.as_str());
                }
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_assoc(name: &str, id: &str, layers: &[&str]) -> Association {
        Association {
            name: name.to_string(),
            path: "single_manifest".to_string(),
            id: id.to_string(),
            tag_symlink: "latest".to_string(),
            kind: ImageType::Generic,
            manifest_digests: vec![],
            layer_digests: layers.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn index_fixture() -> Vec<Association> {
        vec![
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
                tag_symlink: String::new(),
                kind: ImageType::Generic,
                manifest_digests: vec![],
                layer_digests: vec!["sha256:b538".to_string()],
            },
            Association {
                name: "sha256:9574".to_string(),
                path: "index_manifest".to_string(),
                id: "sha256:9574".to_string(),
                tag_symlink: String::new(),
                kind: ImageType::Generic,
                manifest_digests: vec![],
                layer_digests: vec!["sha256:b4b7".to_string()],
            },
        ]
    }

    #[test]
    fn test_from_associations_single_manifest() {
        let assocs = vec![simple_assoc(
            "imgname:latest",
            "sha256:d31c",
            &["sha256:e861", "sha256:6014"],
        )];
        let set = AssociationSet::from_associations(&assocs);

        assert_eq!(set.keys(), vec!["imgname:latest".to_string()]);
        let group = set.search("imgname:latest").unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].id, "sha256:d31c");
        assert_eq!(group[0].layer_digests.len(), 2);
    }

    #[test]
    fn test_from_associations_index_manifest() {
        let set = AssociationSet::from_associations(&index_fixture());

        assert_eq!(set.keys(), vec!["imgname:latest".to_string()]);
        let group = set.search("imgname:latest").unwrap();
        assert_eq!(group.len(), 3);
        assert!(set.contains_key("imgname:latest", "sha256:bab3"));
        assert!(set.contains_key("imgname:latest", "sha256:9574"));
        assert!(set.contains_key("imgname:latest", "imgname:latest"));
        assert!(!set.contains_key("imgname:latest", "sha256:ffff"));
    }

    #[test]
    fn test_search_unknown_key() {
        let set = AssociationSet::new();
        assert!(set.search("nope").is_none());
    }

    #[test]
    fn test_image_for_blob() {
        let set = AssociationSet::from_associations(&index_fixture());
        assert_eq!(set.image_for_blob("sha256:b538"), Some("imgname:latest"));
        assert_eq!(set.image_for_blob("sha256:b4b7"), Some("imgname:latest"));
        assert_eq!(set.image_for_blob("sha256:dead"), None);
    }

    #[test]
    fn test_update_path_rewrites_absolute() {
        let mut assocs = index_fixture();
        assocs[0].path = "/tmp/images.1234/v2/index_manifest".to_string();
        let mut set = AssociationSet::from_associations(&assocs);
        set.update_path().unwrap();
        let group = set.search("imgname:latest").unwrap();
        let top = group
            .iter()
            .find(|a| a.name == "imgname:latest")
            .unwrap();
        assert_eq!(top.path, "index_manifest");
    }

    #[test]
    fn test_update_path_keeps_relative() {
        let mut set = AssociationSet::from_associations(&index_fixture());
        set.update_path().unwrap();
        let group = set.search("imgname:latest").unwrap();
        assert!(group.iter().all(|a| a.path == "index_manifest"));
    }

    #[test]
    fn test_update_path_rejects_foreign_absolute() {
        let mut assocs = index_fixture();
        assocs[0].path = "/tmp/elsewhere/index_manifest".to_string();
        let mut set = AssociationSet::from_associations(&assocs);
        assert!(set.update_path().is_err());
    }

    #[test]
    fn test_merge() {
        let mut a = AssociationSet::from_associations(&[simple_assoc(
            "one:latest",
            "sha256:aaaa",
            &["sha256:1111"],
        )]);
        let b = AssociationSet::from_associations(&[simple_assoc(
            "two:latest",
            "sha256:bbbb",
            &["sha256:2222"],
        )]);
        a.merge(b);

        let mut keys = a.keys();
        keys.sort();
        assert_eq!(keys, vec!["one:latest".to_string(), "two:latest".to_string()]);
    }

    #[test]
    fn test_flatten_roundtrip() {
        let assocs = index_fixture();
        let set = AssociationSet::from_associations(&assocs);
        let flat = set.flatten();
        assert_eq!(flat.len(), 3);
        let again = AssociationSet::from_associations(&flat);
        assert_eq!(again.keys(), set.keys());
    }

    #[test]
    fn test_association_json_field_names() {
        let assoc = simple_assoc("imgname:latest", "sha256:d31c", &["sha256:e861"]);
        let json = serde_json::to_string(&assoc).unwrap();
        assert!(json.contains("\"tagSymlink\""));
        assert!(json.contains("\"layerDigests\""));
        assert!(json.contains("\"type\":\"generic\""));
    }

    #[test]
    fn test_image_type_serialization() {
        let json = serde_json::to_string(&ImageType::OperatorCatalog).unwrap();
        assert_eq!(json, "\"operatorCatalog\"");
        let parsed: ImageType = serde_json::from_str("\"upgradeGraph\"").unwrap();
        assert_eq!(parsed, ImageType::UpgradeGraph);
    }
}
