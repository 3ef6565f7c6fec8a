//! Image reference parsing.
//!
//! Parses references like `reg.example.com:5000/ns/app:v1` into structured
//! components, and wraps them with a location kind so file-backed sources
//! (`file://<path>`) and registry destinations flow through the same
//! mapping machinery.

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// Parsed image reference.
///
/// `registry` and `namespace` may be empty: archive-local names such as
/// `imgname:latest` carry neither, and acquire both when mapped onto a
/// destination.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageReference {
    /// Registry host, possibly with port (e.g. "reg.test:5000")
    pub registry: String,
    /// Repository path above the name (e.g. "ns/team")
    pub namespace: String,
    /// Final repository component (e.g. "app")
    pub name: String,
    /// Tag (e.g. "latest")
    pub tag: Option<String>,
    /// Manifest digest (e.g. "sha256:abc...")
    pub digest: Option<String>,
}

/// Where a reference points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefKind {
    /// A remote registry
    Registry,
    /// A local OCI file layout
    File,
}

/// An image reference plus its location kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedImageReference {
    pub kind: RefKind,
    pub reference: ImageReference,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `imgname` / `imgname:tag` / `imgname@sha256:...` (no registry)
    /// - `ns/imgname:tag`
    /// - `reg.test/ns/imgname:tag`
    /// - `reg.test:5000/imgname@sha256:...`
    /// - a bare registry host (`reg.test`, `localhost:5000`)
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(MirrorError::ConfigInvalid(
                "empty image reference".to_string(),
            ));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = if let Some(at_pos) = reference.rfind('@') {
            let digest_part = &reference[at_pos + 1..];
            if !digest_part.contains(':') {
                return Err(MirrorError::ConfigInvalid(format!(
                    "invalid digest in reference '{}': expected algorithm:hex",
                    reference
                )));
            }
            (&reference[..at_pos], Some(digest_part.to_string()))
        } else {
            (reference, None)
        };

        // Split tag: last colon after the last slash, unless it looks like
        // a registry port.
        let (name, tag) = match name_tag.rfind('/') {
            Some(slash_pos) => {
                let after_slash = &name_tag[slash_pos + 1..];
                match after_slash.rfind(':') {
                    Some(colon_pos) => {
                        let tag = after_slash[colon_pos + 1..].to_string();
                        (name_tag[..slash_pos + 1 + colon_pos].to_string(), Some(tag))
                    }
                    None => (name_tag.to_string(), None),
                }
            }
            None => match name_tag.rfind(':') {
                Some(colon_pos) => {
                    let after_colon = &name_tag[colon_pos + 1..];
                    if after_colon.chars().all(|c| c.is_ascii_digit()) {
                        // registry:port with no repository
                        (name_tag.to_string(), None)
                    } else {
                        (
                            name_tag[..colon_pos].to_string(),
                            Some(after_colon.to_string()),
                        )
                    }
                }
                None => (name_tag.to_string(), None),
            },
        };

        let (registry, repository) = split_registry(&name);

        let (namespace, name) = match repository.rfind('/') {
            Some(pos) => (
                repository[..pos].to_string(),
                repository[pos + 1..].to_string(),
            ),
            None => (String::new(), repository),
        };

        Ok(ImageReference {
            registry,
            namespace,
            name,
            tag,
            digest,
        })
    }

    /// Repository path below the registry: `namespace/name`.
    pub fn repository(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    /// The full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = String::new();
        if !self.registry.is_empty() {
            s.push_str(&self.registry);
            if !self.repository().is_empty() {
                s.push('/');
            }
        }
        s.push_str(&self.repository());
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

/// Decide whether the first path component names a registry host.
fn split_registry(name: &str) -> (String, String) {
    if let Some(slash_pos) = name.find('/') {
        let first = &name[..slash_pos];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (first.to_string(), name[slash_pos + 1..].to_string());
        }
        return (String::new(), name.to_string());
    }
    // A lone component that looks like a host is a bare registry.
    if name.contains('.') || name.contains(':') || name == "localhost" {
        return (name.to_string(), String::new());
    }
    (String::new(), name.to_string())
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl TypedImageReference {
    /// Parse a reference with an optional `file://` scheme.
    pub fn parse(reference: &str) -> Result<Self> {
        if let Some(path) = reference.strip_prefix("file://") {
            let reference = ImageReference::parse(path)?;
            return Ok(TypedImageReference {
                kind: RefKind::File,
                reference,
            });
        }
        Ok(TypedImageReference {
            kind: RefKind::Registry,
            reference: ImageReference::parse(reference)?,
        })
    }

    pub fn is_registry(&self) -> bool {
        self.kind == RefKind::Registry
    }
}

impl std::fmt::Display for TypedImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            RefKind::File => write!(f, "file://{}", self.reference),
            RefKind::Registry => write!(f, "{}", self.reference),
        }
    }
}

/// Join namespace path segments, skipping empty ones.
pub fn join_namespace(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_name_with_tag() {
        let r = ImageReference::parse("imgname:latest").unwrap();
        assert_eq!(r.registry, "");
        assert_eq!(r.namespace, "");
        assert_eq!(r.name, "imgname");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_local_name_with_digest() {
        let r = ImageReference::parse("imgname@sha256:d31c6ea5c50b").unwrap();
        assert_eq!(r.name, "imgname");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest, Some("sha256:d31c6ea5c50b".to_string()));
    }

    #[test]
    fn test_parse_registry_and_namespace() {
        let r = ImageReference::parse("reg.test/ns/app:v1").unwrap();
        assert_eq!(r.registry, "reg.test");
        assert_eq!(r.namespace, "ns");
        assert_eq!(r.name, "app");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("reg.test:5000/app:v1").unwrap();
        assert_eq!(r.registry, "reg.test:5000");
        assert_eq!(r.namespace, "");
        assert_eq!(r.name, "app");
    }

    #[test]
    fn test_parse_deep_namespace() {
        let r = ImageReference::parse("reg.test/org/team/app").unwrap();
        assert_eq!(r.namespace, "org/team");
        assert_eq!(r.name, "app");
        assert_eq!(r.tag, None);
    }

    #[test]
    fn test_parse_bare_registry() {
        let r = ImageReference::parse("reg.test").unwrap();
        assert_eq!(r.registry, "reg.test");
        assert_eq!(r.name, "");

        let r = ImageReference::parse("localhost:5000").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.name, "");
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse("reg.test/app:v1@sha256:abc1").unwrap();
        assert_eq!(r.tag, Some("v1".to_string()));
        assert_eq!(r.digest, Some("sha256:abc1".to_string()));
    }

    #[test]
    fn test_parse_empty_is_error() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("  ").is_err());
    }

    #[test]
    fn test_parse_invalid_digest() {
        assert!(ImageReference::parse("imgname@notadigest").is_err());
    }

    #[test]
    fn test_full_reference_roundtrip() {
        for s in [
            "imgname:latest",
            "reg.test/ns/app:v1",
            "reg.test:5000/app@sha256:abc1",
            "reg.test/org/team/app:v2@sha256:def2",
        ] {
            let r = ImageReference::parse(s).unwrap();
            assert_eq!(r.full_reference(), s);
        }
    }

    #[test]
    fn test_typed_reference_file_scheme() {
        let r = TypedImageReference::parse("file://single_manifest").unwrap();
        assert_eq!(r.kind, RefKind::File);
        assert_eq!(r.reference.name, "single_manifest");
        assert_eq!(r.to_string(), "file://single_manifest");
    }

    #[test]
    fn test_typed_reference_registry_scheme() {
        let r = TypedImageReference::parse("reg.test/ns").unwrap();
        assert!(r.is_registry());
        assert_eq!(r.reference.registry, "reg.test");
        assert_eq!(r.reference.name, "ns");
    }

    #[test]
    fn test_join_namespace() {
        assert_eq!(join_namespace(&["", "ns", ""]), "ns");
        assert_eq!(join_namespace(&["a", "b"]), "a/b");
        assert_eq!(join_namespace(&["", ""]), "");
    }

    #[test]
    fn test_display() {
        let r = ImageReference::parse("reg.test/ns/app:v1").unwrap();
        assert_eq!(format!("{}", r), "reg.test/ns/app:v1");
    }
}
