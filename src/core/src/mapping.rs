//! Source-to-destination mapping collections produced by a publish run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::association::ImageType;
use crate::reference::TypedImageReference;

/// One unit of work for the mirror driver: mirror `source` to
/// `destination` out of a local file layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    /// Association name this mapping was derived from
    pub name: String,
    /// Source reference (file-backed during publishing)
    pub source: TypedImageReference,
    /// Destination registry reference
    pub destination: TypedImageReference,
}

/// A typed source/destination pair recorded for the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedMappingEntry {
    pub source: TypedImageReference,
    pub destination: TypedImageReference,
    pub kind: ImageType,
}

/// The top-level mappings surfaced by a publish run, keyed by the original
/// source reference string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypedImageMapping(HashMap<String, TypedMappingEntry>);

impl TypedImageMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mapping. A later entry for the same source replaces the
    /// earlier one.
    pub fn add(
        &mut self,
        source: TypedImageReference,
        destination: TypedImageReference,
        kind: ImageType,
    ) {
        self.0.insert(
            source.to_string(),
            TypedMappingEntry {
                source,
                destination,
                kind,
            },
        );
    }

    /// Absorb every entry of `other`.
    pub fn merge(&mut self, other: TypedImageMapping) {
        self.0.extend(other.0);
    }

    pub fn get(&self, source: &str) -> Option<&TypedMappingEntry> {
        self.0.get(source)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TypedMappingEntry)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
