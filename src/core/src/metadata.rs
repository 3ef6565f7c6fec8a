//! Versioned metadata record carried inside every image set archive.
//!
//! The generator writes one record per archive; the publisher validates it
//! against the previously committed record and, on success, commits the
//! incoming record as the new current state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::association::Association;

/// Persistent state tying a chain of image set archives together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Stable workspace identity. Two records with different uids belong
    /// to unrelated mirror lineages.
    pub uid: Uuid,

    /// When true the run is stateless: no metadata survives it.
    #[serde(default)]
    pub single_use: bool,

    /// The run that produced this archive.
    pub past_mirror: MirrorRecord,

    /// Cumulative associations across all prior runs. The blob reconciler
    /// uses these to locate layers omitted from a differential archive.
    #[serde(default)]
    pub past_associations: Vec<Association>,
}

/// One generating run: its position in the lineage and the images it packed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MirrorRecord {
    /// Position in the lineage. The first archive has sequence 1; each
    /// successor increments by exactly one.
    pub sequence: u32,

    /// When the generating run finished.
    pub timestamp: DateTime<Utc>,

    /// Associations for the images packed into this archive.
    #[serde(default)]
    pub associations: Vec<Association>,
}

impl Metadata {
    /// New first-run metadata with a fresh workspace identity.
    pub fn new() -> Self {
        Self {
            uid: Uuid::new_v4(),
            single_use: false,
            past_mirror: MirrorRecord {
                sequence: 1,
                timestamp: Utc::now(),
                associations: Vec::new(),
            },
            past_associations: Vec::new(),
        }
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}
