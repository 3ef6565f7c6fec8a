//! setmirror core - shared types for the image-set mirroring tool.
//!
//! This crate carries the data model shared between the archive generator
//! and the publish pipeline: the persisted metadata record, image
//! associations, reference parsing, mapping collections, configuration and
//! the common error type.

pub mod association;
pub mod config;
pub mod error;
pub mod mapping;
pub mod metadata;
pub mod reference;

// Re-export commonly used types
pub use association::{Association, AssociationSet, Associations, ImageType};
pub use config::{PublishConfig, StorageConfig};
pub use error::{MirrorError, Result};
pub use mapping::{Mapping, TypedImageMapping, TypedMappingEntry};
pub use metadata::{Metadata, MirrorRecord};
pub use reference::{ImageReference, RefKind, TypedImageReference};

/// setmirror version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
