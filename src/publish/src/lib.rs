//! setmirror publish pipeline.
//!
//! Takes an image set archive produced by the generator and publishes its
//! contents to a destination registry:
//!
//! - validates that the archive is the next increment of the mirror
//!   lineage recorded in persistent metadata,
//! - reconstructs each image's OCI layout from the archive, back-filling
//!   blobs a differential archive omitted from the destination registry,
//! - pushes every image plus derivative artifacts (catalog images, the
//!   upgrade-graph image) to the destination,
//! - commits the incoming metadata as the new current state.

pub mod archive;
pub mod credentials;
pub mod custom;
pub mod driver;
pub mod layout;
pub mod publisher;
pub mod reconcile;
pub mod registry;
pub mod sequence;
pub mod storage;

// Re-export common types
pub use archive::ArchiveReader;
pub use custom::{CustomImageBuilder, CustomImageProcessor, GraphImageBuilder};
pub use driver::{MirrorDriver, MirrorFlags, RegistryMirror};
pub use layout::{AssembledImage, ImageAssembler};
pub use publisher::Publisher;
pub use reconcile::{BlobFetcher, BlobReconciler, MissingLayers, RegistryBlobFetcher};
pub use registry::{RegistryAuth, RegistryClient};
pub use sequence::verify_sequence;
pub use storage::{by_config, Backend, LocalDirBackend, ObjectStat, RegistryBackend};

/// setmirror publish version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
