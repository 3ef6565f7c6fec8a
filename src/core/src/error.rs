use thiserror::Error;

/// Mirror publish error types
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Invalid configuration or flag combination
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Requested entry is not present in any archive
    #[error("file {path} not found in archive")]
    ArchiveEntryNotFound { path: String },

    /// An archive could not be read as a tar stream
    #[error("corrupt archive {path}: {message}")]
    ArchiveCorrupt { path: String, message: String },

    /// No metadata exists at the backend location.
    ///
    /// Sentinel, not a failure: the coordinator branches on this to take
    /// the first-run path.
    #[error("metadata does not exist")]
    MetadataNotExist,

    /// Incoming archive is not the next increment in the mirror sequence
    #[error("invalid mirror sequence order, want {want}, got {got}")]
    SequenceMismatch { want: u32, got: u32 },

    /// Incoming metadata belongs to a different workspace lineage
    #[error("mismatched uuids, want {want}, got {got}")]
    UuidMismatch { want: uuid::Uuid, got: uuid::Uuid },

    /// An index association names a manifest the association set lacks
    #[error("image {image}: expected associations to have manifest {digest} but was not found")]
    MissingManifest { image: String, digest: String },

    /// A layer omitted from the archive has no known source image
    #[error("layer {digest} is not present in previous metadata")]
    BlobSourceUnavailable { digest: String },

    /// Registry interaction failed
    #[error("registry error for {reference}: {message}")]
    RegistryTransport { reference: String, message: String },

    /// Fetched blob content did not match its digest
    #[error("digest mismatch for blob {digest}: got {actual}")]
    DigestMismatch { digest: String, actual: String },

    /// Operation aborted by cancellation
    #[error("operation cancelled")]
    Cancelled,

    /// Per-image errors collected over a publish run
    #[error("{0} error(s) occurred during publishing: {}", .1.join("; "))]
    Aggregate(usize, Vec<String>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::Serialization(err.to_string())
    }
}

impl MirrorError {
    /// Collapse a list of accumulated per-image errors into one error.
    ///
    /// Returns `None` when the list is empty.
    pub fn aggregate(errs: Vec<MirrorError>) -> Option<MirrorError> {
        if errs.is_empty() {
            return None;
        }
        let messages: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
        Some(MirrorError::Aggregate(errs.len(), messages))
    }

    /// True when the error means "the entry is absent", as opposed to a
    /// read failure. The blob reconciler branches on this.
    pub fn is_not_found(&self) -> bool {
        match self {
            MirrorError::ArchiveEntryNotFound { .. } => true,
            MirrorError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Result type alias for mirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;
