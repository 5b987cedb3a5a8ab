use crate::blob_store::BlobError;
use crate::metadata_store::MetadataError;
use crate::model::{BlobKey, PictureId};
use crate::resilience::{Dependency, PolicyError};
use thiserror::Error;

/// Errors returned by picture operations
#[derive(Debug, Error)]
pub enum PictureError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("picture {0} not found")]
    NotFound(PictureId),

    #[error("version conflict on picture {id}: expected {expected}, found {}", found(.actual))]
    VersionConflict {
        id: PictureId,
        expected: u64,
        actual: Option<u64>,
    },

    /// Metadata points at a blob that is missing or does not hash to its key.
    #[error("integrity violation on picture {id}: {reason}")]
    IntegrityViolation { id: PictureId, reason: String },

    #[error("blob storage unavailable: {0}")]
    StorageUnavailable(#[source] PolicyError<BlobError>),

    /// The blob was written but its metadata was not; `orphaned` is left
    /// for the sweeper.
    #[error("failed to write metadata for picture {id} (blob {orphaned} orphaned): {source}")]
    MetadataWriteFailed {
        id: PictureId,
        orphaned: BlobKey,
        #[source]
        source: PolicyError<MetadataError>,
    },

    #[error("metadata unavailable: {0}")]
    MetadataUnavailable(#[source] PolicyError<MetadataError>),

    #[error("circuit open for {dependency}")]
    CircuitOpen { dependency: Dependency },
}

fn found(actual: &Option<u64>) -> String {
    match actual {
        Some(version) => version.to_string(),
        None => "unknown".to_string(),
    }
}

impl PictureError {
    /// Whether the same request may succeed if repeated later.
    ///
    /// A repeated create after `MetadataWriteFailed` should carry an
    /// idempotency key, since the metadata write may have landed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PictureError::StorageUnavailable(_)
                | PictureError::MetadataWriteFailed { .. }
                | PictureError::MetadataUnavailable(_)
                | PictureError::CircuitOpen { .. }
        )
    }

    /// Short label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            PictureError::InvalidInput(_) => "invalid_input",
            PictureError::NotFound(_) => "not_found",
            PictureError::VersionConflict { .. } => "version_conflict",
            PictureError::IntegrityViolation { .. } => "integrity_violation",
            PictureError::StorageUnavailable(_) => "storage_unavailable",
            PictureError::MetadataWriteFailed { .. } => "metadata_write_failed",
            PictureError::MetadataUnavailable(_) => "metadata_unavailable",
            PictureError::CircuitOpen { .. } => "circuit_open",
        }
    }
}

pub type PictureResult<T> = Result<T, PictureError>;
