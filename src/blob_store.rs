use crate::model::BlobKey;
use crate::resilience::{Classify, FailureClass};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Errors reported by blob store backends
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob {0} not found")]
    NotFound(BlobKey),

    /// The request never reached the store.
    #[error("blob store unreachable: {0}")]
    Unreachable(String),

    /// The store answered that it cannot serve the request right now.
    #[error("blob store unavailable: {0}")]
    Unavailable(String),

    /// The connection broke after the request was sent.
    #[error("blob store request interrupted: {0}")]
    Interrupted(String),

    #[error("blob store rejected the request: {0}")]
    Rejected(String),
}

impl Classify for BlobError {
    fn failure_class(&self) -> FailureClass {
        match self {
            BlobError::Unreachable(_) | BlobError::Unavailable(_) => FailureClass::Transient,
            BlobError::Interrupted(_) => FailureClass::Ambiguous,
            BlobError::NotFound(_) | BlobError::Rejected(_) => FailureClass::Permanent,
        }
    }
}

pub type BlobResult<T> = Result<T, BlobError>;

/// A stored blob as seen by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobListing {
    pub key: BlobKey,
    /// When the object was last written, if the backend reports it
    pub last_modified: Option<DateTime<Utc>>,
}

/// Content-addressed storage for immutable picture bytes.
///
/// Keys are content hashes, so writing the same key twice stores the same
/// bytes and `put` is safe to repeat.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`
    async fn put(&self, key: &BlobKey, data: Bytes) -> BlobResult<()>;

    /// Fetch the bytes stored under `key`
    async fn get(&self, key: &BlobKey) -> BlobResult<Bytes>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &BlobKey) -> BlobResult<()>;

    /// Every blob currently held by the store
    async fn list(&self) -> BlobResult<Vec<BlobListing>>;

    /// Listing entry for a single blob, `NotFound` when absent
    async fn head(&self, key: &BlobKey) -> BlobResult<BlobListing>;

    /// A time-limited URL for fetching `key` directly, when supported.
    ///
    /// Blobs are shared between pictures, so the content type to serve comes
    /// from the caller rather than from the stored object.
    async fn url_for(
        &self,
        _key: &BlobKey,
        _content_type: &str,
        _expires_in: Duration,
    ) -> BlobResult<Option<String>> {
        Ok(None)
    }
}
