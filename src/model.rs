use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Unique picture identifier, shared by the blob, metadata and event systems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PictureId(Uuid);

impl PictureId {
    /// Allocate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PictureId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for PictureId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for PictureId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for PictureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
#[error("invalid blob key {0:?}: expected 64 lowercase hex characters")]
pub struct InvalidBlobKey(pub String);

/// Content address of a blob: lowercase hex SHA-256 of its bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobKey(String);

impl BlobKey {
    /// Hash a payload into its content address
    pub fn for_payload(payload: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(payload)))
    }

    pub fn parse(value: impl Into<String>) -> Result<Self, InvalidBlobKey> {
        let value = value.into();
        let well_formed = value.len() == 64
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

        if well_formed {
            Ok(Self(value))
        } else {
            Err(InvalidBlobKey(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `payload` hashes to this key
    pub fn matches(&self, payload: &[u8]) -> bool {
        Self::for_payload(payload) == *self
    }
}

impl TryFrom<String> for BlobKey {
    type Error = InvalidBlobKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<BlobKey> for String {
    fn from(key: BlobKey) -> Self {
        key.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw picture bytes together with their content address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PictureBlob {
    pub key: BlobKey,
    pub data: Bytes,
}

impl PictureBlob {
    pub fn from_payload(data: Bytes) -> Self {
        Self {
            key: BlobKey::for_payload(&data),
            data,
        }
    }

    /// Recompute the hash and compare it with the stored key
    pub fn verify(&self) -> bool {
        self.key.matches(&self.data)
    }

    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

/// A picture upload as handed over by the API layer
#[derive(Debug, Clone)]
pub struct NewPicture {
    /// Encoded image bytes
    pub payload: Bytes,
    /// MIME type, e.g. `image/png`
    pub content_type: String,
    /// Name of the file as uploaded by the client
    pub original_filename: Option<String>,
    /// Client-supplied token that makes a create safe to retry
    pub idempotency_key: Option<String>,
}

impl NewPicture {
    pub fn new(payload: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            content_type: content_type.into(),
            original_filename: None,
            idempotency_key: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.original_filename = Some(filename.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Metadata record describing the blob a picture currently points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PictureMetadata {
    pub id: PictureId,
    /// Content hash of the current blob
    pub blob_key: BlobKey,
    pub content_type: String,
    pub size_bytes: u64,
    pub original_filename: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Starts at 1, incremented by exactly one on every successful update
    pub version: u64,
}

impl PictureMetadata {
    /// Record for a freshly created picture
    pub fn first(id: PictureId, blob: &PictureBlob, upload: &NewPicture, now: DateTime<Utc>) -> Self {
        Self {
            id,
            blob_key: blob.key.clone(),
            content_type: upload.content_type.clone(),
            size_bytes: blob.size_bytes(),
            original_filename: upload.original_filename.clone(),
            idempotency_key: upload.idempotency_key.clone(),
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Record that replaces this one after an update.
    ///
    /// Identity, creation time and the idempotency key carry over; the
    /// filename only changes when the update supplies one.
    pub fn next_revision(&self, blob: &PictureBlob, upload: &NewPicture, now: DateTime<Utc>) -> Self {
        Self {
            id: self.id,
            blob_key: blob.key.clone(),
            content_type: upload.content_type.clone(),
            size_bytes: blob.size_bytes(),
            original_filename: upload
                .original_filename
                .clone()
                .or_else(|| self.original_filename.clone()),
            idempotency_key: self.idempotency_key.clone(),
            created_at: self.created_at,
            updated_at: now,
            version: self.version + 1,
        }
    }
}

/// Kind of change announced on the event bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change notification for downstream consumers.
///
/// The bus only orders deliveries per key at best, so every event carries the
/// metadata version it describes. Consumers drop anything older than what
/// they have already applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_id: Uuid,
    pub picture_id: PictureId,
    #[serde(rename = "event_type")]
    pub kind: ChangeKind,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(picture_id: PictureId, kind: ChangeKind, version: u64) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            picture_id,
            kind,
            version,
            timestamp: Utc::now(),
        }
    }
}

/// Metadata plus a time-limited URL for fetching the blob directly
#[derive(Debug, Clone, Serialize)]
pub struct PictureLocation {
    pub metadata: PictureMetadata,
    pub url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Map a file extension to its image MIME type
pub fn content_type_for_filename(filename: &str) -> Option<&'static str> {
    let (_, extension) = filename.rsplit_once('.')?;
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        "gif" => Some("image/gif"),
        "svg" => Some("image/svg+xml"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}
