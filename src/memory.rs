//! In-process implementations of the three capabilities.
//!
//! Used by the test suites and for local wiring without S3, PostgreSQL or
//! Kafka. Each adapter yields to the scheduler before touching its state, so
//! concurrent sagas interleave the way they would against remote services.

use crate::blob_store::{BlobError, BlobListing, BlobResult, BlobStore};
use crate::events::{EventPublisher, PublishError};
use crate::metadata_store::{MetadataError, MetadataRepository, MetadataResult};
use crate::model::{BlobKey, ChangeEvent, PictureId, PictureMetadata};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

/// Blob store holding everything in a map
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<BlobKey, StoredBlob>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes with an explicit modification time
    pub fn put_at(&self, key: BlobKey, data: impl Into<Bytes>, last_modified: DateTime<Utc>) {
        self.blobs.lock().insert(
            key,
            StoredBlob {
                data: data.into(),
                last_modified,
            },
        );
    }

    pub fn contains(&self, key: &BlobKey) -> bool {
        self.blobs.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &BlobKey, data: Bytes) -> BlobResult<()> {
        tokio::task::yield_now().await;
        self.put_at(key.clone(), data, Utc::now());
        Ok(())
    }

    async fn get(&self, key: &BlobKey) -> BlobResult<Bytes> {
        tokio::task::yield_now().await;
        self.blobs
            .lock()
            .get(key)
            .map(|blob| blob.data.clone())
            .ok_or_else(|| BlobError::NotFound(key.clone()))
    }

    async fn delete(&self, key: &BlobKey) -> BlobResult<()> {
        tokio::task::yield_now().await;
        self.blobs.lock().remove(key);
        Ok(())
    }

    async fn list(&self) -> BlobResult<Vec<BlobListing>> {
        tokio::task::yield_now().await;
        let mut listings: Vec<_> = self
            .blobs
            .lock()
            .iter()
            .map(|(key, blob)| BlobListing {
                key: key.clone(),
                last_modified: Some(blob.last_modified),
            })
            .collect();
        listings.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listings)
    }

    async fn head(&self, key: &BlobKey) -> BlobResult<BlobListing> {
        tokio::task::yield_now().await;
        self.blobs
            .lock()
            .get(key)
            .map(|blob| BlobListing {
                key: key.clone(),
                last_modified: Some(blob.last_modified),
            })
            .ok_or_else(|| BlobError::NotFound(key.clone()))
    }
}

/// Metadata repository over a map; every write is atomic under one lock
#[derive(Debug, Default)]
pub struct InMemoryMetadataRepository {
    records: Mutex<HashMap<PictureId, PictureMetadata>>,
    create_delay: Mutex<Option<Duration>>,
}

impl InMemoryMetadataRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a record without going through the async interface
    pub fn get(&self, id: PictureId) -> Option<PictureMetadata> {
        self.records.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Wait this long before each `create` commits
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        *self.create_delay.lock() = delay;
    }

    fn check_version(
        records: &HashMap<PictureId, PictureMetadata>,
        id: PictureId,
        expected: u64,
    ) -> MetadataResult<()> {
        match records.get(&id) {
            None => Err(MetadataError::NotFound(id)),
            Some(current) if current.version != expected => Err(MetadataError::VersionConflict {
                id,
                expected,
                actual: current.version,
            }),
            Some(_) => Ok(()),
        }
    }
}

#[async_trait]
impl MetadataRepository for InMemoryMetadataRepository {
    async fn create(&self, record: &PictureMetadata) -> MetadataResult<()> {
        let delay = *self.create_delay.lock();
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        let mut records = self.records.lock();

        if records.contains_key(&record.id) {
            return Err(MetadataError::AlreadyExists(format!("id {}", record.id)));
        }
        if let Some(key) = &record.idempotency_key {
            if records
                .values()
                .any(|r| r.idempotency_key.as_deref() == Some(key.as_str()))
            {
                return Err(MetadataError::AlreadyExists(format!("idempotency key {}", key)));
            }
        }

        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn read(&self, id: PictureId) -> MetadataResult<PictureMetadata> {
        tokio::task::yield_now().await;
        self.get(id).ok_or(MetadataError::NotFound(id))
    }

    async fn compare_and_swap(
        &self,
        id: PictureId,
        expected_version: u64,
        record: &PictureMetadata,
    ) -> MetadataResult<()> {
        tokio::task::yield_now().await;
        let mut records = self.records.lock();
        Self::check_version(&records, id, expected_version)?;
        records.insert(id, record.clone());
        Ok(())
    }

    async fn delete(&self, id: PictureId, expected_version: u64) -> MetadataResult<()> {
        tokio::task::yield_now().await;
        let mut records = self.records.lock();
        Self::check_version(&records, id, expected_version)?;
        records.remove(&id);
        Ok(())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> MetadataResult<Option<PictureMetadata>> {
        tokio::task::yield_now().await;
        Ok(self
            .records
            .lock()
            .values()
            .find(|r| r.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn is_blob_referenced(&self, key: &BlobKey) -> MetadataResult<bool> {
        tokio::task::yield_now().await;
        Ok(self.records.lock().values().any(|r| &r.blob_key == key))
    }
}

/// Event publisher that keeps every delivered event.
///
/// Can be slowed down or switched to failing to exercise degraded paths.
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<ChangeEvent>>,
    delay: Mutex<Option<Duration>>,
    failing: Mutex<bool>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait this long before each delivery
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Refuse every delivery as if the bus were down
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, event: &ChangeEvent) -> Result<(), PublishError> {
        let delay = *self.delay.lock();
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        if *self.failing.lock() {
            return Err(PublishError::Unreachable("bus is down".to_string()));
        }

        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeKind, NewPicture, PictureBlob};

    fn record(payload: &'static [u8], idempotency_key: Option<&str>) -> PictureMetadata {
        let blob = PictureBlob::from_payload(Bytes::from_static(payload));
        let mut upload = NewPicture::new(Bytes::from_static(payload), "image/png");
        upload.idempotency_key = idempotency_key.map(String::from);
        PictureMetadata::first(PictureId::new(), &blob, &upload, Utc::now())
    }

    #[tokio::test]
    async fn test_blob_delete_twice_is_ok() {
        let store = InMemoryBlobStore::new();
        let key = BlobKey::for_payload(b"img1");

        store.put(&key, Bytes::from_static(b"img1")).await.unwrap();
        store.delete(&key).await.unwrap();
        store.delete(&key).await.unwrap();

        assert!(matches!(store.get(&key).await, Err(BlobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_put_refreshes_modification_time() {
        let store = InMemoryBlobStore::new();
        let key = BlobKey::for_payload(b"img1");
        let long_ago = Utc::now() - chrono::Duration::days(1);
        store.put_at(key.clone(), &b"img1"[..], long_ago);

        assert_eq!(store.head(&key).await.unwrap().last_modified, Some(long_ago));

        store.put(&key, Bytes::from_static(b"img1")).await.unwrap();
        let listing = store.head(&key).await.unwrap();
        assert!(listing.last_modified.unwrap() > long_ago);

        store.delete(&key).await.unwrap();
        assert!(matches!(store.head(&key).await, Err(BlobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stale_swap_leaves_record_untouched() {
        let repo = InMemoryMetadataRepository::new();
        let first = record(b"img1", None);
        repo.create(&first).await.unwrap();

        let mut second = first.clone();
        second.version = 2;
        repo.compare_and_swap(first.id, 1, &second).await.unwrap();

        let mut stale = first.clone();
        stale.version = 2;
        stale.content_type = "image/gif".to_string();
        let err = repo.compare_and_swap(first.id, 1, &stale).await.unwrap_err();

        assert!(matches!(
            err,
            MetadataError::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
        assert_eq!(repo.get(first.id).unwrap().content_type, "image/png");
    }

    #[tokio::test]
    async fn test_idempotency_key_is_unique() {
        let repo = InMemoryMetadataRepository::new();
        repo.create(&record(b"img1", Some("req-1"))).await.unwrap();

        let err = repo.create(&record(b"img2", Some("req-1"))).await.unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyExists(_)));

        let found = repo.find_by_idempotency_key("req-1").await.unwrap().unwrap();
        assert_eq!(found.blob_key, BlobKey::for_payload(b"img1"));
        assert!(repo.find_by_idempotency_key("req-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blob_reference_tracking() {
        let repo = InMemoryMetadataRepository::new();
        let first = record(b"img1", None);
        repo.create(&first).await.unwrap();

        assert!(repo.is_blob_referenced(&first.blob_key).await.unwrap());
        assert!(!repo
            .is_blob_referenced(&BlobKey::for_payload(b"img2"))
            .await
            .unwrap());

        repo.delete(first.id, 1).await.unwrap();
        assert!(!repo.is_blob_referenced(&first.blob_key).await.unwrap());
    }

    #[tokio::test]
    async fn test_recording_publisher_failure_switch() {
        let publisher = RecordingEventPublisher::new();
        let event = ChangeEvent::new(PictureId::new(), ChangeKind::Created, 1);

        publisher.set_failing(true);
        assert!(publisher.publish(&event).await.is_err());
        publisher.set_failing(false);
        publisher.publish(&event).await.unwrap();

        assert_eq!(publisher.events(), vec![event]);
    }
}
