//! Picture lifecycle sagas.
//!
//! Every operation runs its steps in a fixed order and never rolls back a
//! committed step:
//!
//! - create: blob put, metadata create, `created` event
//! - update: blob put, metadata compare-and-swap, superseded blob release,
//!   `updated` event
//! - delete: version-checked metadata delete, blob release, `deleted` event
//!
//! The metadata write is the commit point. A failure before it leaves at most
//! an unreferenced blob, which the [`OrphanSweeper`] collects. A failure after
//! it is reported through [`Completed::event`] and never fails the operation.

use crate::blob_store::{BlobError, BlobStore};
use crate::config::{OrchestratorConfig, SweeperConfig};
use crate::error::{PictureError, PictureResult};
use crate::events::EventPublisher;
use crate::metadata_store::{MetadataError, MetadataRepository};
use crate::model::{
    content_type_for_filename, BlobKey, ChangeEvent, ChangeKind, NewPicture, PictureBlob,
    PictureId, PictureLocation, PictureMetadata,
};
use crate::resilience::{Idempotency, PolicyError, PolicySet};
use crate::sweeper::OrphanSweeper;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

/// What happened to the change event of a committed operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDelivery {
    /// The bus acknowledged the event.
    Confirmed,
    /// Publication gave up; downstream consumers will not hear of this change.
    Failed(String),
    /// Still in flight when the confirmation window closed.
    Pending,
    /// Nothing was published (replayed request).
    Skipped,
}

/// Result of a committed operation
#[derive(Debug, Clone)]
pub struct Completed<T> {
    pub value: T,
    pub event: EventDelivery,
    /// The request matched an earlier one by idempotency key and nothing new
    /// was written.
    pub replayed: bool,
}

impl<T> Completed<T> {
    fn new(value: T, event: EventDelivery) -> Self {
        Self {
            value,
            event,
            replayed: false,
        }
    }

    fn replayed(value: T) -> Self {
        Self {
            value,
            event: EventDelivery::Skipped,
            replayed: true,
        }
    }

    /// Data committed but the change event is known to be lost
    pub fn is_degraded(&self) -> bool {
        matches!(self.event, EventDelivery::Failed(_))
    }
}

/// Striped locks keyed by blob key.
///
/// Held from a blob put until the metadata referencing it commits, and from a
/// reference check until the matching blob delete, so a release in this
/// process never removes a blob that another saga is about to reference.
pub(crate) struct BlobGuards {
    stripes: Vec<Mutex<()>>,
}

impl BlobGuards {
    const STRIPES: usize = 64;

    pub(crate) fn new() -> Self {
        Self {
            stripes: (0..Self::STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub(crate) async fn lock(&self, key: &BlobKey) -> MutexGuard<'_, ()> {
        let prefix = u16::from_str_radix(&key.as_str()[..4], 16).unwrap_or(0);
        self.stripes[usize::from(prefix) % self.stripes.len()]
            .lock()
            .await
    }
}

/// Outcome of releasing a blob that may no longer be referenced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    Deleted,
    Referenced,
    /// Written within the grace period or of unknown age; kept.
    Young,
    Failed,
}

/// Delete `key` unless some metadata record still points at it or it was
/// written within `grace`.
///
/// The striped guard only orders sagas of this process. A saga on another
/// instance may have put the same blob and not yet committed its metadata,
/// and that put refreshes the blob's modification time, so recently written
/// blobs are left for the sweeper. The age is read after the reference check
/// to keep the window before the delete as short as possible.
pub(crate) async fn release_unreferenced(
    blobs: &dyn BlobStore,
    metadata: &dyn MetadataRepository,
    policies: &PolicySet,
    guards: &BlobGuards,
    key: &BlobKey,
    grace: Duration,
) -> Release {
    let _guard = guards.lock(key).await;

    let referenced = policies
        .metadata
        .execute("is_blob_referenced", Idempotency::Idempotent, || {
            metadata.is_blob_referenced(key)
        })
        .await;

    match referenced {
        Ok(true) => return Release::Referenced,
        Ok(false) => {}
        Err(e) => {
            warn!(blob_key = %key, error = %e, "Could not check blob references, keeping blob");
            return Release::Failed;
        }
    }

    let listing = match policies
        .blob_store
        .execute("head", Idempotency::Idempotent, || blobs.head(key))
        .await
    {
        Ok(listing) => listing,
        Err(PolicyError::Rejected {
            source: BlobError::NotFound(_),
            ..
        }) => {
            debug!(blob_key = %key, "Blob already gone");
            return Release::Deleted;
        }
        Err(e) => {
            warn!(blob_key = %key, error = %e, "Could not read blob age, keeping blob");
            return Release::Failed;
        }
    };

    let old_enough = listing
        .last_modified
        .and_then(|modified| (Utc::now() - modified).to_std().ok())
        .map(|age| age >= grace)
        .unwrap_or(false);
    if !old_enough {
        debug!(blob_key = %key, "Blob written recently, leaving it for the sweeper");
        return Release::Young;
    }

    match policies
        .blob_store
        .execute("delete", Idempotency::Idempotent, || blobs.delete(key))
        .await
    {
        Ok(()) => {
            debug!(blob_key = %key, "Released unreferenced blob");
            Release::Deleted
        }
        Err(e) => {
            warn!(blob_key = %key, error = %e, "Failed to delete unreferenced blob");
            Release::Failed
        }
    }
}

fn blob_failure(err: PolicyError<BlobError>) -> PictureError {
    match err {
        PolicyError::CircuitOpen { dependency } => PictureError::CircuitOpen { dependency },
        other => PictureError::StorageUnavailable(other),
    }
}

fn metadata_failure(id: PictureId, err: PolicyError<MetadataError>) -> PictureError {
    match err {
        PolicyError::CircuitOpen { dependency } => PictureError::CircuitOpen { dependency },
        PolicyError::Rejected {
            source: MetadataError::NotFound(_),
            ..
        } => PictureError::NotFound(id),
        PolicyError::Rejected {
            source: MetadataError::VersionConflict {
                expected, actual, ..
            },
            ..
        } => PictureError::VersionConflict {
            id,
            expected,
            actual: Some(actual),
        },
        other => PictureError::MetadataUnavailable(other),
    }
}

/// Like [`metadata_failure`], for writes that follow a blob put
fn write_failure(id: PictureId, orphaned: &BlobKey, err: PolicyError<MetadataError>) -> PictureError {
    match metadata_failure(id, err) {
        PictureError::MetadataUnavailable(source) => {
            warn!(
                picture_id = %id,
                blob_key = %orphaned,
                error = %source,
                "Metadata write failed after blob write, blob left for the sweeper"
            );
            PictureError::MetadataWriteFailed {
                id,
                orphaned: orphaned.clone(),
                source,
            }
        }
        other => other,
    }
}

/// Coordinates the blob store, the metadata repository and the event bus
pub struct PictureOrchestrator {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataRepository>,
    events: Arc<dyn EventPublisher>,
    policies: PolicySet,
    guards: Arc<BlobGuards>,
    config: OrchestratorConfig,
}

impl PictureOrchestrator {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataRepository>,
        events: Arc<dyn EventPublisher>,
        policies: PolicySet,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            blobs,
            metadata,
            events,
            policies,
            guards: Arc::new(BlobGuards::new()),
            config,
        }
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    /// Orphan sweeper sharing this orchestrator's adapters, policies and
    /// blob locks
    pub fn sweeper(&self, config: SweeperConfig) -> OrphanSweeper {
        OrphanSweeper::new(
            Arc::clone(&self.blobs),
            Arc::clone(&self.metadata),
            self.policies.clone(),
            Arc::clone(&self.guards),
            config,
        )
    }

    /// Check an upload before any dependency is touched.
    ///
    /// Returns the upload with its content type normalized, or inferred from
    /// the filename extension when none was given.
    pub fn validate(&self, mut upload: NewPicture) -> PictureResult<NewPicture> {
        if upload.payload.is_empty() {
            return Err(PictureError::InvalidInput("payload is empty".to_string()));
        }
        if upload.payload.len() > self.config.max_payload_bytes {
            return Err(PictureError::InvalidInput(format!(
                "payload of {} bytes exceeds the {} byte limit",
                upload.payload.len(),
                self.config.max_payload_bytes
            )));
        }

        let given = upload.content_type.trim();
        let content_type = if given.is_empty() {
            upload
                .original_filename
                .as_deref()
                .and_then(content_type_for_filename)
                .ok_or_else(|| PictureError::InvalidInput("content type is missing".to_string()))?
                .to_string()
        } else {
            given.to_ascii_lowercase()
        };

        let well_formed = match content_type.split_once('/') {
            Some((kind, subtype)) => {
                !kind.is_empty()
                    && !subtype.is_empty()
                    && !subtype.contains('/')
                    && !content_type.contains(char::is_whitespace)
            }
            None => false,
        };
        if !well_formed {
            return Err(PictureError::InvalidInput(format!(
                "malformed content type {:?}",
                content_type
            )));
        }

        if let Some(key) = &upload.idempotency_key {
            if key.trim().is_empty() {
                return Err(PictureError::InvalidInput(
                    "idempotency key is blank".to_string(),
                ));
            }
        }

        upload.content_type = content_type;
        Ok(upload)
    }

    /// Store a new picture
    #[instrument(skip(self, upload), fields(size_bytes = upload.payload.len()))]
    pub async fn create(&self, upload: NewPicture) -> PictureResult<Completed<PictureMetadata>> {
        let upload = self.validate(upload)?;

        if let Some(key) = upload.idempotency_key.as_deref() {
            if let Some(existing) = self.replay(key, &upload).await? {
                return Ok(Completed::replayed(existing));
            }
        }

        let blob = PictureBlob::from_payload(upload.payload.clone());
        let record = PictureMetadata::first(PictureId::new(), &blob, &upload, Utc::now());

        let guard = self.guards.lock(&blob.key).await;
        self.store_blob(&blob).await?;

        let created = self
            .policies
            .metadata
            .execute("create", Idempotency::NonIdempotent, || {
                self.metadata.create(&record)
            })
            .await;
        drop(guard);

        if let Err(err) = created {
            let lost_race = matches!(err.rejection(), Some(MetadataError::AlreadyExists(_)));
            if let (true, Some(key)) = (lost_race, upload.idempotency_key.as_deref()) {
                if let Some(existing) = self.replay(key, &upload).await? {
                    return Ok(Completed::replayed(existing));
                }
            }
            return Err(write_failure(record.id, &blob.key, err));
        }

        info!(picture_id = %record.id, blob_key = %record.blob_key, "Picture created");
        metrics::counter!("picture.created").increment(1);

        let event = self
            .announce(ChangeEvent::new(record.id, ChangeKind::Created, record.version))
            .await;
        Ok(Completed::new(record, event))
    }

    /// Fetch a picture's bytes together with its metadata
    #[instrument(skip(self), fields(picture_id = %id))]
    pub async fn read(&self, id: PictureId) -> PictureResult<(PictureBlob, PictureMetadata)> {
        let mut record = self.load(id).await?;
        let mut rechecked = false;

        loop {
            let fetched = self
                .policies
                .blob_store
                .execute("get", Idempotency::Idempotent, || {
                    self.blobs.get(&record.blob_key)
                })
                .await;

            match fetched {
                Ok(data) => {
                    let blob = PictureBlob {
                        key: record.blob_key.clone(),
                        data,
                    };
                    if !blob.verify() {
                        return Err(PictureError::IntegrityViolation {
                            id,
                            reason: format!("blob {} does not match its content hash", blob.key),
                        });
                    }
                    return Ok((blob, record));
                }
                Err(PolicyError::Rejected {
                    source: BlobError::NotFound(key),
                    ..
                }) => {
                    // an update may have swapped and released the blob meanwhile
                    if !rechecked {
                        rechecked = true;
                        let latest = self.load(id).await?;
                        if latest.blob_key != record.blob_key {
                            record = latest;
                            continue;
                        }
                    }
                    return Err(PictureError::IntegrityViolation {
                        id,
                        reason: format!("blob {} is missing", key),
                    });
                }
                Err(e) => return Err(blob_failure(e)),
            }
        }
    }

    /// Replace a picture's bytes if its current version is `expected_version`
    #[instrument(skip(self, upload), fields(picture_id = %id))]
    pub async fn update(
        &self,
        id: PictureId,
        upload: NewPicture,
        expected_version: u64,
    ) -> PictureResult<Completed<PictureMetadata>> {
        let upload = self.validate(upload)?;

        let current = self.load(id).await?;
        if current.version != expected_version {
            return Err(PictureError::VersionConflict {
                id,
                expected: expected_version,
                actual: Some(current.version),
            });
        }

        let blob = PictureBlob::from_payload(upload.payload.clone());
        let next = current.next_revision(&blob, &upload, Utc::now());

        let guard = self.guards.lock(&blob.key).await;
        self.store_blob(&blob).await?;

        let swapped = self
            .policies
            .metadata
            .execute("compare_and_swap", Idempotency::NonIdempotent, || {
                self.metadata.compare_and_swap(id, expected_version, &next)
            })
            .await;
        drop(guard);
        swapped.map_err(|e| write_failure(id, &blob.key, e))?;

        if current.blob_key != next.blob_key {
            release_unreferenced(
                self.blobs.as_ref(),
                self.metadata.as_ref(),
                &self.policies,
                &self.guards,
                &current.blob_key,
                self.config.release_grace_period(),
            )
            .await;
        }

        info!(version = next.version, blob_key = %next.blob_key, "Picture updated");
        metrics::counter!("picture.updated").increment(1);

        let event = self
            .announce(ChangeEvent::new(id, ChangeKind::Updated, next.version))
            .await;
        Ok(Completed::new(next, event))
    }

    /// Remove a picture if its current version is `expected_version`
    #[instrument(skip(self), fields(picture_id = %id))]
    pub async fn delete(&self, id: PictureId, expected_version: u64) -> PictureResult<Completed<()>> {
        let current = self.load(id).await?;
        if current.version != expected_version {
            return Err(PictureError::VersionConflict {
                id,
                expected: expected_version,
                actual: Some(current.version),
            });
        }

        self.policies
            .metadata
            .execute("delete", Idempotency::NonIdempotent, || {
                self.metadata.delete(id, expected_version)
            })
            .await
            .map_err(|e| metadata_failure(id, e))?;

        release_unreferenced(
            self.blobs.as_ref(),
            self.metadata.as_ref(),
            &self.policies,
            &self.guards,
            &current.blob_key,
            self.config.release_grace_period(),
        )
        .await;

        info!("Picture deleted");
        metrics::counter!("picture.deleted").increment(1);

        let event = self
            .announce(ChangeEvent::new(id, ChangeKind::Deleted, expected_version + 1))
            .await;
        Ok(Completed::new((), event))
    }

    /// Metadata plus a time-limited download URL, when the blob store can
    /// issue one. `expires_in` defaults to the configured presigned URL expiry.
    #[instrument(skip(self), fields(picture_id = %id))]
    pub async fn locate(
        &self,
        id: PictureId,
        expires_in: Option<Duration>,
    ) -> PictureResult<PictureLocation> {
        let metadata = self.load(id).await?;
        let expires_in = expires_in.unwrap_or_else(|| self.config.presigned_url_expiry());

        let url = self
            .policies
            .blob_store
            .execute("url_for", Idempotency::Idempotent, || {
                self.blobs
                    .url_for(&metadata.blob_key, &metadata.content_type, expires_in)
            })
            .await
            .map_err(blob_failure)?;

        let expires_at = url
            .as_ref()
            .and_then(|_| chrono::Duration::from_std(expires_in).ok())
            .map(|ttl| Utc::now() + ttl);

        Ok(PictureLocation {
            metadata,
            url,
            expires_at,
        })
    }

    async fn load(&self, id: PictureId) -> PictureResult<PictureMetadata> {
        self.policies
            .metadata
            .execute("read", Idempotency::Idempotent, || self.metadata.read(id))
            .await
            .map_err(|e| metadata_failure(id, e))
    }

    async fn store_blob(&self, blob: &PictureBlob) -> PictureResult<()> {
        self.policies
            .blob_store
            .execute("put", Idempotency::Idempotent, || {
                self.blobs.put(&blob.key, blob.data.clone())
            })
            .await
            .map_err(blob_failure)
    }

    /// Record created earlier under the same idempotency key
    async fn replay(&self, key: &str, upload: &NewPicture) -> PictureResult<Option<PictureMetadata>> {
        let existing = self
            .policies
            .metadata
            .execute("find_by_idempotency_key", Idempotency::Idempotent, || {
                self.metadata.find_by_idempotency_key(key)
            })
            .await
            .map_err(|e| match e {
                PolicyError::CircuitOpen { dependency } => PictureError::CircuitOpen { dependency },
                other => PictureError::MetadataUnavailable(other),
            })?;

        match existing {
            // later updates legitimately change the blob, so only the first
            // revision can be compared with the replayed payload
            Some(record) if record.version == 1 && !record.blob_key.matches(&upload.payload) => {
                Err(PictureError::InvalidInput(format!(
                    "idempotency key {:?} was already used for a different payload",
                    key
                )))
            }
            Some(record) => {
                debug!(picture_id = %record.id, "Replaying create for known idempotency key");
                metrics::counter!("picture.replayed").increment(1);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Publish `event` in the background and wait a bounded time for the
    /// outcome
    async fn announce(&self, event: ChangeEvent) -> EventDelivery {
        let publisher = Arc::clone(&self.events);
        let policy = Arc::clone(&self.policies.events);
        let picture_id = event.picture_id;
        let kind = event.kind;

        let handle = tokio::spawn(async move {
            let result = policy
                .execute("publish", Idempotency::Idempotent, || publisher.publish(&event))
                .await;

            match &result {
                Ok(()) => debug!(%picture_id, %kind, version = event.version, "Change event published"),
                Err(e) => {
                    warn!(%picture_id, %kind, version = event.version, error = %e, "Change event lost");
                    metrics::counter!("picture.events.failed", "kind" => kind.as_str()).increment(1);
                }
            }

            result.map_err(|e| e.to_string())
        });

        match tokio::time::timeout(self.config.event_confirm_timeout(), handle).await {
            Ok(Ok(Ok(()))) => EventDelivery::Confirmed,
            Ok(Ok(Err(reason))) => EventDelivery::Failed(reason),
            Ok(Err(join_error)) => EventDelivery::Failed(join_error.to_string()),
            Err(_) => {
                debug!(%picture_id, %kind, "Change event still in flight");
                EventDelivery::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobListing, MockBlobStore};
    use crate::config::{CircuitBreakerConfig, DependencyPolicyConfig, ResilienceConfig, RetryConfig};
    use crate::memory::{InMemoryBlobStore, InMemoryMetadataRepository, RecordingEventPublisher};
    use crate::metadata_store::MockMetadataRepository;
    use crate::resilience::Dependency;
    use bytes::Bytes;
    use mockall::Sequence;
    use tokio_test::{assert_err, assert_ok};

    fn quick_policy() -> DependencyPolicyConfig {
        DependencyPolicyConfig {
            retry: RetryConfig {
                max_attempts: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                multiplier: 2.0,
                jitter: 0.0,
                attempt_timeout_ms: 1_000,
            },
            circuit_breaker: CircuitBreakerConfig {
                window_size: 10,
                window_secs: 60,
                minimum_calls: 10,
                failure_ratio: 1.0,
                cooldown_ms: 1_000,
            },
        }
    }

    fn policies() -> PolicySet {
        PolicySet::from_config(&ResilienceConfig {
            blob_store: quick_policy(),
            metadata: quick_policy(),
            events: quick_policy(),
        })
    }

    fn png(payload: &'static [u8]) -> NewPicture {
        NewPicture::new(Bytes::from_static(payload), "image/png")
    }

    struct Harness {
        orchestrator: PictureOrchestrator,
        blobs: Arc<InMemoryBlobStore>,
        metadata: Arc<InMemoryMetadataRepository>,
        events: Arc<RecordingEventPublisher>,
    }

    /// Releases blobs as soon as they are unreferenced
    fn eager_release() -> OrchestratorConfig {
        OrchestratorConfig {
            release_grace_period_secs: 0,
            ..OrchestratorConfig::default()
        }
    }

    fn aged(key: &BlobKey) -> BlobListing {
        BlobListing {
            key: key.clone(),
            last_modified: Some(Utc::now() - chrono::Duration::days(1)),
        }
    }

    fn harness() -> Harness {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let metadata = Arc::new(InMemoryMetadataRepository::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let orchestrator = PictureOrchestrator::new(
            blobs.clone(),
            metadata.clone(),
            events.clone(),
            policies(),
            eager_release(),
        );

        Harness {
            orchestrator,
            blobs,
            metadata,
            events,
        }
    }

    #[tokio::test]
    async fn test_create_update_delete_scenario() {
        let h = harness();

        let created = assert_ok!(h.orchestrator.create(png(b"img1")).await);
        let id = created.value.id;
        assert_eq!(created.value.version, 1);
        assert_eq!(created.value.blob_key, BlobKey::for_payload(b"img1"));
        assert_eq!(created.event, EventDelivery::Confirmed);
        assert!(!created.replayed);

        let updated = assert_ok!(h.orchestrator.update(id, png(b"img2"), 1).await);
        assert_eq!(updated.value.version, 2);
        assert_eq!(updated.value.blob_key, BlobKey::for_payload(b"img2"));

        let (blob, record) = assert_ok!(h.orchestrator.read(id).await);
        assert_eq!(blob.data, Bytes::from_static(b"img2"));
        assert_eq!(record.version, 2);

        assert_ok!(h.orchestrator.delete(id, 2).await);
        let err = assert_err!(h.orchestrator.read(id).await);
        assert!(matches!(err, PictureError::NotFound(missing) if missing == id));

        let published: Vec<_> = h
            .events
            .events()
            .into_iter()
            .map(|e| (e.kind, e.version))
            .collect();
        assert_eq!(
            published,
            vec![
                (ChangeKind::Created, 1),
                (ChangeKind::Updated, 2),
                (ChangeKind::Deleted, 3)
            ]
        );
    }

    #[tokio::test]
    async fn test_read_returns_blob_matching_its_key() {
        let h = harness();
        let created = assert_ok!(h.orchestrator.create(png(b"img1")).await);

        let (blob, record) = assert_ok!(h.orchestrator.read(created.value.id).await);

        assert!(blob.verify());
        assert_eq!(blob.key, record.blob_key);
    }

    #[tokio::test]
    async fn test_update_releases_superseded_blob() {
        let h = harness();
        let created = assert_ok!(h.orchestrator.create(png(b"img1")).await);
        let id = created.value.id;

        assert_ok!(h.orchestrator.update(id, png(b"img2"), 1).await);
        assert!(!h.blobs.contains(&BlobKey::for_payload(b"img1")));
        assert!(h.blobs.contains(&BlobKey::for_payload(b"img2")));

        assert_ok!(h.orchestrator.delete(id, 2).await);
        assert!(h.blobs.is_empty());
        assert!(h.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_shared_blob_survives_delete() {
        let h = harness();
        let first = assert_ok!(h.orchestrator.create(png(b"same")).await);
        let second = assert_ok!(h.orchestrator.create(png(b"same")).await);
        assert_eq!(first.value.blob_key, second.value.blob_key);
        assert_ne!(first.value.id, second.value.id);

        assert_ok!(h.orchestrator.delete(first.value.id, 1).await);

        assert!(h.blobs.contains(&second.value.blob_key));
        assert_ok!(h.orchestrator.read(second.value.id).await);
    }

    #[tokio::test]
    async fn test_update_with_same_bytes_bumps_version() {
        let h = harness();
        let created = assert_ok!(h.orchestrator.create(png(b"img1")).await);

        let updated = assert_ok!(h.orchestrator.update(created.value.id, png(b"img1"), 1).await);

        assert_eq!(updated.value.version, 2);
        assert!(h.blobs.contains(&created.value.blob_key));
    }

    #[tokio::test]
    async fn test_concurrent_updates_have_one_winner() {
        let h = harness();
        let created = assert_ok!(h.orchestrator.create(png(b"img1")).await);
        let id = created.value.id;

        let (a, b) = tokio::join!(
            h.orchestrator.update(id, png(b"img-a"), 1),
            h.orchestrator.update(id, png(b"img-b"), 1)
        );

        let (winner, loser) = match (a, b) {
            (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
            (a, b) => panic!("expected exactly one winner, got {:?} and {:?}", a.is_ok(), b.is_ok()),
        };
        assert_eq!(winner.value.version, 2);
        assert!(matches!(
            loser,
            PictureError::VersionConflict { expected: 1, .. }
        ));

        let stored = h.metadata.get(id).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.blob_key, winner.value.blob_key);
    }

    #[tokio::test]
    async fn test_stale_update_changes_nothing() {
        let h = harness();
        let created = assert_ok!(h.orchestrator.create(png(b"img1")).await);
        let id = created.value.id;
        assert_ok!(h.orchestrator.update(id, png(b"img2"), 1).await);

        let err = assert_err!(h.orchestrator.update(id, png(b"img3"), 1).await);

        assert!(matches!(
            err,
            PictureError::VersionConflict {
                expected: 1,
                actual: Some(2),
                ..
            }
        ));
        let stored = h.metadata.get(id).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.blob_key, BlobKey::for_payload(b"img2"));
        // conflict detected before any blob write
        assert!(!h.blobs.contains(&BlobKey::for_payload(b"img3")));
    }

    #[tokio::test]
    async fn test_delete_with_stale_version_conflicts() {
        let h = harness();
        let created = assert_ok!(h.orchestrator.create(png(b"img1")).await);

        let err = assert_err!(h.orchestrator.delete(created.value.id, 7).await);

        assert!(matches!(
            err,
            PictureError::VersionConflict {
                expected: 7,
                actual: Some(1),
                ..
            }
        ));
        assert_eq!(h.metadata.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_picture_is_not_found() {
        let h = harness();
        let id = PictureId::new();

        assert!(matches!(
            h.orchestrator.read(id).await,
            Err(PictureError::NotFound(_))
        ));
        assert!(matches!(
            h.orchestrator.update(id, png(b"img1"), 1).await,
            Err(PictureError::NotFound(_))
        ));
        assert!(matches!(
            h.orchestrator.delete(id, 1).await,
            Err(PictureError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_tampered_blob_is_integrity_violation() {
        let h = harness();
        let created = assert_ok!(h.orchestrator.create(png(b"img1")).await);
        h.blobs
            .put_at(created.value.blob_key.clone(), &b"tampered"[..], Utc::now());

        let err = assert_err!(h.orchestrator.read(created.value.id).await);
        assert!(matches!(err, PictureError::IntegrityViolation { .. }));
    }

    #[tokio::test]
    async fn test_missing_blob_is_integrity_violation() {
        let h = harness();
        let created = assert_ok!(h.orchestrator.create(png(b"img1")).await);
        h.blobs.delete(&created.value.blob_key).await.unwrap();

        let err = assert_err!(h.orchestrator.read(created.value.id).await);
        assert!(matches!(err, PictureError::IntegrityViolation { .. }));
    }

    #[tokio::test]
    async fn test_read_follows_concurrent_update() {
        let v1 = {
            let upload = png(b"img1");
            let blob = PictureBlob::from_payload(upload.payload.clone());
            PictureMetadata::first(PictureId::new(), &blob, &upload, Utc::now())
        };
        let v2 = {
            let upload = png(b"img2");
            let blob = PictureBlob::from_payload(upload.payload.clone());
            v1.next_revision(&blob, &upload, Utc::now())
        };

        let mut metadata = MockMetadataRepository::new();
        let mut seq = Sequence::new();
        let first = v1.clone();
        metadata
            .expect_read()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(move |_| Ok(first));
        let second = v2.clone();
        metadata
            .expect_read()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(move |_| Ok(second));

        // only the new blob exists: the old one was released mid-read
        let blobs = Arc::new(InMemoryBlobStore::new());
        blobs.put_at(v2.blob_key.clone(), &b"img2"[..], Utc::now());

        let orchestrator = PictureOrchestrator::new(
            blobs,
            Arc::new(metadata),
            Arc::new(RecordingEventPublisher::new()),
            policies(),
            OrchestratorConfig::default(),
        );

        let (blob, record) = assert_ok!(orchestrator.read(v1.id).await);
        assert_eq!(record.version, 2);
        assert_eq!(blob.data, Bytes::from_static(b"img2"));
    }

    #[tokio::test]
    async fn test_metadata_failure_after_blob_write_leaves_orphan() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let mut metadata = MockMetadataRepository::new();
        metadata
            .expect_create()
            .times(1)
            .returning(|_| Err(MetadataError::Interrupted("connection reset".into())));
        metadata
            .expect_is_blob_referenced()
            .returning(|_| Ok(false));

        let orchestrator = PictureOrchestrator::new(
            blobs.clone(),
            Arc::new(metadata),
            Arc::new(RecordingEventPublisher::new()),
            policies(),
            OrchestratorConfig::default(),
        );

        let err = assert_err!(orchestrator.create(png(b"img1")).await);
        match err {
            PictureError::MetadataWriteFailed { orphaned, .. } => {
                assert_eq!(orphaned, BlobKey::for_payload(b"img1"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(blobs.contains(&BlobKey::for_payload(b"img1")));

        let sweeper = orchestrator.sweeper(SweeperConfig {
            enabled: true,
            interval_secs: 60,
            grace_period_secs: 0,
        });
        let report = assert_ok!(sweeper.sweep_once().await);
        assert_eq!(report.deleted, 1);
        assert!(blobs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_bus_failure_is_degraded_success() {
        let h = harness();
        h.events.set_failing(true);

        let created = assert_ok!(h.orchestrator.create(png(b"img1")).await);

        assert!(created.is_degraded());
        assert!(matches!(created.event, EventDelivery::Failed(_)));
        assert!(h.metadata.get(created.value.id).is_some());
        assert!(h.events.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_event_bus_does_not_stall_operation() {
        let h = harness();
        h.events.set_delay(Some(Duration::from_millis(500)));

        let created = assert_ok!(h.orchestrator.create(png(b"img1")).await);
        assert_eq!(created.event, EventDelivery::Pending);
        assert!(h.events.events().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let published = h.events.events();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].picture_id, created.value.id);
    }

    #[tokio::test]
    async fn test_idempotent_create_writes_blob_once() {
        let mut blobs = MockBlobStore::new();
        blobs.expect_put().times(1).returning(|_, _| Ok(()));
        let metadata = Arc::new(InMemoryMetadataRepository::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let orchestrator = PictureOrchestrator::new(
            Arc::new(blobs),
            metadata.clone(),
            events.clone(),
            policies(),
            OrchestratorConfig::default(),
        );

        let first = assert_ok!(
            orchestrator
                .create(png(b"img1").with_idempotency_key("req-1"))
                .await
        );
        let again = assert_ok!(
            orchestrator
                .create(png(b"img1").with_idempotency_key("req-1"))
                .await
        );

        assert!(again.replayed);
        assert_eq!(again.event, EventDelivery::Skipped);
        assert_eq!(again.value, first.value);
        assert_eq!(metadata.len(), 1);
        assert_eq!(events.events().len(), 1);

        let err = assert_err!(
            orchestrator
                .create(png(b"other").with_idempotency_key("req-1"))
                .await
        );
        assert!(matches!(err, PictureError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_invalid_uploads_touch_nothing() {
        let blobs = MockBlobStore::new();
        let metadata = MockMetadataRepository::new();
        let orchestrator = PictureOrchestrator::new(
            Arc::new(blobs),
            Arc::new(metadata),
            Arc::new(RecordingEventPublisher::new()),
            policies(),
            OrchestratorConfig {
                max_payload_bytes: 8,
                ..OrchestratorConfig::default()
            },
        );

        for upload in [
            NewPicture::new(Bytes::new(), "image/png"),
            NewPicture::new(&b"img1"[..], "   "),
            NewPicture::new(&b"img1"[..], "png"),
            NewPicture::new(&b"img1"[..], "image/ png"),
            NewPicture::new(&b"way too large"[..], "image/png"),
            png(b"img1").with_idempotency_key(" "),
        ] {
            let err = assert_err!(orchestrator.create(upload).await);
            assert!(matches!(err, PictureError::InvalidInput(_)), "{}", err);
        }
    }

    #[test]
    fn test_validate_infers_content_type_from_filename() {
        let h = harness();

        let upload = NewPicture::new(&b"img1"[..], "").with_filename("holiday.JPG");
        assert_eq!(
            h.orchestrator.validate(upload).unwrap().content_type,
            "image/jpeg"
        );

        let upload = NewPicture::new(&b"img1"[..], " Image/PNG ");
        assert_eq!(h.orchestrator.validate(upload).unwrap().content_type, "image/png");

        let upload = NewPicture::new(&b"img1"[..], "").with_filename("notes.txt");
        assert!(h.orchestrator.validate(upload).is_err());
    }

    #[tokio::test]
    async fn test_open_blob_circuit_fails_fast() {
        let mut blobs = MockBlobStore::new();
        blobs
            .expect_put()
            .times(2)
            .returning(|_, _| Err(BlobError::Unavailable("503 slow down".into())));

        let mut config = ResilienceConfig {
            blob_store: quick_policy(),
            metadata: quick_policy(),
            events: quick_policy(),
        };
        config.blob_store.retry.max_attempts = 1;
        config.blob_store.circuit_breaker.minimum_calls = 2;
        config.blob_store.circuit_breaker.failure_ratio = 0.5;

        let orchestrator = PictureOrchestrator::new(
            Arc::new(blobs),
            Arc::new(InMemoryMetadataRepository::new()),
            Arc::new(RecordingEventPublisher::new()),
            PolicySet::from_config(&config),
            OrchestratorConfig::default(),
        );

        for _ in 0..2 {
            let err = assert_err!(orchestrator.create(png(b"img1")).await);
            assert!(matches!(err, PictureError::StorageUnavailable(_)));
            assert!(err.is_retryable());
        }

        let err = assert_err!(orchestrator.create(png(b"img1")).await);
        assert!(matches!(
            err,
            PictureError::CircuitOpen {
                dependency: Dependency::BlobStore
            }
        ));
    }

    #[tokio::test]
    async fn test_locate_without_url_support() {
        let h = harness();
        let created = assert_ok!(h.orchestrator.create(png(b"img1")).await);

        let location = assert_ok!(h.orchestrator.locate(created.value.id, None).await);

        assert_eq!(location.metadata, created.value);
        assert!(location.url.is_none());
        assert!(location.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_locate_with_presigned_url() {
        let mut blobs = MockBlobStore::new();
        blobs.expect_put().returning(|_, _| Ok(()));
        blobs.expect_url_for().returning(|key, content_type, _| {
            Ok(Some(format!(
                "https://blobs.example/{}?response-content-type={}",
                key, content_type
            )))
        });

        let orchestrator = PictureOrchestrator::new(
            Arc::new(blobs),
            Arc::new(InMemoryMetadataRepository::new()),
            Arc::new(RecordingEventPublisher::new()),
            policies(),
            OrchestratorConfig::default(),
        );
        let created = assert_ok!(orchestrator.create(png(b"img1")).await);

        let before = Utc::now();
        let location = assert_ok!(
            orchestrator
                .locate(created.value.id, Some(Duration::from_secs(60)))
                .await
        );

        assert_eq!(
            location.url.as_deref(),
            Some(
                format!(
                    "https://blobs.example/{}?response-content-type=image/png",
                    created.value.blob_key
                )
                .as_str()
            )
        );
        let expires_at = location.expires_at.unwrap();
        assert!(expires_at >= before + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_recent_superseded_blob_is_left_for_sweeper() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let orchestrator = PictureOrchestrator::new(
            blobs.clone(),
            Arc::new(InMemoryMetadataRepository::new()),
            Arc::new(RecordingEventPublisher::new()),
            policies(),
            OrchestratorConfig::default(),
        );
        let created = assert_ok!(orchestrator.create(png(b"img1")).await);

        assert_ok!(orchestrator.update(created.value.id, png(b"img2"), 1).await);

        assert!(blobs.contains(&created.value.blob_key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_keeps_blob_another_instance_just_wrote() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let metadata = Arc::new(InMemoryMetadataRepository::new());
        let instance = || {
            PictureOrchestrator::new(
                blobs.clone(),
                metadata.clone(),
                Arc::new(RecordingEventPublisher::new()),
                policies(),
                OrchestratorConfig {
                    release_grace_period_secs: 60,
                    ..OrchestratorConfig::default()
                },
            )
        };
        let a = instance();
        let b = instance();

        let existing = assert_ok!(a.create(png(b"img1")).await);
        let key = existing.value.blob_key.clone();
        blobs.put_at(key.clone(), &b"img1"[..], Utc::now() - chrono::Duration::hours(1));

        // b has put the shared blob but not committed when a deletes
        metadata.set_create_delay(Some(Duration::from_millis(100)));
        let (created, deleted) = tokio::join!(b.create(png(b"img1")), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            a.delete(existing.value.id, 1).await
        });
        metadata.set_create_delay(None);

        let created = assert_ok!(created);
        assert_ok!(deleted);
        assert!(blobs.contains(&key));

        let (blob, record) = assert_ok!(b.read(created.value.id).await);
        assert_eq!(blob.key, key);
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn test_delete_succeeds_when_blob_release_fails() {
        let mut blobs = MockBlobStore::new();
        blobs.expect_put().returning(|_, _| Ok(()));
        blobs.expect_head().returning(|key| Ok(aged(key)));
        blobs
            .expect_delete()
            .returning(|_| Err(BlobError::Unavailable("503 slow down".into())));
        let metadata = Arc::new(InMemoryMetadataRepository::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let orchestrator = PictureOrchestrator::new(
            Arc::new(blobs),
            metadata.clone(),
            events.clone(),
            policies(),
            eager_release(),
        );
        let created = assert_ok!(orchestrator.create(png(b"img1")).await);

        let deleted = assert_ok!(orchestrator.delete(created.value.id, 1).await);

        assert_eq!(deleted.event, EventDelivery::Confirmed);
        assert!(metadata.is_empty());
        let last = events.events().pop().unwrap();
        assert_eq!((last.kind, last.version), (ChangeKind::Deleted, 2));
    }

    #[tokio::test]
    async fn test_delete_succeeds_when_reference_check_fails() {
        let record = {
            let upload = png(b"img1");
            let blob = PictureBlob::from_payload(upload.payload.clone());
            PictureMetadata::first(PictureId::new(), &blob, &upload, Utc::now())
        };

        let mut metadata = MockMetadataRepository::new();
        let stored = record.clone();
        metadata.expect_read().return_once(move |_| Ok(stored));
        metadata.expect_delete().times(1).returning(|_, _| Ok(()));
        metadata
            .expect_is_blob_referenced()
            .returning(|_| Err(MetadataError::Unreachable("connection refused".into())));

        let blobs = Arc::new(InMemoryBlobStore::new());
        let long_ago = Utc::now() - chrono::Duration::days(1);
        blobs.put_at(record.blob_key.clone(), &b"img1"[..], long_ago);
        let events = Arc::new(RecordingEventPublisher::new());
        let orchestrator = PictureOrchestrator::new(
            blobs.clone(),
            Arc::new(metadata),
            events.clone(),
            policies(),
            eager_release(),
        );

        assert_ok!(orchestrator.delete(record.id, 1).await);

        // unknown references: the blob stays for the sweeper
        assert!(blobs.contains(&record.blob_key));
        let published = events.events();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].kind, ChangeKind::Deleted);
    }

    #[tokio::test]
    async fn test_update_succeeds_when_superseded_blob_release_fails() {
        let mut blobs = MockBlobStore::new();
        blobs.expect_put().returning(|_, _| Ok(()));
        blobs.expect_head().returning(|key| Ok(aged(key)));
        blobs
            .expect_delete()
            .returning(|_| Err(BlobError::Unavailable("503 slow down".into())));
        let metadata = Arc::new(InMemoryMetadataRepository::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let orchestrator = PictureOrchestrator::new(
            Arc::new(blobs),
            metadata.clone(),
            events.clone(),
            policies(),
            eager_release(),
        );
        let created = assert_ok!(orchestrator.create(png(b"img1")).await);

        let updated = assert_ok!(orchestrator.update(created.value.id, png(b"img2"), 1).await);

        assert_eq!(updated.value.version, 2);
        let stored = metadata.get(created.value.id).unwrap();
        assert_eq!(stored.blob_key, BlobKey::for_payload(b"img2"));
        let last = events.events().pop().unwrap();
        assert_eq!((last.kind, last.version), (ChangeKind::Updated, 2));
    }

    #[tokio::test]
    async fn test_blob_guards_map_keys_to_stable_stripes() {
        let guards = BlobGuards::new();
        let key = BlobKey::for_payload(b"img1");

        let held = guards.lock(&key).await;
        let retry = tokio::time::timeout(Duration::from_millis(10), guards.lock(&key)).await;
        assert!(retry.is_err());

        drop(held);
        assert_ok!(tokio::time::timeout(Duration::from_millis(10), guards.lock(&key)).await);
    }
}
