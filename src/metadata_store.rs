use crate::config::DatabaseConfig;
use crate::model::{BlobKey, PictureId, PictureMetadata};
use crate::resilience::{Classify, FailureClass};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors reported by metadata repositories
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("picture {0} not found")]
    NotFound(PictureId),

    #[error("picture record already exists: {0}")]
    AlreadyExists(String),

    #[error("version conflict on picture {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: PictureId,
        expected: u64,
        actual: u64,
    },

    /// The request never reached the database.
    #[error("metadata store unreachable: {0}")]
    Unreachable(String),

    /// The database aborted the statement because of concurrent load.
    #[error("metadata store contention: {0}")]
    Contention(String),

    /// The connection broke while the statement was in flight.
    #[error("metadata store request interrupted: {0}")]
    Interrupted(String),

    #[error("metadata query failed: {0}")]
    Query(String),
}

impl Classify for MetadataError {
    fn failure_class(&self) -> FailureClass {
        match self {
            MetadataError::Unreachable(_) | MetadataError::Contention(_) => {
                FailureClass::Transient
            }
            MetadataError::Interrupted(_) => FailureClass::Ambiguous,
            MetadataError::NotFound(_)
            | MetadataError::AlreadyExists(_)
            | MetadataError::VersionConflict { .. }
            | MetadataError::Query(_) => FailureClass::Permanent,
        }
    }
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Versioned picture records keyed by [`PictureId`].
///
/// Writes after creation are compare-and-swap on `version`: the repository
/// is the only arbiter between concurrent writers of the same picture.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataRepository: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` when the id or the
    /// idempotency key is taken.
    async fn create(&self, record: &PictureMetadata) -> MetadataResult<()>;

    async fn read(&self, id: PictureId) -> MetadataResult<PictureMetadata>;

    /// Replace the record if its stored version equals `expected_version`
    async fn compare_and_swap(
        &self,
        id: PictureId,
        expected_version: u64,
        record: &PictureMetadata,
    ) -> MetadataResult<()>;

    /// Remove the record if its stored version equals `expected_version`
    async fn delete(&self, id: PictureId, expected_version: u64) -> MetadataResult<()>;

    async fn find_by_idempotency_key(&self, key: &str) -> MetadataResult<Option<PictureMetadata>>;

    /// Whether any record points at `key`
    async fn is_blob_referenced(&self, key: &BlobKey) -> MetadataResult<bool>;
}

/// Picture row as stored in PostgreSQL
#[derive(Debug, Clone, FromRow)]
struct PictureRow {
    id: Uuid,
    blob_key: String,
    content_type: String,
    size_bytes: i64,
    original_filename: Option<String>,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<PictureRow> for PictureMetadata {
    type Error = MetadataError;

    fn try_from(row: PictureRow) -> Result<Self, Self::Error> {
        let blob_key = BlobKey::parse(row.blob_key).map_err(|e| MetadataError::Query(e.to_string()))?;
        let size_bytes = u64::try_from(row.size_bytes)
            .map_err(|_| MetadataError::Query(format!("negative size for picture {}", row.id)))?;
        let version = u64::try_from(row.version)
            .map_err(|_| MetadataError::Query(format!("negative version for picture {}", row.id)))?;

        Ok(Self {
            id: PictureId::from(row.id),
            blob_key,
            content_type: row.content_type,
            size_bytes,
            original_filename: row.original_filename,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version,
        })
    }
}

const SELECT_PICTURE: &str = r#"
    SELECT id, blob_key, content_type, size_bytes, original_filename,
           idempotency_key, created_at, updated_at, version
    FROM pictures
"#;

/// Map a sqlx error onto the retry classes the policy understands
fn classify_sqlx(err: sqlx::Error) -> MetadataError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_) => {
            MetadataError::Unreachable(err.to_string())
        }
        sqlx::Error::Io(_) | sqlx::Error::Protocol(_) | sqlx::Error::WorkerCrashed => {
            MetadataError::Interrupted(err.to_string())
        }
        sqlx::Error::Database(ref db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            match code.as_str() {
                // unique_violation
                "23505" => MetadataError::AlreadyExists(db.message().to_string()),
                // serialization_failure, deadlock_detected, lock_not_available
                "40001" | "40P01" | "55P03" => MetadataError::Contention(err.to_string()),
                // connection_exception class, admin/crash shutdown, cannot_connect_now
                c if c.starts_with("08") || c == "57P01" || c == "57P02" || c == "57P03" => {
                    MetadataError::Unreachable(err.to_string())
                }
                _ => MetadataError::Query(err.to_string()),
            }
        }
        other => MetadataError::Query(other.to_string()),
    }
}

fn to_i64(value: u64, field: &str) -> MetadataResult<i64> {
    i64::try_from(value).map_err(|_| MetadataError::Query(format!("{} out of range: {}", field, value)))
}

/// Metadata repository backed by PostgreSQL
pub struct PgMetadataRepository {
    pool: PgPool,
}

impl PgMetadataRepository {
    /// Create a new repository with its connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Current version of a picture, if it exists
    async fn current_version(&self, id: PictureId) -> MetadataResult<Option<u64>> {
        let version: Option<(i64,)> = sqlx::query_as("SELECT version FROM pictures WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx)?;

        Ok(version.map(|(v,)| v.max(0) as u64))
    }

    /// Explain why a version-checked statement touched no row
    async fn missed_write(&self, id: PictureId, expected: u64) -> MetadataError {
        match self.current_version(id).await {
            Ok(None) => MetadataError::NotFound(id),
            Ok(Some(actual)) => MetadataError::VersionConflict {
                id,
                expected,
                actual,
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl MetadataRepository for PgMetadataRepository {
    #[instrument(skip(self, record), fields(picture_id = %record.id, blob_key = %record.blob_key))]
    async fn create(&self, record: &PictureMetadata) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pictures (
                id, blob_key, content_type, size_bytes, original_filename,
                idempotency_key, created_at, updated_at, version
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9
            )
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.blob_key.as_str())
        .bind(&record.content_type)
        .bind(to_i64(record.size_bytes, "size_bytes")?)
        .bind(&record.original_filename)
        .bind(&record.idempotency_key)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(to_i64(record.version, "version")?)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        debug!("Picture metadata created");
        metrics::counter!("picture.metadata.created").increment(1);
        Ok(())
    }

    async fn read(&self, id: PictureId) -> MetadataResult<PictureMetadata> {
        let row = sqlx::query_as::<_, PictureRow>(&format!("{} WHERE id = $1", SELECT_PICTURE))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx)?;

        row.ok_or(MetadataError::NotFound(id))?.try_into()
    }

    #[instrument(skip(self, record), fields(picture_id = %id))]
    async fn compare_and_swap(
        &self,
        id: PictureId,
        expected_version: u64,
        record: &PictureMetadata,
    ) -> MetadataResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pictures
            SET blob_key = $3, content_type = $4, size_bytes = $5,
                original_filename = $6, updated_at = $7, version = $8
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(to_i64(expected_version, "expected_version")?)
        .bind(record.blob_key.as_str())
        .bind(&record.content_type)
        .bind(to_i64(record.size_bytes, "size_bytes")?)
        .bind(&record.original_filename)
        .bind(record.updated_at)
        .bind(to_i64(record.version, "version")?)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(self.missed_write(id, expected_version).await);
        }

        debug!(version = record.version, "Picture metadata swapped");
        Ok(())
    }

    #[instrument(skip(self), fields(picture_id = %id))]
    async fn delete(&self, id: PictureId, expected_version: u64) -> MetadataResult<()> {
        let result = sqlx::query("DELETE FROM pictures WHERE id = $1 AND version = $2")
            .bind(id.as_uuid())
            .bind(to_i64(expected_version, "expected_version")?)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(self.missed_write(id, expected_version).await);
        }

        debug!("Picture metadata deleted");
        Ok(())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> MetadataResult<Option<PictureMetadata>> {
        let row = sqlx::query_as::<_, PictureRow>(&format!(
            "{} WHERE idempotency_key = $1",
            SELECT_PICTURE
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        row.map(PictureMetadata::try_from).transpose()
    }

    async fn is_blob_referenced(&self, key: &BlobKey) -> MetadataResult<bool> {
        let (referenced,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM pictures WHERE blob_key = $1)")
                .bind(key.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(classify_sqlx)?;

        Ok(referenced)
    }
}
