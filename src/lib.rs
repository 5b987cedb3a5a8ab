//! Picture Storage Service
//!
//! Stores pictures across three independent systems and keeps them
//! consistent without distributed transactions: picture bytes go to a
//! content-addressed blob store (S3), versioned metadata to PostgreSQL, and
//! change notifications to Kafka.
//!
//! ## Features
//!
//! - **Ordered sagas**: create, update and delete run their steps in a fixed
//!   order with forward-only compensation; the metadata write is the commit
//!   point
//! - **Optimistic concurrency**: updates and deletes carry the version they
//!   expect and lose cleanly with a version conflict
//! - **Per-dependency resilience**: bounded retries with exponential backoff
//!   and jitter, attempt timeouts and a circuit breaker for each dependency
//! - **Degraded success**: a failing event bus never fails a committed write
//! - **Orphan sweeping**: blobs left behind by failed sagas are collected
//!   after a grace period
//!
//! ## Architecture
//!
//! ```text
//!                      ┌────────────────────┐
//!   create/read/  ───▶ │ PictureOrchestrator│
//!   update/delete      └────────────────────┘
//!                        │        │        │
//!                 Resilience  Resilience  Resilience
//!                   Policy      Policy      Policy
//!                        │        │        │
//!                        ▼        ▼        ▼
//!               ┌──────────┐ ┌──────────┐ ┌──────────┐
//!               │ BlobStore│ │ Metadata │ │  Event   │
//!               │   (S3)   │ │ (Postgres│ │ Publisher│
//!               │ {sha256} │ │ versions)│ │ (Kafka)  │
//!               └──────────┘ └──────────┘ └──────────┘
//!                     ▲            ▲
//!                     └─────┬──────┘
//!                    ┌──────────────┐
//!                    │ OrphanSweeper│
//!                    └──────────────┘
//! ```

pub mod blob_store;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod events;
#[cfg(feature = "kafka")]
pub mod kafka_publisher;
pub mod memory;
pub mod metadata_store;
pub mod model;
pub mod orchestrator;
pub mod resilience;
pub mod s3_store;
pub mod sweeper;

pub use blob_store::{BlobError, BlobListing, BlobStore};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use config::Config;
pub use error::{PictureError, PictureResult};
pub use events::{EventPublisher, PublishError};
#[cfg(feature = "kafka")]
pub use kafka_publisher::KafkaEventPublisher;
pub use memory::{InMemoryBlobStore, InMemoryMetadataRepository, RecordingEventPublisher};
pub use metadata_store::{MetadataError, MetadataRepository, PgMetadataRepository};
pub use model::{
    BlobKey, ChangeEvent, ChangeKind, NewPicture, PictureBlob, PictureId, PictureLocation,
    PictureMetadata,
};
pub use orchestrator::{Completed, EventDelivery, PictureOrchestrator};
pub use resilience::{Dependency, FailureClass, Idempotency, PolicyError, PolicySet, ResiliencePolicy};
pub use s3_store::S3BlobStore;
pub use sweeper::{OrphanSweeper, SweepReport};
