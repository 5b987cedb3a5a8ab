use crate::blob_store::{BlobError, BlobListing, BlobResult, BlobStore};
use crate::config::S3Config;
use crate::model::BlobKey;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Object key for a blob.
///
/// Format: `{prefix}/{first two hash chars}/{hash}`. The two-character fan-out
/// spreads keys across S3 partitions.
pub fn object_key(prefix: &str, key: &BlobKey) -> String {
    let hash = key.as_str();
    format!("{}/{}/{}", prefix.trim_end_matches('/'), &hash[..2], hash)
}

/// Recover the blob key from an object key written by [`object_key`]
pub fn blob_key_from_object(prefix: &str, object: &str) -> Option<BlobKey> {
    let rest = object.strip_prefix(prefix.trim_end_matches('/'))?.strip_prefix('/')?;
    let (fanout, hash) = rest.split_once('/')?;
    let key = BlobKey::parse(hash).ok()?;
    (key.as_str().starts_with(fanout) && fanout.len() == 2).then_some(key)
}

fn to_utc(time: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(time.secs(), time.subsec_nanos()).single()
}

/// Map an SDK error onto the retry classes the policy understands
fn classify_sdk_error<E>(err: SdkError<E, HttpResponse>) -> BlobError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::ConstructionFailure(_) => BlobError::Rejected(message),
        SdkError::TimeoutError(_) | SdkError::ResponseError(_) => BlobError::Interrupted(message),
        SdkError::DispatchFailure(failure) => {
            if failure.is_timeout() || failure.is_io() {
                BlobError::Interrupted(message)
            } else {
                BlobError::Unreachable(message)
            }
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            if status == 429 || status >= 500 {
                BlobError::Unavailable(message)
            } else {
                BlobError::Rejected(message)
            }
        }
        _ => BlobError::Unreachable(message),
    }
}

/// Content-addressed blob store on S3 (or any S3 compatible service)
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            prefix = %config.key_prefix,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    fn object_key(&self, key: &BlobKey) -> String {
        object_key(&self.config.key_prefix, key)
    }

    /// Simple single-part upload for small blobs
    async fn simple_upload(&self, s3_key: &str, data: Bytes) -> BlobResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(s3_key)
            .body(ByteStream::from(data))
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(classify_sdk_error)?;

        Ok(())
    }

    /// Multipart upload for large blobs, aborted if any part fails
    async fn multipart_upload(&self, s3_key: &str, data: Bytes) -> BlobResult<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(s3_key)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(classify_sdk_error)?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| BlobError::Rejected("no upload id in response".to_string()))?
            .to_string();

        let result = self.upload_parts(s3_key, &upload_id, data).await;

        if result.is_err() {
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(s3_key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(s3_key, error = %DisplayErrorContext(&e), "Failed to abort multipart upload");
            }
        }

        result
    }

    async fn upload_parts(&self, s3_key: &str, upload_id: &str, data: Bytes) -> BlobResult<()> {
        let part_size = self.config.part_size_bytes.max(1);
        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut offset = 0;

        while offset < data.len() {
            let end = (offset + part_size).min(data.len());
            let chunk = data.slice(offset..end);

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(s3_key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(classify_sdk_error)?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
            offset = end;
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(s3_key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        Ok(())
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, data), fields(blob_key = %key, size_bytes = data.len()))]
    async fn put(&self, key: &BlobKey, data: Bytes) -> BlobResult<()> {
        let s3_key = self.object_key(key);

        if data.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(&s3_key, data).await?;
        } else {
            self.simple_upload(&s3_key, data).await?;
        }

        debug!(s3_key = %s3_key, "Blob uploaded");
        Ok(())
    }

    #[instrument(skip(self), fields(blob_key = %key))]
    async fn get(&self, key: &BlobKey) -> BlobResult<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    BlobError::NotFound(key.clone())
                } else {
                    classify_sdk_error(e)
                }
            })?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| BlobError::Interrupted(e.to_string()))?;

        Ok(body.into_bytes())
    }

    #[instrument(skip(self), fields(blob_key = %key))]
    async fn delete(&self, key: &BlobKey) -> BlobResult<()> {
        // S3 answers 204 for absent keys as well
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(classify_sdk_error)?;

        debug!("Blob deleted");
        Ok(())
    }

    async fn list(&self) -> BlobResult<Vec<BlobListing>> {
        let prefix = format!("{}/", self.config.key_prefix.trim_end_matches('/'));
        let mut listings = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(classify_sdk_error)?;

            for object in response.contents() {
                let Some(name) = object.key() else { continue };
                let Some(key) = blob_key_from_object(&self.config.key_prefix, name) else {
                    debug!(object = name, "Skipping foreign object under blob prefix");
                    continue;
                };
                let last_modified = object.last_modified().and_then(to_utc);

                listings.push(BlobListing { key, last_modified });
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(listings)
    }

    #[instrument(skip(self), fields(blob_key = %key))]
    async fn head(&self, key: &BlobKey) -> BlobResult<BlobListing> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    BlobError::NotFound(key.clone())
                } else {
                    classify_sdk_error(e)
                }
            })?;

        Ok(BlobListing {
            key: key.clone(),
            last_modified: response.last_modified().and_then(to_utc),
        })
    }

    async fn url_for(
        &self,
        key: &BlobKey,
        content_type: &str,
        expires_in: Duration,
    ) -> BlobResult<Option<String>> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| BlobError::Rejected(e.to_string()))?;

        // objects are stored as octet-stream; the URL carries the picture's type
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .response_content_type(content_type)
            .presigned(presigning)
            .await
            .map_err(classify_sdk_error)?;

        Ok(Some(request.uri().to_string()))
    }
}
