//! Thin wrapper over `aws-sdk-s3` exposing exactly the primitives the
//! uploader and restore engine need: single-PUT, the multipart trio, object
//! HEAD/GET, and archive-tier restore requests (§4.7, §4.9).

use anyhow::{Context, Error};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, RestoreRequest, Tier};
use aws_sdk_s3::Client;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use bytes::Bytes;
use thiserror::Error as ThisError;

/// Distinguishes the retry-locally-forever-eventually-give-up transient
/// class (timeouts, 5xx, throttling) from everything else, per §4.7's
/// "retried up to 5 times on transient failures ... non-transient failures
/// fail fast".
#[derive(Debug, ThisError)]
pub enum UploadError {
    #[error("{0}")]
    Transient(Error),
    #[error("{0}")]
    NonTransient(Error),
}

/// An object in GLACIER or DEEP_ARCHIVE with no `x-amz-restore` header has
/// never had a restore requested; a HEAD against it still omits `restore()`
/// (§4.9 step 3). Any other class is directly readable.
fn is_archive_storage_class(class: Option<&aws_sdk_s3::types::StorageClass>) -> bool {
    matches!(
        class,
        Some(aws_sdk_s3::types::StorageClass::Glacier) | Some(aws_sdk_s3::types::StorageClass::DeepArchive)
    )
}

fn classify<E, R>(op: &str, key: &str, err: SdkError<E, R>) -> UploadError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    let transient = matches!(&err, SdkError::TimeoutError(_) | SdkError::DispatchFailure(_))
        || matches!(
            err.code(),
            Some("SlowDown")
                | Some("RequestTimeout")
                | Some("InternalError")
                | Some("ServiceUnavailable")
                | Some("Throttling")
                | Some("ThrottlingException")
        );
    let wrapped = Error::msg(format!("{op} {key} failed: {err:?}"));
    if transient {
        UploadError::Transient(wrapped)
    } else {
        UploadError::NonTransient(wrapped)
    }
}

#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

/// Whether an S3 object currently needs an archive-tier restore before it
/// can be read (§4.9 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStatus {
    /// Stored in a directly-readable class, or already restored.
    Available,
    /// A restore has not been requested yet.
    NotRequested,
    /// A restore is in progress.
    InProgress,
}

impl S3Client {
    pub fn new(client: Client, bucket: String) -> Self {
        S3Client { client, bucket }
    }

    /// Whether this client is talking to a non-default endpoint, informational only.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Single-PUT upload for small objects (manifest, pointer) (§4.7).
    /// `body` is always materialized first: "for small objects that happen
    /// to be non-seekable, the uploader must materialize the body into a
    /// retry buffer before issuing the PUT."
    pub async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        storage_class: &str,
    ) -> Result<String, UploadError> {
        let resp = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .storage_class(storage_class.into())
            .server_side_encryption(aws_sdk_s3::types::ServerSideEncryption::Aes256)
            .send()
            .await
            .map_err(|e| classify("PUT", key, e))?;

        Ok(resp.e_tag().unwrap_or_default().to_string())
    }

    pub async fn create_multipart_upload(
        &self,
        key: &str,
        storage_class: &str,
    ) -> Result<String, Error> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .storage_class(storage_class.into())
            .server_side_encryption(aws_sdk_s3::types::ServerSideEncryption::Aes256)
            .send()
            .await
            .with_context(|| format!("create_multipart_upload for {key} failed"))?;

        resp.upload_id()
            .map(str::to_string)
            .context("create_multipart_upload response had no upload_id")
    }

    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, UploadError> {
        let resp = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify("upload_part", key, e))?;

        resp.e_tag().map(str::to_string).ok_or_else(|| {
            UploadError::NonTransient(Error::msg(format!(
                "upload_part {part_number} of {key} returned no ETag"
            )))
        })
    }

    /// `parts` must already be sorted ascending by part number (§5:
    /// "recorded in strict ascending part number before
    /// complete_multipart_upload").
    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
    ) -> Result<String, Error> {
        let completed_parts: Vec<CompletedPart> = parts
            .into_iter()
            .map(|(part_number, etag)| {
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(etag)
                    .build()
            })
            .collect();

        let resp = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("complete_multipart_upload for {key} failed"))?;

        Ok(resp.e_tag().unwrap_or_default().to_string())
    }

    pub async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<(), Error> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .with_context(|| format!("abort_multipart_upload for {key} failed"))?;
        Ok(())
    }

    /// Streamed GET; the returned `ByteStream` implements `AsyncRead` via
    /// [`ByteStream::into_async_read`].
    pub async fn get_object(&self, key: &str) -> Result<ByteStream, Error> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("GET {key} failed"))?;
        Ok(resp.body)
    }

    pub async fn get_object_bytes(&self, key: &str) -> Result<Bytes, Error> {
        let stream = self.get_object(key).await?;
        let bytes = stream
            .collect()
            .await
            .with_context(|| format!("failed to read GET body for {key}"))?
            .into_bytes();
        Ok(bytes)
    }

    pub async fn head_restore_status(&self, key: &str) -> Result<RestoreStatus, Error> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("HEAD {key} failed"))?;

        let restore = resp.restore();
        match restore {
            None if is_archive_storage_class(resp.storage_class()) => Ok(RestoreStatus::NotRequested),
            None => Ok(RestoreStatus::Available),
            Some(restore) if restore.contains("ongoing-request=\"true\"") => {
                Ok(RestoreStatus::InProgress)
            }
            Some(restore) if restore.contains("ongoing-request=\"false\"") => {
                Ok(RestoreStatus::Available)
            }
            Some(_) => Ok(RestoreStatus::NotRequested),
        }
    }

    pub async fn restore_object(&self, key: &str, tier: &str, days: i32) -> Result<(), Error> {
        let tier = match tier.to_ascii_lowercase().as_str() {
            "expedited" => Tier::Expedited,
            "bulk" => Tier::Bulk,
            _ => Tier::Standard,
        };

        self.client
            .restore_object()
            .bucket(&self.bucket)
            .key(key)
            .restore_request(
                RestoreRequest::builder()
                    .days(days)
                    .glacier_job_parameters(
                        aws_sdk_s3::types::GlacierJobParameters::builder()
                            .tier(tier)
                            .build()
                            .context("building GlacierJobParameters")?,
                    )
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("restore_object for {key} failed"))?;
        Ok(())
    }
}
