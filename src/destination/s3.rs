//! S3 destination using multipart uploads.
//!
//! Chunks are held one behind: a chunk is uploaded as a part only once the
//! next one arrives, so a single-chunk object is published with one
//! `PutObject` and larger objects through `CompleteMultipartUpload`.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;

use super::{DestinationError, ObjectStore, ObjectWriter};

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    /// Falls back to the AWS default region chain when unset.
    pub region: Option<String>,
}

/// [`ObjectStore`] backed by the AWS SDK; credentials come from the default
/// provider chain (environment, profile, instance metadata).
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn connect(settings: S3Settings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = settings.region {
            loader = loader.region(Region::new(region));
        }
        let sdk_config = loader.load().await;
        Self {
            client: S3Client::new(&sdk_config),
            bucket: settings.bucket,
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn create_writer(&self, key: &str) -> Result<Box<dyn ObjectWriter>, DestinationError> {
        Ok(Box::new(S3ObjectWriter {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            upload_id: None,
            parts: Vec::new(),
            held: None,
            bytes_written: 0,
            closed: false,
        }))
    }
}

fn sdk_error<E>(
    operation: &'static str,
    key: &str,
    err: SdkError<E, HttpResponse>,
) -> DestinationError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let retryable = match status {
        Some(status) => status == 429 || status >= 500,
        None => true,
    };
    DestinationError::Sdk {
        operation,
        key: key.to_string(),
        message: DisplayErrorContext(&err).to_string(),
        retryable,
    }
}

pub struct S3ObjectWriter {
    client: S3Client,
    bucket: String,
    key: String,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    held: Option<Bytes>,
    bytes_written: u64,
    closed: bool,
}

impl S3ObjectWriter {
    async fn ensure_upload(&mut self) -> Result<String, DestinationError> {
        if let Some(id) = &self.upload_id {
            return Ok(id.clone());
        }
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|e| sdk_error("CreateMultipartUpload", &self.key, e))?;
        let id = output
            .upload_id()
            .ok_or_else(|| DestinationError::Protocol {
                operation: "CreateMultipartUpload",
                key: self.key.clone(),
                message: "missing upload id".to_string(),
            })?
            .to_string();
        self.upload_id = Some(id.clone());
        Ok(id)
    }

    async fn upload_part(&mut self, body: Bytes) -> Result<(), DestinationError> {
        let upload_id = self.ensure_upload().await?;
        let part_number = self.parts.len() as i32 + 1;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| sdk_error("UploadPart", &self.key, e))?;
        let e_tag = output.e_tag().ok_or_else(|| DestinationError::Protocol {
            operation: "UploadPart",
            key: self.key.clone(),
            message: format!("missing ETag for part {}", part_number),
        })?;
        self.parts.push(
            CompletedPart::builder()
                .e_tag(e_tag)
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    async fn complete(&mut self, upload_id: &str) -> Result<(), DestinationError> {
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| sdk_error("CompleteMultipartUpload", &self.key, e))?;
        Ok(())
    }

    async fn abort_upload(&mut self) -> Result<(), DestinationError> {
        self.held = None;
        self.closed = true;
        let Some(upload_id) = self.upload_id.take() else {
            return Ok(());
        };
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| sdk_error("AbortMultipartUpload", &self.key, e))?;
        tracing::debug!(key = %self.key, "Aborted multipart upload");
        Ok(())
    }
}

#[async_trait]
impl ObjectWriter for S3ObjectWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), DestinationError> {
        self.bytes_written += chunk.len() as u64;
        if let Some(previous) = self.held.replace(chunk) {
            self.upload_part(previous).await?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<u64, DestinationError> {
        let last = self.held.take().unwrap_or_default();

        if self.upload_id.is_none() {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(ByteStream::from(last))
                .send()
                .await
                .map_err(|e| sdk_error("PutObject", &self.key, e))?;
            self.closed = true;
            return Ok(self.bytes_written);
        }

        let result = async {
            if !last.is_empty() {
                self.upload_part(last).await?;
            }
            let upload_id = self.upload_id.clone().unwrap_or_default();
            self.complete(&upload_id).await
        }
        .await;

        match result {
            Ok(()) => {
                self.upload_id = None;
                self.closed = true;
                Ok(self.bytes_written)
            }
            Err(e) => {
                if let Err(abort_err) = self.abort_upload().await {
                    tracing::warn!(key = %self.key, "Failed to abort multipart upload: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    async fn abort(mut self: Box<Self>) -> Result<(), DestinationError> {
        self.abort_upload().await
    }
}

impl Drop for S3ObjectWriter {
    /// A writer dropped mid-transfer (timeout, cancelled future) still owns an
    /// open multipart upload; abort it in the background.
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %self.key, upload_id, "Multipart upload left open");
            return;
        };
        let client = self.client.clone();
        let bucket = std::mem::take(&mut self.bucket);
        let key = std::mem::take(&mut self.key);
        handle.spawn(async move {
            if let Err(e) = client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                tracing::warn!(key = %key, "Failed to abort abandoned multipart upload: {}", DisplayErrorContext(&e));
            }
        });
    }
}
