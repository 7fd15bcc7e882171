//! S3 access used by the copier, the transfer selector and the restore flow.

use crate::{
    models::locator::S3Locator,
    services::storage_clients::{
        AwsBucketConfig, ListedObject, ObjectListing, ObjectMetadata, StorageError, StorageResult,
    },
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    Client,
    error::{DisplayErrorContext, SdkError},
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::{
        CompletedMultipartUpload, CompletedPart, GlacierJobParameters, RestoreRequest,
        StorageClass, Tier,
    },
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::{fmt::Debug, time::Duration};

/// Characters left alone when encoding a `CopySource` header.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Clone, Debug, PartialEq)]
pub struct CompletedPartInfo {
    pub part_number: u32,
    pub etag: String,
}

#[async_trait]
pub trait S3Client: Send + Sync {
    /// `None` when the object does not exist.
    async fn head_object(&self, object: &S3Locator) -> StorageResult<Option<ObjectMetadata>>;

    async fn copy_object(
        &self,
        source: &S3Locator,
        target: &S3Locator,
        content_type: Option<&str>,
        storage_class: Option<&str>,
    ) -> StorageResult<()>;

    async fn put_object(
        &self,
        target: &S3Locator,
        body: Bytes,
        content_type: Option<&str>,
        storage_class: Option<&str>,
    ) -> StorageResult<()>;

    /// Returns the upload id.
    async fn create_multipart_upload(
        &self,
        target: &S3Locator,
        content_type: Option<&str>,
        storage_class: Option<&str>,
    ) -> StorageResult<String>;

    /// Returns the part etag.
    async fn upload_part(
        &self,
        target: &S3Locator,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StorageResult<String>;

    /// Copies the inclusive byte range `start..=end` of `source` into a part.
    async fn upload_part_copy(
        &self,
        source: &S3Locator,
        target: &S3Locator,
        upload_id: &str,
        part_number: u32,
        start: u64,
        end: u64,
    ) -> StorageResult<String>;

    async fn complete_multipart_upload(
        &self,
        target: &S3Locator,
        upload_id: &str,
        parts: &[CompletedPartInfo],
    ) -> StorageResult<()>;

    async fn abort_multipart_upload(&self, target: &S3Locator, upload_id: &str)
    -> StorageResult<()>;

    async fn presign_get(&self, object: &S3Locator, expires_in: Duration) -> StorageResult<String>;

    async fn restore_object(&self, object: &S3Locator, days: u32, tier: &str)
    -> StorageResult<()>;

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> StorageResult<ObjectListing>;
}

/// S3 client backed by the AWS SDK.
pub struct AwsS3Client {
    client: Client,
}

impl AwsS3Client {
    pub async fn new(config: &AwsBucketConfig, region: &str) -> Self {
        let loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region.to_string()));

        let loader = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "cloud-storage-service",
            )),
            _ => loader,
        };

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
        }
    }
}

fn sdk_error<E, R>(operation: &'static str) -> impl FnOnce(SdkError<E, R>) -> StorageError
where
    E: std::error::Error + 'static,
    R: Debug,
{
    move |err| StorageError::Service {
        operation,
        message: DisplayErrorContext(&err).to_string(),
    }
}

fn copy_source(source: &S3Locator) -> String {
    utf8_percent_encode(&format!("{}/{}", source.bucket, source.key), COPY_SOURCE).to_string()
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    dt.to_millis().ok().and_then(DateTime::from_timestamp_millis)
}

#[async_trait]
impl S3Client for AwsS3Client {
    async fn head_object(&self, object: &S3Locator) -> StorageResult<Option<ObjectMetadata>> {
        let result = self
            .client
            .head_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await;

        match result {
            Ok(output) => Ok(Some(ObjectMetadata {
                size: output.content_length().map(|l| l as u64),
                content_type: output.content_type().map(str::to_string),
                etag: output.e_tag().map(str::to_string),
                last_modified: output.last_modified().and_then(to_chrono),
                storage_class: output.storage_class().map(|s| s.as_str().to_string()),
                restore: output.restore().map(str::to_string),
            })),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(StorageError::Service {
                        operation: "HeadObject",
                        message: DisplayErrorContext(&service_err).to_string(),
                    })
                }
            }
        }
    }

    async fn copy_object(
        &self,
        source: &S3Locator,
        target: &S3Locator,
        content_type: Option<&str>,
        storage_class: Option<&str>,
    ) -> StorageResult<()> {
        self.client
            .copy_object()
            .bucket(&target.bucket)
            .key(&target.key)
            .copy_source(copy_source(source))
            .set_content_type(content_type.map(str::to_string))
            .set_storage_class(storage_class.map(StorageClass::from))
            .send()
            .await
            .map_err(sdk_error("CopyObject"))?;
        Ok(())
    }

    async fn put_object(
        &self,
        target: &S3Locator,
        body: Bytes,
        content_type: Option<&str>,
        storage_class: Option<&str>,
    ) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&target.bucket)
            .key(&target.key)
            .body(ByteStream::from(body))
            .set_content_type(content_type.map(str::to_string))
            .set_storage_class(storage_class.map(StorageClass::from))
            .send()
            .await
            .map_err(sdk_error("PutObject"))?;
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        target: &S3Locator,
        content_type: Option<&str>,
        storage_class: Option<&str>,
    ) -> StorageResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .set_content_type(content_type.map(str::to_string))
            .set_storage_class(storage_class.map(StorageClass::from))
            .send()
            .await
            .map_err(sdk_error("CreateMultipartUpload"))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or(StorageError::Service {
                operation: "CreateMultipartUpload",
                message: "response did not contain an upload id".into(),
            })
    }

    async fn upload_part(
        &self,
        target: &S3Locator,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StorageResult<String> {
        let output = self
            .client
            .upload_part()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(sdk_error("UploadPart"))?;

        output.e_tag().map(str::to_string).ok_or(StorageError::Service {
            operation: "UploadPart",
            message: format!("no etag returned for part {}", part_number),
        })
    }

    async fn upload_part_copy(
        &self,
        source: &S3Locator,
        target: &S3Locator,
        upload_id: &str,
        part_number: u32,
        start: u64,
        end: u64,
    ) -> StorageResult<String> {
        let output = self
            .client
            .upload_part_copy()
            .bucket(&target.bucket)
            .key(&target.key)
            .copy_source(copy_source(source))
            .copy_source_range(format!("bytes={}-{}", start, end))
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .send()
            .await
            .map_err(sdk_error("UploadPartCopy"))?;

        output
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .map(str::to_string)
            .ok_or(StorageError::Service {
                operation: "UploadPartCopy",
                message: format!("no etag returned for part {}", part_number),
            })
    }

    async fn complete_multipart_upload(
        &self,
        target: &S3Locator,
        upload_id: &str,
        parts: &[CompletedPartInfo],
    ) -> StorageResult<()> {
        let mut sorted = parts.to_vec();
        sorted.sort_by_key(|p| p.part_number);

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                sorted
                    .into_iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .part_number(p.part_number as i32)
                            .e_tag(p.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(sdk_error("CompleteMultipartUpload"))?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        target: &S3Locator,
        upload_id: &str,
    ) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&target.bucket)
            .key(&target.key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(sdk_error("AbortMultipartUpload"))?;
        Ok(())
    }

    async fn presign_get(&self, object: &S3Locator, expires_in: Duration) -> StorageResult<String> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::InvalidConfig(e.to_string()))?;

        let request = self
            .client
            .get_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .presigned(presigning)
            .await
            .map_err(sdk_error("PresignGetObject"))?;

        Ok(request.uri().to_string())
    }

    async fn restore_object(
        &self,
        object: &S3Locator,
        days: u32,
        tier: &str,
    ) -> StorageResult<()> {
        let parameters = GlacierJobParameters::builder()
            .tier(Tier::from(tier))
            .build()
            .map_err(|e| StorageError::InvalidConfig(e.to_string()))?;

        let request = RestoreRequest::builder()
            .days(days as i32)
            .glacier_job_parameters(parameters)
            .build();

        self.client
            .restore_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .restore_request(request)
            .send()
            .await
            .map_err(sdk_error("RestoreObject"))?;
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> StorageResult<ObjectListing> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(sdk_error("ListObjectsV2"))?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|o| {
                o.key().map(|key| ListedObject {
                    key: key.to_string(),
                    size: o.size().unwrap_or(0).max(0) as u64,
                    storage_class: o.storage_class().map(|s| s.as_str().to_string()),
                })
            })
            .collect();

        Ok(ObjectListing {
            objects,
            next_token: output.next_continuation_token().map(str::to_string),
        })
    }
}
