//! Execution of a single work item against the storage services.
//!
//! Nothing here touches engine state: each call reports an `Outcome` and the
//! scheduler folds it into the queue, counters and segment arena.

use crate::{
    errors::{CopyError, CopyResult},
    models::{
        locator::{BlobLocator, Locator, S3Locator},
        work_item::{MultipartData, MultipartSegment, WorkItem, WorkType},
    },
    services::{
        azure::ContainerClient,
        file_copier::FileCopierSettings,
        http_source::{HttpSource, RequestHeaders},
        probe::{ObjectProbe, is_up_to_date},
        s3::{CompletedPartInfo, S3Client},
        storage_clients::{ObjectMetadata, StorageClientFactory},
    },
};
use base64::{Engine, engine::general_purpose::STANDARD};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub const S3_MAX_PARTS: u64 = 10_000;
pub const BLOB_MAX_BLOCKS: u64 = 50_000;

const API_KEY_AUTH: &str = "McmaApiKey";
const API_KEY_HEADER: &str = "x-mcma-api-key";

/// Result of running one work item.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Source resolved; the item moves on to `Single` or `MultipartStart`.
    Prepared(WorkItem),
    /// Destination already up to date.
    Skipped,
    SingleDone { bytes: u64 },
    MultipartStarted {
        upload_id: String,
        segments: Vec<MultipartSegment>,
    },
    SegmentDone {
        upload_id: String,
        segment: MultipartSegment,
    },
    /// Some segments are not committed yet; try again later.
    NotReady,
    Completed { upload_id: String },
}

struct ResolvedSource {
    url: Option<String>,
    headers: Option<RequestHeaders>,
    metadata: ObjectMetadata,
}

pub(crate) struct WorkRunner {
    pub clients: Arc<StorageClientFactory>,
    pub http: Arc<dyn HttpSource>,
    pub probe: ObjectProbe,
    pub settings: FileCopierSettings,
    pub api_key: Option<String>,
}

impl WorkRunner {
    /// `segments` is the arena snapshot for a `MultipartComplete` item.
    pub async fn run(
        &self,
        item: &WorkItem,
        segments: Option<Vec<MultipartSegment>>,
    ) -> CopyResult<Outcome> {
        match item.work_type {
            WorkType::Prepare => self.prepare(item).await,
            WorkType::Single => self.single(item).await,
            WorkType::MultipartStart => self.multipart_start(item).await,
            WorkType::MultipartSegment => self.multipart_segment(item).await,
            WorkType::MultipartComplete => {
                let segments = segments.ok_or_else(|| {
                    CopyError::transfer(format!("no segments recorded for `{}`", item.url()))
                })?;
                self.multipart_complete(item, segments).await
            }
        }
    }

    async fn prepare(&self, item: &WorkItem) -> CopyResult<Outcome> {
        let destination_locator = &item.destination_file.locator;
        if let Locator::Generic(_) = destination_locator {
            return Err(CopyError::UnsupportedLocator(
                destination_locator.type_name().to_string(),
            ));
        }

        let destination = self.probe.destination_head(destination_locator).await?;
        let source = self.resolve_source(item).await?;
        let size = source.metadata.size.ok_or_else(|| CopyError::Probe {
            url: item.url().to_string(),
            reason: "no content length".to_string(),
        })?;

        if let Some(destination) = &destination
            && is_up_to_date(&source.metadata, destination)
        {
            return Ok(Outcome::Skipped);
        }

        let next_type = if size > self.settings.multipart_size {
            WorkType::MultipartStart
        } else {
            WorkType::Single
        };
        let mut next = item.advance(next_type, None);
        next.source_url = source.url;
        next.source_headers = source.headers;
        next.content_length = Some(size);
        next.content_type = source.metadata.content_type;
        next.last_modified = source.metadata.last_modified;
        Ok(Outcome::Prepared(next))
    }

    async fn resolve_source(&self, item: &WorkItem) -> CopyResult<ResolvedSource> {
        let source_file = &item.source_file;
        let no_headers = RequestHeaders::new();

        if let Some(egress_url) = &source_file.egress_url {
            let headers = self.egress_headers(source_file.egress_auth_type.as_deref())?;
            let metadata = self
                .probe
                .probe_url(egress_url, headers.as_ref().unwrap_or(&no_headers))
                .await?;
            return Ok(ResolvedSource {
                url: Some(egress_url.clone()),
                headers,
                metadata,
            });
        }

        if let (Locator::S3(source), Locator::S3(destination)) =
            (&source_file.locator, &item.destination_file.locator)
        {
            match self.native_head(source, destination).await {
                Ok(Some(metadata)) => {
                    return Ok(ResolvedSource {
                        url: None,
                        headers: None,
                        metadata,
                    });
                }
                Ok(None) => debug!(url = %source.url, "not visible with destination credentials"),
                Err(e) => debug!(url = %source.url, error = %e, "native head failed"),
            }
        }

        let public_url = source_file.locator.url();
        match self.http.head(public_url, &no_headers).await {
            Ok(metadata) if metadata.size.is_some() => {
                return Ok(ResolvedSource {
                    url: Some(public_url.to_string()),
                    headers: None,
                    metadata,
                });
            }
            Ok(_) => debug!(url = public_url, "anonymous HEAD gave no size"),
            Err(e) => debug!(url = public_url, error = %e, "anonymous HEAD failed"),
        }

        let signed_url = self.signed_url(&source_file.locator).await?;
        let metadata = self
            .http
            .probe_range(&signed_url, &no_headers)
            .await
            .map_err(|e| CopyError::Probe {
                url: public_url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(ResolvedSource {
            url: Some(signed_url),
            headers: None,
            metadata,
        })
    }

    fn egress_headers(&self, auth_type: Option<&str>) -> CopyResult<Option<RequestHeaders>> {
        match auth_type {
            Some(API_KEY_AUTH) => {
                let key = self.api_key.as_ref().ok_or_else(|| {
                    CopyError::Configuration("egress requires an API key but none is set".into())
                })?;
                Ok(Some(RequestHeaders::from([(
                    API_KEY_HEADER.to_string(),
                    key.clone(),
                )])))
            }
            _ => Ok(None),
        }
    }

    /// Head the source with the destination bucket's credentials.
    async fn native_head(
        &self,
        source: &S3Locator,
        destination: &S3Locator,
    ) -> CopyResult<Option<ObjectMetadata>> {
        let client = self
            .clients
            .get_s3_client(&destination.bucket, source.region.as_deref())
            .await?;
        Ok(client.head_object(source).await?)
    }

    async fn signed_url(&self, locator: &Locator) -> CopyResult<String> {
        let validity = self.settings.signed_url_validity;
        match locator {
            Locator::S3(source) => {
                let client = self.s3_client(source).await?;
                Ok(client.presign_get(source, validity).await?)
            }
            Locator::Blob(source) => {
                let client = self.container_client(source).await?;
                Ok(client.generate_sas_url(&source.blob_name, validity)?)
            }
            Locator::Generic(source) => Ok(source.url.clone()),
        }
    }

    async fn single(&self, item: &WorkItem) -> CopyResult<Outcome> {
        let size = content_length(item)?;
        let content_type = item.content_type.as_deref();

        match &item.destination_file.locator {
            Locator::S3(destination) => {
                let client = self.s3_client(destination).await?;
                let storage_class = item.destination_file.storage_class.as_deref();
                match (&item.source_url, &item.source_file.locator) {
                    (None, Locator::S3(source)) => {
                        client
                            .copy_object(source, destination, content_type, storage_class)
                            .await?
                    }
                    (Some(url), _) => {
                        let body = self.http.get(url, &source_headers(item), None).await?;
                        client
                            .put_object(destination, body, content_type, storage_class)
                            .await?
                    }
                    (None, _) => return Err(missing_source_url(item)),
                }
            }
            Locator::Blob(destination) => {
                let client = self.container_client(destination).await?;
                let url = item
                    .source_url
                    .as_deref()
                    .ok_or_else(|| missing_source_url(item))?;
                if has_source_headers(item) {
                    let body = self.http.get(url, &source_headers(item), None).await?;
                    client
                        .upload(&destination.blob_name, body, content_type)
                        .await?;
                } else {
                    client.copy_from_url(&destination.blob_name, url).await?;
                }
            }
            other => return Err(CopyError::UnsupportedLocator(other.type_name().to_string())),
        }

        Ok(Outcome::SingleDone { bytes: size })
    }

    async fn multipart_start(&self, item: &WorkItem) -> CopyResult<Outcome> {
        let size = content_length(item)?;
        let base = self.settings.multipart_size;

        let (upload_id, segments) = match &item.destination_file.locator {
            Locator::S3(destination) => {
                let client = self.s3_client(destination).await?;
                let upload_id = client
                    .create_multipart_upload(
                        destination,
                        item.content_type.as_deref(),
                        item.destination_file.storage_class.as_deref(),
                    )
                    .await?;
                (upload_id, plan_segments(size, base, S3_MAX_PARTS))
            }
            Locator::Blob(_) => (
                Uuid::new_v4().to_string(),
                plan_segments(size, base, BLOB_MAX_BLOCKS),
            ),
            other => return Err(CopyError::UnsupportedLocator(other.type_name().to_string())),
        };

        debug!(url = item.url(), upload_id, parts = segments.len(), "multipart started");
        Ok(Outcome::MultipartStarted {
            upload_id,
            segments,
        })
    }

    async fn multipart_segment(&self, item: &WorkItem) -> CopyResult<Outcome> {
        let upload_id = item
            .upload_id()
            .ok_or_else(|| CopyError::transfer("segment without upload id"))?
            .to_string();
        let mut segment = item
            .segment()
            .cloned()
            .ok_or_else(|| CopyError::transfer("segment item without a segment"))?;

        match &item.destination_file.locator {
            Locator::S3(destination) => {
                let client = self.s3_client(destination).await?;
                let etag = match (&item.source_url, &item.source_file.locator) {
                    (None, Locator::S3(source)) => {
                        client
                            .upload_part_copy(
                                source,
                                destination,
                                &upload_id,
                                segment.part_number,
                                segment.start,
                                segment.end,
                            )
                            .await?
                    }
                    (Some(url), _) => {
                        let body = self
                            .http
                            .get(url, &source_headers(item), Some((segment.start, segment.end)))
                            .await?;
                        client
                            .upload_part(destination, &upload_id, segment.part_number, body)
                            .await?
                    }
                    (None, _) => return Err(missing_source_url(item)),
                };
                segment.etag = Some(etag);
            }
            Locator::Blob(destination) => {
                let client = self.container_client(destination).await?;
                let url = item
                    .source_url
                    .as_deref()
                    .ok_or_else(|| missing_source_url(item))?;
                let block_id = block_id(&upload_id, segment.part_number);
                if has_source_headers(item) {
                    let body = self
                        .http
                        .get(url, &source_headers(item), Some((segment.start, segment.end)))
                        .await?;
                    client
                        .stage_block(&destination.blob_name, &block_id, body)
                        .await?;
                } else {
                    client
                        .stage_block_from_url(
                            &destination.blob_name,
                            &block_id,
                            url,
                            segment.start,
                            segment.end,
                        )
                        .await?;
                }
                segment.block_id = Some(block_id);
            }
            other => return Err(CopyError::UnsupportedLocator(other.type_name().to_string())),
        }

        Ok(Outcome::SegmentDone { upload_id, segment })
    }

    async fn multipart_complete(
        &self,
        item: &WorkItem,
        segments: Vec<MultipartSegment>,
    ) -> CopyResult<Outcome> {
        if segments.iter().any(|s| !s.is_committed()) {
            tokio::time::sleep(self.settings.complete_retry_delay).await;
            return Ok(Outcome::NotReady);
        }
        let upload_id = item
            .upload_id()
            .ok_or_else(|| CopyError::transfer("complete item without upload id"))?
            .to_string();

        match &item.destination_file.locator {
            Locator::S3(destination) => {
                let parts = segments
                    .iter()
                    .map(|s| CompletedPartInfo {
                        part_number: s.part_number,
                        etag: s.etag.clone().unwrap_or_default(),
                    })
                    .collect::<Vec<_>>();
                let client = self.s3_client(destination).await?;
                client
                    .complete_multipart_upload(destination, &upload_id, &parts)
                    .await?;
            }
            Locator::Blob(destination) => {
                let block_ids = segments
                    .iter()
                    .filter_map(|s| s.block_id.clone())
                    .collect::<Vec<_>>();
                let client = self.container_client(destination).await?;
                client
                    .commit_block_list(
                        &destination.blob_name,
                        &block_ids,
                        item.content_type.as_deref(),
                    )
                    .await?;
            }
            other => return Err(CopyError::UnsupportedLocator(other.type_name().to_string())),
        }

        Ok(Outcome::Completed { upload_id })
    }

    async fn s3_client(&self, locator: &S3Locator) -> CopyResult<Arc<dyn S3Client>> {
        Ok(self
            .clients
            .get_s3_client(&locator.bucket, locator.region.as_deref())
            .await?)
    }

    async fn container_client(&self, locator: &BlobLocator) -> CopyResult<Arc<dyn ContainerClient>> {
        Ok(self
            .clients
            .get_container_client(&locator.account, &locator.container)
            .await?)
    }
}

/// Segment and complete items for a started multipart transfer.
pub(crate) fn expand_multipart(
    item: &WorkItem,
    upload_id: &str,
    segments: &[MultipartSegment],
) -> Vec<WorkItem> {
    let mut items = segments
        .iter()
        .map(|segment| {
            item.advance(
                WorkType::MultipartSegment,
                Some(MultipartData {
                    upload_id: Some(upload_id.to_string()),
                    segment: Some(segment.clone()),
                    segments: None,
                }),
            )
        })
        .collect::<Vec<_>>();
    items.push(item.advance(
        WorkType::MultipartComplete,
        Some(MultipartData {
            upload_id: Some(upload_id.to_string()),
            segment: None,
            segments: None,
        }),
    ));
    items
}

/// Split `content_length` into inclusive ranges.
///
/// The segment size starts at `base_size` and doubles until `max_parts`
/// segments cover the whole object.
pub fn plan_segments(content_length: u64, base_size: u64, max_parts: u64) -> Vec<MultipartSegment> {
    let mut size = base_size.max(1);
    while size.saturating_mul(max_parts) < content_length {
        size *= 2;
    }

    let mut segments = Vec::new();
    let mut start = 0;
    let mut part_number = 1;
    while start < content_length {
        let end = start.saturating_add(size).min(content_length) - 1;
        segments.push(MultipartSegment {
            part_number,
            start,
            end,
            length: end - start + 1,
            etag: None,
            block_id: None,
        });
        start = end + 1;
        part_number += 1;
    }
    segments
}

/// Fixed-length block id, unique per upload and part.
pub fn block_id(upload_id: &str, part_number: u32) -> String {
    let digest = md5::compute(format!("{}-{:05}", upload_id, part_number));
    STANDARD.encode(digest.0)
}

fn content_length(item: &WorkItem) -> CopyResult<u64> {
    item.content_length.ok_or_else(|| CopyError::Probe {
        url: item.url().to_string(),
        reason: "work item has no content length".to_string(),
    })
}

fn has_source_headers(item: &WorkItem) -> bool {
    item.source_headers.as_ref().is_some_and(|h| !h.is_empty())
}

fn source_headers(item: &WorkItem) -> RequestHeaders {
    item.source_headers.clone().unwrap_or_default()
}

fn missing_source_url(item: &WorkItem) -> CopyError {
    CopyError::transfer(format!("no readable url for `{}`", item.url()))
}
