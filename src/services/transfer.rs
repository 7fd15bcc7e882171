//! One-shot copy of a single file, choosing the cheapest working path.
//!
//! Paths are tried in order: egress URL, native same-cloud copy, anonymous
//! pull of the public URL, pull through a signed (S3) or SAS (Blob) URL. A
//! failing path is logged and the next one is tried.

use crate::{
    errors::{CopyError, CopyResult},
    models::{
        locator::{Locator, S3Locator},
        work_item::{DestinationFile, SourceFile},
    },
    services::{
        file_copier::{
            DEFAULT_MULTIPART_SIZE,
            work::{BLOB_MAX_BLOCKS, S3_MAX_PARTS, block_id, plan_segments},
        },
        http_source::{HttpSource, RequestHeaders},
        probe::{ObjectProbe, is_up_to_date},
        s3::{CompletedPartInfo, S3Client},
        storage_clients::{ObjectMetadata, StorageClientFactory},
    },
};
use futures::{StreamExt, TryStreamExt, stream};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

const SIGNED_URL_VALIDITY: Duration = Duration::from_secs(3600);
const NATIVE_PART_CONCURRENCY: usize = 16;
const UPLOAD_PART_CONCURRENCY: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    Copied { bytes: u64 },
    Skipped,
}

/// Where the bytes are read from.
enum Route {
    Native(S3Locator),
    Url {
        url: String,
        headers: RequestHeaders,
    },
}

#[derive(Clone)]
pub struct TransferSelector {
    clients: Arc<StorageClientFactory>,
    http: Arc<dyn HttpSource>,
    probe: ObjectProbe,
    api_key: Option<String>,
}

impl TransferSelector {
    pub fn new(
        clients: Arc<StorageClientFactory>,
        http: Arc<dyn HttpSource>,
        api_key: Option<String>,
    ) -> Self {
        let probe = ObjectProbe::new(clients.clone(), http.clone());
        Self {
            clients,
            http,
            probe,
            api_key,
        }
    }

    pub async fn copy_file(
        &self,
        source: &SourceFile,
        destination: &DestinationFile,
    ) -> CopyResult<TransferOutcome> {
        let egress_headers = self.egress_headers(source)?;
        let metadata = match &source.egress_url {
            Some(url) => self.probe.probe_url(url, &egress_headers).await?,
            None => self.probe.probe(&source.locator).await?,
        };
        let size = metadata.size.ok_or_else(|| CopyError::Probe {
            url: source.locator.url().to_string(),
            reason: "no content length".to_string(),
        })?;

        let existing = self.probe.destination_head(&destination.locator).await?;
        if let Some(existing) = &existing
            && is_up_to_date(&metadata, existing)
        {
            info!(
                source = source.locator.url(),
                destination = destination.locator.url(),
                "destination is up to date, skipping"
            );
            return Ok(TransferOutcome::Skipped);
        }

        for route in self.routes(source, destination, egress_headers).await {
            let label = match &route {
                Route::Native(_) => "native copy",
                Route::Url { .. } => "url pull",
            };
            match self.copy_via(&route, destination, &metadata, size).await {
                Ok(()) => return Ok(TransferOutcome::Copied { bytes: size }),
                Err(e) => warn!(
                    source = source.locator.url(),
                    destination = destination.locator.url(),
                    route = label,
                    error = %e,
                    "transfer attempt failed"
                ),
            }
        }

        Err(CopyError::UnsupportedTransfer {
            from: source.locator.url().to_string(),
            to: destination.locator.url().to_string(),
        })
    }

    fn egress_headers(&self, source: &SourceFile) -> CopyResult<RequestHeaders> {
        match source.egress_auth_type.as_deref() {
            Some("McmaApiKey") => {
                let key = self.api_key.clone().ok_or_else(|| {
                    CopyError::Configuration("egress requires an API key but none is set".into())
                })?;
                Ok(RequestHeaders::from([("x-mcma-api-key".to_string(), key)]))
            }
            _ => Ok(RequestHeaders::new()),
        }
    }

    async fn routes(
        &self,
        source: &SourceFile,
        destination: &DestinationFile,
        egress_headers: RequestHeaders,
    ) -> Vec<Route> {
        let mut routes = Vec::new();
        if let Some(url) = &source.egress_url {
            routes.push(Route::Url {
                url: url.clone(),
                headers: egress_headers,
            });
        }
        if let (Locator::S3(from), Locator::S3(_)) = (&source.locator, &destination.locator) {
            routes.push(Route::Native(from.clone()));
        }
        routes.push(Route::Url {
            url: source.locator.url().to_string(),
            headers: RequestHeaders::new(),
        });
        match self.signed_url(&source.locator).await {
            Ok(Some(url)) => routes.push(Route::Url {
                url,
                headers: RequestHeaders::new(),
            }),
            Ok(None) => {}
            Err(e) => debug!(url = source.locator.url(), error = %e, "no signed url"),
        }
        routes
    }

    async fn signed_url(&self, locator: &Locator) -> CopyResult<Option<String>> {
        match locator {
            Locator::S3(l) => {
                let client = self
                    .clients
                    .get_s3_client(&l.bucket, l.region.as_deref())
                    .await?;
                Ok(Some(client.presign_get(l, SIGNED_URL_VALIDITY).await?))
            }
            Locator::Blob(l) => {
                let client = self
                    .clients
                    .get_container_client(&l.account, &l.container)
                    .await?;
                Ok(Some(client.generate_sas_url(&l.blob_name, SIGNED_URL_VALIDITY)?))
            }
            Locator::Generic(_) => Ok(None),
        }
    }

    async fn copy_via(
        &self,
        route: &Route,
        destination: &DestinationFile,
        metadata: &ObjectMetadata,
        size: u64,
    ) -> CopyResult<()> {
        let content_type = metadata.content_type.as_deref();
        let storage_class = destination.storage_class.as_deref();
        let single = size < 2 * DEFAULT_MULTIPART_SIZE;

        match (&destination.locator, route) {
            (Locator::S3(target), Route::Native(source)) => {
                let client = self
                    .clients
                    .get_s3_client(&target.bucket, source.region.as_deref())
                    .await?;
                if single {
                    client
                        .copy_object(source, target, content_type, storage_class)
                        .await?;
                    return Ok(());
                }
                self.multipart_to_s3(
                    client,
                    target,
                    size,
                    content_type,
                    storage_class,
                    NATIVE_PART_CONCURRENCY,
                    |client, upload_id, (part_number, start, end)| {
                        let source = source.clone();
                        let target = target.clone();
                        async move {
                            client
                                .upload_part_copy(
                                    &source,
                                    &target,
                                    &upload_id,
                                    part_number,
                                    start,
                                    end,
                                )
                                .await
                                .map_err(CopyError::from)
                        }
                    },
                )
                .await
            }
            (Locator::S3(target), Route::Url { url, headers }) => {
                let client = self
                    .clients
                    .get_s3_client(&target.bucket, target.region.as_deref())
                    .await?;
                if single {
                    let body = self.http.get(url, headers, None).await?;
                    client
                        .put_object(target, body, content_type, storage_class)
                        .await?;
                    return Ok(());
                }
                let http = self.http.clone();
                self.multipart_to_s3(
                    client,
                    target,
                    size,
                    content_type,
                    storage_class,
                    UPLOAD_PART_CONCURRENCY,
                    |client, upload_id, (part_number, start, end)| {
                        let http = http.clone();
                        let target = target.clone();
                        let url = url.clone();
                        let headers = headers.clone();
                        async move {
                            let body = http.get(&url, &headers, Some((start, end))).await?;
                            client
                                .upload_part(&target, &upload_id, part_number, body)
                                .await
                                .map_err(CopyError::from)
                        }
                    },
                )
                .await
            }
            (Locator::Blob(target), Route::Url { url, headers }) => {
                let client = self
                    .clients
                    .get_container_client(&target.account, &target.container)
                    .await?;
                if headers.is_empty() {
                    client.copy_from_url(&target.blob_name, url).await?;
                    return Ok(());
                }
                if single {
                    let body = self.http.get(url, headers, None).await?;
                    client.upload(&target.blob_name, body, content_type).await?;
                    return Ok(());
                }

                let upload_id = uuid::Uuid::new_v4().to_string();
                let segments = plan_segments(size, DEFAULT_MULTIPART_SIZE, BLOB_MAX_BLOCKS);
                let block_ids = segments
                    .iter()
                    .map(|s| block_id(&upload_id, s.part_number))
                    .collect::<Vec<_>>();
                stream::iter(segments.iter().cloned().zip(block_ids.iter().cloned()))
                    .map(|(segment, id)| {
                        let client = client.clone();
                        async move {
                            let body = self
                                .http
                                .get(url, headers, Some((segment.start, segment.end)))
                                .await?;
                            client.stage_block(&target.blob_name, &id, body).await?;
                            Ok::<_, CopyError>(())
                        }
                    })
                    .buffer_unordered(UPLOAD_PART_CONCURRENCY)
                    .try_collect::<Vec<_>>()
                    .await?;
                client
                    .commit_block_list(&target.blob_name, &block_ids, content_type)
                    .await?;
                Ok(())
            }
            (Locator::Blob(_), Route::Native(_)) => Err(CopyError::transfer(
                "native copy into blob storage is not available",
            )),
            (other, _) => Err(CopyError::UnsupportedLocator(other.type_name().to_string())),
        }
    }

    /// Multipart upload with bounded part concurrency; aborted on any failure.
    #[allow(clippy::too_many_arguments)]
    async fn multipart_to_s3<F, Fut>(
        &self,
        client: Arc<dyn S3Client>,
        target: &S3Locator,
        size: u64,
        content_type: Option<&str>,
        storage_class: Option<&str>,
        concurrency: usize,
        copy_part: F,
    ) -> CopyResult<()>
    where
        F: Fn(Arc<dyn S3Client>, String, (u32, u64, u64)) -> Fut,
        Fut: std::future::Future<Output = CopyResult<String>>,
    {
        let upload_id = client
            .create_multipart_upload(target, content_type, storage_class)
            .await?;
        let segments = plan_segments(size, DEFAULT_MULTIPART_SIZE, S3_MAX_PARTS);

        let part_ranges: Vec<(u32, u64, u64)> = segments
            .iter()
            .map(|s| (s.part_number, s.start, s.end))
            .collect();
        let parts = stream::iter(part_ranges)
            .map(|part| {
                let etag = copy_part(client.clone(), upload_id.clone(), part);
                async move {
                    etag.await.map(|etag| CompletedPartInfo {
                        part_number: part.0,
                        etag,
                    })
                }
            })
            .buffer_unordered(concurrency)
            .try_collect::<Vec<_>>()
            .await;

        let result = match parts {
            Ok(mut parts) => {
                parts.sort_by_key(|p| p.part_number);
                client
                    .complete_multipart_upload(target, &upload_id, &parts)
                    .await
                    .map_err(CopyError::from)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!(url = %target.url, upload_id, error = %e, "aborting multipart upload");
            if let Err(abort_error) = client.abort_multipart_upload(target, &upload_id).await {
                warn!(url = %target.url, upload_id, error = %abort_error, "abort failed");
            }
        }
        result
    }
}
