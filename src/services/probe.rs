//! Object metadata probing: cloud head call, anonymous HEAD, then a one-byte ranged GET.

use crate::{
    errors::{CopyError, CopyResult},
    models::locator::Locator,
    services::{
        http_source::{HttpSource, RequestHeaders},
        storage_clients::{ObjectMetadata, StorageClientFactory, StorageError, StorageResult},
    },
};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ObjectProbe {
    clients: Arc<StorageClientFactory>,
    http: Arc<dyn HttpSource>,
}

impl ObjectProbe {
    pub fn new(clients: Arc<StorageClientFactory>, http: Arc<dyn HttpSource>) -> Self {
        Self { clients, http }
    }

    /// Metadata of `locator`, guaranteed to carry a size.
    pub async fn probe(&self, locator: &Locator) -> CopyResult<ObjectMetadata> {
        match self.cloud_head(locator).await {
            Ok(Some(metadata)) if metadata.size.is_some() => return Ok(metadata),
            Ok(_) => debug!(url = locator.url(), "cloud head gave no size"),
            Err(e) => debug!(url = locator.url(), error = %e, "cloud head failed"),
        }
        self.probe_url(locator.url(), &RequestHeaders::new()).await
    }

    /// Metadata of a plain URL: HEAD, then `bytes=0-0` when HEAD gives no size.
    pub async fn probe_url(&self, url: &str, headers: &RequestHeaders) -> CopyResult<ObjectMetadata> {
        let head = match self.http.head(url, headers).await {
            Ok(metadata) if metadata.size.is_some() => return Ok(metadata),
            Ok(metadata) => Some(metadata),
            Err(e) => {
                debug!(url, error = %e, "HEAD failed");
                None
            }
        };

        match self.http.probe_range(url, headers).await {
            Ok(mut metadata) => {
                if let Some(head) = head {
                    metadata.content_type = head.content_type.or(metadata.content_type);
                    metadata.etag = head.etag.or(metadata.etag);
                    metadata.last_modified = head.last_modified.or(metadata.last_modified);
                }
                Ok(metadata)
            }
            Err(e) => Err(CopyError::Probe {
                url: url.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Head call through the client configured for the locator's bucket or account.
    ///
    /// `None` when the object does not exist. Generic locators have no cloud head.
    pub async fn cloud_head(&self, locator: &Locator) -> StorageResult<Option<ObjectMetadata>> {
        match locator {
            Locator::S3(l) => {
                let client = self
                    .clients
                    .get_s3_client(&l.bucket, l.region.as_deref())
                    .await?;
                client.head_object(l).await
            }
            Locator::Blob(l) => {
                let client = self
                    .clients
                    .get_container_client(&l.account, &l.container)
                    .await?;
                client.get_properties(&l.blob_name).await
            }
            Locator::Generic(_) => Ok(None),
        }
    }

    /// Existing destination metadata for the up-to-date check.
    ///
    /// Only a missing client configuration is an error; a failed head call
    /// (403 on a missing key without list permission, throttling) reads as
    /// no destination.
    pub async fn destination_head(
        &self,
        locator: &Locator,
    ) -> StorageResult<Option<ObjectMetadata>> {
        match self.cloud_head(locator).await {
            Ok(metadata) => Ok(metadata),
            Err(
                e @ (StorageError::NotConfigured { .. }
                | StorageError::InvalidConfig(_)
                | StorageError::Io(_)),
            ) => Err(e),
            Err(e) => {
                warn!(url = locator.url(), error = %e, "destination head failed, copying anyway");
                Ok(None)
            }
        }
    }
}

/// Whether `destination` already holds the same content as `source`.
///
/// Same size, same content type and a destination at least as recent as the
/// source, or an identical etag.
pub fn is_up_to_date(source: &ObjectMetadata, destination: &ObjectMetadata) -> bool {
    let same_content = source.size.is_some()
        && source.size == destination.size
        && source.content_type == destination.content_type
        && matches!(
            (source.last_modified, destination.last_modified),
            (Some(src), Some(dst)) if dst >= src
        );
    let same_etag = source.etag.is_some() && source.etag == destination.etag;
    same_content || same_etag
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeHttp, TestStorage};
    use chrono::{Duration, TimeZone, Utc};

    fn metadata(size: u64, content_type: &str, modified_hour: u32) -> ObjectMetadata {
        ObjectMetadata {
            size: Some(size),
            content_type: Some(content_type.into()),
            last_modified: Some(Utc.with_ymd_and_hms(2024, 1, 1, modified_hour, 0, 0).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn newer_identical_destination_is_up_to_date() {
        let source = metadata(10, "video/mp4", 1);
        assert!(is_up_to_date(&source, &metadata(10, "video/mp4", 2)));
        assert!(is_up_to_date(&source, &metadata(10, "video/mp4", 1)));
    }

    #[test]
    fn older_or_different_destination_is_copied() {
        let source = metadata(10, "video/mp4", 2);
        assert!(!is_up_to_date(&source, &metadata(10, "video/mp4", 1)));
        assert!(!is_up_to_date(&source, &metadata(11, "video/mp4", 3)));
        assert!(!is_up_to_date(&source, &metadata(10, "video/mxf", 3)));
    }

    #[test]
    fn matching_etag_wins_regardless_of_dates() {
        let mut source = metadata(10, "video/mp4", 5);
        source.etag = Some("\"abc\"".into());
        let mut destination = metadata(99, "text/plain", 1);
        destination.etag = Some("\"abc\"".into());
        assert!(is_up_to_date(&source, &destination));

        destination.last_modified = destination.last_modified.map(|d| d - Duration::days(1));
        destination.etag = None;
        assert!(!is_up_to_date(&source, &destination));
    }

    #[tokio::test]
    async fn generic_locator_falls_back_to_ranged_get() {
        let storage = TestStorage::new();
        storage.http.add_object("https://cdn.example.com/a.mp4", 1234, false);
        let probe = ObjectProbe::new(storage.factory.clone(), storage.http.clone());

        let metadata = probe
            .probe(&Locator::generic("https://cdn.example.com/a.mp4"))
            .await
            .unwrap();
        assert_eq!(metadata.size, Some(1234));
        assert_eq!(storage.http.range_probes(), 1);
    }

    #[tokio::test]
    async fn failed_destination_head_reads_as_absent() {
        let storage = TestStorage::new();
        storage.s3.add_object("archive", "out/a.mp4", 10, "video/mp4");
        storage.s3.fail_next("HeadObject", 1);
        let probe = ObjectProbe::new(storage.factory.clone(), storage.http.clone());

        let metadata = probe
            .destination_head(&Locator::s3("archive", "out/a.mp4", None))
            .await
            .unwrap();
        assert_eq!(metadata, None);
    }

    #[tokio::test]
    async fn unconfigured_destination_is_still_an_error() {
        let storage = TestStorage::new();
        let probe = ObjectProbe::new(storage.factory.clone(), storage.http.clone());

        let err = probe
            .destination_head(&Locator::s3("unknown-bucket", "out/a.mp4", None))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn missing_object_is_a_probe_error() {
        let http = Arc::new(FakeHttp::default());
        let storage = TestStorage::with_http(http.clone());
        let probe = ObjectProbe::new(storage.factory.clone(), http);
        let err = probe
            .probe(&Locator::generic("https://cdn.example.com/none"))
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::Probe { .. }));
    }
}
