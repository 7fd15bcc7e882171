//! Folder listing shared by the folder copy and restore profiles.

use crate::{
    errors::{CopyError, CopyResult},
    models::{
        locator::Locator,
        work_item::{DestinationFile, SourceFile},
    },
    services::storage_clients::{ListedObject, StorageClientFactory},
};
use tracing::debug;

/// Every object under `folder`, across all listing pages.
///
/// Keys ending in `/` are folder placeholders and are left out.
pub async fn list_folder(
    clients: &StorageClientFactory,
    folder: &Locator,
) -> CopyResult<Vec<ListedObject>> {
    let mut objects = Vec::new();
    match folder {
        Locator::S3(l) => {
            let client = clients.get_s3_client(&l.bucket, l.region.as_deref()).await?;
            let mut token = None;
            loop {
                let page = client.list_objects(&l.bucket, &l.key, token).await?;
                objects.extend(page.objects);
                token = page.next_token;
                if token.is_none() {
                    break;
                }
            }
        }
        Locator::Blob(l) => {
            let client = clients.get_container_client(&l.account, &l.container).await?;
            let mut marker = None;
            loop {
                let page = client.list_blobs(&l.blob_name, marker).await?;
                objects.extend(page.objects);
                marker = page.next_token;
                if marker.is_none() {
                    break;
                }
            }
        }
        Locator::Generic(_) => {
            return Err(CopyError::UnsupportedLocator(folder.type_name().to_string()));
        }
    }
    objects.retain(|o| !o.key.ends_with('/'));
    debug!(folder = folder.url(), objects = objects.len(), "listed folder");
    Ok(objects)
}

/// Source/destination pairs mirroring `source_folder` under `destination_folder`.
///
/// With an egress URL, each source is read from the egress URL joined with
/// its path relative to the folder.
pub async fn expand_folder(
    clients: &StorageClientFactory,
    source_folder: &Locator,
    destination_folder: &Locator,
    egress_url: Option<&str>,
) -> CopyResult<Vec<(SourceFile, DestinationFile)>> {
    let prefix = source_folder.object_path().unwrap_or_default();
    let objects = list_folder(clients, source_folder).await?;

    let mut pairs = Vec::with_capacity(objects.len());
    for object in objects {
        let relative = object.key.strip_prefix(prefix).unwrap_or(&object.key);
        let source_locator = nested(source_folder, relative)?;
        let destination_locator = nested(destination_folder, relative)?;

        let mut source = SourceFile::new(source_locator);
        source.egress_url = egress_url.map(|url| format!("{}{}", url, relative));
        pairs.push((source, DestinationFile::new(destination_locator)));
    }
    Ok(pairs)
}

fn nested(folder: &Locator, relative: &str) -> CopyResult<Locator> {
    folder
        .with_path_suffix(relative)
        .ok_or_else(|| CopyError::UnsupportedLocator(folder.type_name().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestStorage;

    #[tokio::test]
    async fn folder_is_mirrored_relative_to_its_prefix() {
        let storage = TestStorage::new();
        storage.s3.add_object("media", "in/a.mxf", 10, "video/mxf");
        storage.s3.add_object("media", "in/sub/b.mxf", 20, "video/mxf");
        storage.s3.add_object("media", "in/sub/", 0, "application/x-directory");
        storage.s3.add_object("media", "other/c.mxf", 30, "video/mxf");

        let mut pairs = expand_folder(
            &storage.factory,
            &Locator::s3("media", "in/", None),
            &Locator::s3("archive", "2024/", None),
            Some("https://egress.example.com/in/"),
        )
        .await
        .unwrap();
        pairs.sort_by(|a, b| a.0.locator.url().cmp(b.0.locator.url()));

        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0.locator, Locator::s3("media", "in/a.mxf", None));
        assert_eq!(pairs[0].1.locator, Locator::s3("archive", "2024/a.mxf", None));
        assert_eq!(
            pairs[0].0.egress_url.as_deref(),
            Some("https://egress.example.com/in/a.mxf")
        );
        assert_eq!(pairs[1].1.locator, Locator::s3("archive", "2024/sub/b.mxf", None));
    }

    #[tokio::test]
    async fn blob_folder_is_listed_through_the_container() {
        let storage = TestStorage::new();
        storage.blob.add_blob("in/a.mxf", 10);
        storage.blob.add_blob("in/b.mxf", 10);
        storage.blob.add_blob("out/c.mxf", 10);

        let objects = list_folder(&storage.factory, &Locator::blob("acct", "videos", "in/"))
            .await
            .unwrap();
        let mut keys: Vec<_> = objects.into_iter().map(|o| o.key).collect();
        keys.sort();
        assert_eq!(keys, vec!["in/a.mxf", "in/b.mxf"]);
    }

    #[tokio::test]
    async fn generic_folders_are_rejected() {
        let storage = TestStorage::new();
        let err = list_folder(&storage.factory, &Locator::generic("https://example.com/in/"))
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::UnsupportedLocator(_)));
    }
}
