//! Locators identify an object in S3, in Azure Blob Storage, or at a bare URL.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// An object stored in an S3 (or S3-compatible) bucket.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct S3Locator {
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub url: String,
}

/// A blob inside an Azure storage account container.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BlobLocator {
    pub account: String,
    pub container: String,
    pub blob_name: String,
    pub url: String,
}

/// Anything reachable by URL only.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GenericLocator {
    pub url: String,
}

/// Where an object lives.
///
/// Equality is by URL: two locators naming the same URL are the same object,
/// regardless of which variant produced them.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "@type")]
pub enum Locator {
    #[serde(rename = "S3Locator")]
    S3(S3Locator),
    #[serde(rename = "BlobStorageLocator")]
    Blob(BlobLocator),
    #[serde(rename = "Locator")]
    Generic(GenericLocator),
}

/// Cloud family of a locator; used to decide whether native copies are possible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloudFamily {
    S3,
    Blob,
    Http,
}

impl Locator {
    /// Build an S3 locator with a virtual-hosted style URL.
    pub fn s3(bucket: impl Into<String>, key: impl Into<String>, region: Option<String>) -> Self {
        let bucket = bucket.into();
        let key = key.into();
        let url = build_s3_url(&bucket, &key, region.as_deref());
        Locator::S3(S3Locator {
            bucket,
            key,
            region,
            url,
        })
    }

    pub fn blob(
        account: impl Into<String>,
        container: impl Into<String>,
        blob_name: impl Into<String>,
    ) -> Self {
        let account = account.into();
        let container = container.into();
        let blob_name = blob_name.into();
        let url = build_blob_url(&account, &container, &blob_name);
        Locator::Blob(BlobLocator {
            account,
            container,
            blob_name,
            url,
        })
    }

    pub fn generic(url: impl Into<String>) -> Self {
        Locator::Generic(GenericLocator { url: url.into() })
    }

    /// Infer the locator kind from a URL.
    ///
    /// Recognises `https://{bucket}.s3[.{region}].amazonaws.com/{key}` and
    /// `https://{account}.blob.core.windows.net/{container}/{blob}`; everything
    /// else becomes a generic locator.
    pub fn parse(url: &str) -> Self {
        let Ok(parsed) = Url::parse(url) else {
            return Locator::generic(url);
        };
        let Some(host) = parsed.host_str() else {
            return Locator::generic(url);
        };
        let path = decoded_path(&parsed);

        if let Some((account, rest)) = host.split_once(".blob.core.windows.net")
            && rest.is_empty()
            && let Some((container, blob_name)) = path.split_once('/')
        {
            return Locator::Blob(BlobLocator {
                account: account.to_string(),
                container: container.to_string(),
                blob_name: blob_name.to_string(),
                url: url.to_string(),
            });
        }

        if let Some(stripped) = host.strip_suffix(".amazonaws.com")
            && let Some((bucket, service)) = stripped.split_once(".s3")
        {
            let region = service
                .trim_start_matches(['.', '-'])
                .to_string();
            return Locator::S3(S3Locator {
                bucket: bucket.to_string(),
                key: path,
                region: (!region.is_empty()).then_some(region),
                url: url.to_string(),
            });
        }

        Locator::generic(url)
    }

    pub fn url(&self) -> &str {
        match self {
            Locator::S3(l) => &l.url,
            Locator::Blob(l) => &l.url,
            Locator::Generic(l) => &l.url,
        }
    }

    pub fn family(&self) -> CloudFamily {
        match self {
            Locator::S3(_) => CloudFamily::S3,
            Locator::Blob(_) => CloudFamily::Blob,
            Locator::Generic(_) => CloudFamily::Http,
        }
    }

    /// Name of the serialized `@type` tag, used in log lines and problem details.
    pub fn type_name(&self) -> &'static str {
        match self {
            Locator::S3(_) => "S3Locator",
            Locator::Blob(_) => "BlobStorageLocator",
            Locator::Generic(_) => "Locator",
        }
    }

    /// Object key (S3) or blob name (Blob). Generic locators have none.
    pub fn object_path(&self) -> Option<&str> {
        match self {
            Locator::S3(l) => Some(&l.key),
            Locator::Blob(l) => Some(&l.blob_name),
            Locator::Generic(_) => None,
        }
    }

    /// A locator in the same bucket/container with `suffix` appended to the key.
    pub fn with_path_suffix(&self, suffix: &str) -> Option<Locator> {
        match self {
            Locator::S3(l) => Some(Locator::s3(
                l.bucket.clone(),
                format!("{}{}", l.key, suffix),
                l.region.clone(),
            )),
            Locator::Blob(l) => Some(Locator::blob(
                l.account.clone(),
                l.container.clone(),
                format!("{}{}", l.blob_name, suffix),
            )),
            Locator::Generic(_) => None,
        }
    }
}

impl PartialEq for Locator {
    fn eq(&self, other: &Self) -> bool {
        self.url() == other.url()
    }
}

impl Eq for Locator {}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url())
    }
}

pub fn build_s3_url(bucket: &str, key: &str, region: Option<&str>) -> String {
    let host = match region {
        Some(region) if region != "us-east-1" => format!("{}.s3.{}.amazonaws.com", bucket, region),
        _ => format!("{}.s3.amazonaws.com", bucket),
    };
    with_encoded_path(&format!("https://{}", host), key.split('/'))
}

pub fn build_blob_url(account: &str, container: &str, blob_name: &str) -> String {
    let base = format!("https://{}.blob.core.windows.net", account);
    with_encoded_path(
        &base,
        std::iter::once(container).chain(blob_name.split('/')),
    )
}

fn with_encoded_path<'a>(base: &str, segments: impl Iterator<Item = &'a str>) -> String {
    match Url::parse(base) {
        Ok(mut url) => {
            if let Ok(mut path) = url.path_segments_mut() {
                path.clear();
                path.extend(segments);
            }
            url.to_string()
        }
        Err(_) => base.to_string(),
    }
}

fn decoded_path(url: &Url) -> String {
    url.path_segments()
        .map(|segments| {
            segments
                .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}
