//! Azure Blob Storage container access over the Blob REST API.
//!
//! Requests are signed with the account key (SharedKey) or carry the SAS
//! token from the connection string. Read SAS URLs for the copier are minted
//! locally as service SAS tokens.

use crate::services::storage_clients::{
    ListedObject, ObjectListing, ObjectMetadata, StorageError, StorageResult,
};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use reqwest::{
    Method, StatusCode,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use sha2::Sha256;
use std::{collections::BTreeMap, time::Duration};
use tracing::debug;
use url::Url;

const API_VERSION: &str = "2021-08-06";
const SAS_VERSION: &str = "2020-12-06";
const COPY_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// `None` when the blob does not exist.
    async fn get_properties(&self, blob_name: &str) -> StorageResult<Option<ObjectMetadata>>;

    /// Server-side copy from a readable URL; waits for the copy to finish.
    async fn copy_from_url(&self, blob_name: &str, source_url: &str) -> StorageResult<()>;

    /// Stage the inclusive range `start..=end` of `source_url` as a block.
    async fn stage_block_from_url(
        &self,
        blob_name: &str,
        block_id: &str,
        source_url: &str,
        start: u64,
        end: u64,
    ) -> StorageResult<()>;

    async fn stage_block(&self, blob_name: &str, block_id: &str, body: Bytes) -> StorageResult<()>;

    /// Commit blocks in the given order.
    async fn commit_block_list(
        &self,
        blob_name: &str,
        block_ids: &[String],
        content_type: Option<&str>,
    ) -> StorageResult<()>;

    async fn upload(
        &self,
        blob_name: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> StorageResult<()>;

    /// Read-only SAS URL valid for `expires_in`.
    fn generate_sas_url(&self, blob_name: &str, expires_in: Duration) -> StorageResult<String>;

    async fn list_blobs(&self, prefix: &str, marker: Option<String>)
    -> StorageResult<ObjectListing>;
}

/// Parsed `Key=Value;...` storage connection string.
#[derive(Clone, Debug)]
pub struct ConnectionString {
    pub account_name: String,
    pub account_key: Option<Vec<u8>>,
    pub sas_token: Option<String>,
    pub blob_endpoint: String,
}

impl ConnectionString {
    pub fn parse(value: &str) -> StorageResult<Self> {
        let mut parts = BTreeMap::new();
        for pair in value.split(';').filter(|p| !p.trim().is_empty()) {
            let (key, val) = pair
                .split_once('=')
                .ok_or_else(|| StorageError::InvalidConfig(format!("bad segment `{}`", pair)))?;
            parts.insert(key.trim().to_string(), val.trim().to_string());
        }

        let account_name = parts.get("AccountName").cloned().ok_or_else(|| {
            StorageError::InvalidConfig("connection string has no AccountName".into())
        })?;

        let account_key = parts
            .get("AccountKey")
            .map(|key| {
                STANDARD
                    .decode(key)
                    .map_err(|e| StorageError::InvalidConfig(format!("AccountKey: {}", e)))
            })
            .transpose()?;

        let sas_token = parts
            .get("SharedAccessSignature")
            .map(|s| s.trim_start_matches('?').to_string());

        if account_key.is_none() && sas_token.is_none() {
            return Err(StorageError::InvalidConfig(format!(
                "connection string for `{}` has neither AccountKey nor SharedAccessSignature",
                account_name
            )));
        }

        let blob_endpoint = match parts.get("BlobEndpoint") {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => {
                let protocol = parts
                    .get("DefaultEndpointsProtocol")
                    .map(String::as_str)
                    .unwrap_or("https");
                let suffix = parts
                    .get("EndpointSuffix")
                    .map(String::as_str)
                    .unwrap_or("core.windows.net");
                format!("{}://{}.blob.{}", protocol, account_name, suffix)
            }
        };

        Ok(Self {
            account_name,
            account_key,
            sas_token,
            blob_endpoint,
        })
    }
}

/// Blob REST client scoped to one container.
pub struct BlobContainerClient {
    http: reqwest::Client,
    connection: ConnectionString,
    container: String,
}

impl BlobContainerClient {
    pub fn new(http: reqwest::Client, connection: ConnectionString, container: &str) -> Self {
        Self {
            http,
            connection,
            container: container.to_string(),
        }
    }

    fn url(&self, blob_name: Option<&str>, query: &[(&str, &str)]) -> StorageResult<Url> {
        let mut url = Url::parse(&self.connection.blob_endpoint)
            .map_err(|e| StorageError::InvalidConfig(format!("BlobEndpoint: {}", e)))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| StorageError::InvalidConfig("BlobEndpoint cannot be a base".into()))?;
            path.pop_if_empty().push(&self.container);
            if let Some(blob_name) = blob_name {
                path.extend(blob_name.split('/'));
            }
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        mut url: Url,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> StorageResult<reqwest::Response> {
        headers.insert(
            "x-ms-date",
            header_value(&Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string())?,
        );
        headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));

        match (&self.connection.account_key, &self.connection.sas_token) {
            (Some(key), _) => {
                let signature = shared_key_signature(
                    &self.connection.account_name,
                    key,
                    &method,
                    &url,
                    &headers,
                    body.len(),
                )?;
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    header_value(&format!(
                        "SharedKey {}:{}",
                        self.connection.account_name, signature
                    ))?,
                );
            }
            (None, Some(sas)) => {
                let query = match url.query() {
                    Some(existing) => format!("{}&{}", existing, sas),
                    None => sas.clone(),
                };
                url.set_query(Some(&query));
            }
            (None, None) => {}
        }

        debug!(operation, %method, url = %url.path(), "blob request");
        let response = self
            .http
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;
        Ok(response)
    }

    async fn expect_success(
        operation: &'static str,
        response: reqwest::Response,
    ) -> StorageResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        Err(StorageError::Status {
            operation,
            status,
            message,
        })
    }
}

#[async_trait]
impl ContainerClient for BlobContainerClient {
    async fn get_properties(&self, blob_name: &str) -> StorageResult<Option<ObjectMetadata>> {
        let url = self.url(Some(blob_name), &[])?;
        let response = self
            .send("GetBlobProperties", Method::HEAD, url, HeaderMap::new(), Bytes::new())
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::expect_success("GetBlobProperties", response).await?;
        Ok(Some(metadata_from_headers(response.headers())))
    }

    async fn copy_from_url(&self, blob_name: &str, source_url: &str) -> StorageResult<()> {
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-copy-source", header_value(source_url)?);
        let url = self.url(Some(blob_name), &[])?;
        let response = self
            .send("CopyBlob", Method::PUT, url, headers, Bytes::new())
            .await?;
        let response = Self::expect_success("CopyBlob", response).await?;

        let mut status = header_str(response.headers(), "x-ms-copy-status");
        loop {
            match status.as_deref() {
                Some("success") | None => return Ok(()),
                Some("pending") => {
                    tokio::time::sleep(COPY_POLL_INTERVAL).await;
                    let url = self.url(Some(blob_name), &[])?;
                    let response = self
                        .send("GetBlobProperties", Method::HEAD, url, HeaderMap::new(), Bytes::new())
                        .await?;
                    let response = Self::expect_success("GetBlobProperties", response).await?;
                    status = header_str(response.headers(), "x-ms-copy-status");
                }
                Some(other) => {
                    return Err(StorageError::Service {
                        operation: "CopyBlob",
                        message: format!("copy of `{}` ended with status `{}`", blob_name, other),
                    });
                }
            }
        }
    }

    async fn stage_block_from_url(
        &self,
        blob_name: &str,
        block_id: &str,
        source_url: &str,
        start: u64,
        end: u64,
    ) -> StorageResult<()> {
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-copy-source", header_value(source_url)?);
        headers.insert(
            "x-ms-source-range",
            header_value(&format!("bytes={}-{}", start, end))?,
        );
        let url = self.url(Some(blob_name), &[("comp", "block"), ("blockid", block_id)])?;
        let response = self
            .send("PutBlockFromURL", Method::PUT, url, headers, Bytes::new())
            .await?;
        Self::expect_success("PutBlockFromURL", response).await?;
        Ok(())
    }

    async fn stage_block(&self, blob_name: &str, block_id: &str, body: Bytes) -> StorageResult<()> {
        let url = self.url(Some(blob_name), &[("comp", "block"), ("blockid", block_id)])?;
        let response = self
            .send("PutBlock", Method::PUT, url, HeaderMap::new(), body)
            .await?;
        Self::expect_success("PutBlock", response).await?;
        Ok(())
    }

    async fn commit_block_list(
        &self,
        blob_name: &str,
        block_ids: &[String],
        content_type: Option<&str>,
    ) -> StorageResult<()> {
        let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
        for id in block_ids {
            xml.push_str("<Latest>");
            xml.push_str(id);
            xml.push_str("</Latest>");
        }
        xml.push_str("</BlockList>");

        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml"),
        );
        if let Some(content_type) = content_type {
            headers.insert("x-ms-blob-content-type", header_value(content_type)?);
        }
        let url = self.url(Some(blob_name), &[("comp", "blocklist")])?;
        let response = self
            .send("PutBlockList", Method::PUT, url, headers, Bytes::from(xml))
            .await?;
        Self::expect_success("PutBlockList", response).await?;
        Ok(())
    }

    async fn upload(
        &self,
        blob_name: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> StorageResult<()> {
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-blob-type", HeaderValue::from_static("BlockBlob"));
        if let Some(content_type) = content_type {
            headers.insert(reqwest::header::CONTENT_TYPE, header_value(content_type)?);
        }
        let url = self.url(Some(blob_name), &[])?;
        let response = self
            .send("PutBlob", Method::PUT, url, headers, body)
            .await?;
        Self::expect_success("PutBlob", response).await?;
        Ok(())
    }

    fn generate_sas_url(&self, blob_name: &str, expires_in: Duration) -> StorageResult<String> {
        let key = self.connection.account_key.as_ref().ok_or_else(|| {
            StorageError::InvalidConfig(format!(
                "account `{}` has no key to sign a SAS with",
                self.connection.account_name
            ))
        })?;

        let expiry = Utc::now()
            + ChronoDuration::from_std(expires_in)
                .map_err(|e| StorageError::InvalidConfig(e.to_string()))?;
        let expiry = expiry.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let resource = format!(
            "/blob/{}/{}/{}",
            self.connection.account_name, self.container, blob_name
        );

        let string_to_sign = [
            "r",
            "",
            expiry.as_str(),
            resource.as_str(),
            "",
            "",
            "https",
            SAS_VERSION,
            "b",
            "",
            "",
            "",
            "",
            "",
            "",
            "",
        ]
        .join("\n");
        let signature = sign(key, &string_to_sign)?;

        let mut url = self.url(Some(blob_name), &[])?;
        url.query_pairs_mut()
            .append_pair("sv", SAS_VERSION)
            .append_pair("se", &expiry)
            .append_pair("sr", "b")
            .append_pair("sp", "r")
            .append_pair("spr", "https")
            .append_pair("sig", &signature);
        Ok(url.to_string())
    }

    async fn list_blobs(
        &self,
        prefix: &str,
        marker: Option<String>,
    ) -> StorageResult<ObjectListing> {
        let mut query = vec![("restype", "container"), ("comp", "list"), ("prefix", prefix)];
        if let Some(marker) = marker.as_deref() {
            query.push(("marker", marker));
        }
        let url = self.url(None, &query)?;
        let response = self
            .send("ListBlobs", Method::GET, url, HeaderMap::new(), Bytes::new())
            .await?;
        let response = Self::expect_success("ListBlobs", response).await?;
        let body = response.text().await?;
        Ok(parse_blob_listing(&body))
    }
}

fn header_value(value: &str) -> StorageResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| StorageError::InvalidConfig(format!("header value `{}`: {}", value, e)))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn metadata_from_headers(headers: &HeaderMap) -> ObjectMetadata {
    ObjectMetadata {
        size: header_str(headers, "content-length").and_then(|v| v.parse().ok()),
        content_type: header_str(headers, "content-type"),
        etag: header_str(headers, "etag"),
        last_modified: header_str(headers, "last-modified")
            .and_then(|v| DateTime::parse_from_rfc2822(&v).ok())
            .map(|d| d.with_timezone(&Utc)),
        storage_class: header_str(headers, "x-ms-access-tier"),
        restore: None,
    }
}

fn sign(key: &[u8], string_to_sign: &str) -> StorageResult<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| StorageError::InvalidConfig(format!("account key: {}", e)))?;
    mac.update(string_to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// SharedKey signature over the canonicalized request.
fn shared_key_signature(
    account: &str,
    key: &[u8],
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    content_length: usize,
) -> StorageResult<String> {
    let header = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let content_length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let mut ms_headers: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-ms-"))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().trim().to_string(),
            )
        })
        .collect();
    ms_headers.sort();

    let mut query: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        query
            .entry(name.to_lowercase())
            .or_default()
            .push(value.into_owned());
    }

    let mut string_to_sign = format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
        method.as_str(),
        header(reqwest::header::CONTENT_ENCODING),
        header(reqwest::header::CONTENT_LANGUAGE),
        content_length,
        header(HeaderName::from_static("content-md5")),
        header(reqwest::header::CONTENT_TYPE),
        "",
        header(reqwest::header::IF_MODIFIED_SINCE),
        header(reqwest::header::IF_MATCH),
        header(reqwest::header::IF_NONE_MATCH),
        header(reqwest::header::IF_UNMODIFIED_SINCE),
        header(reqwest::header::RANGE),
    );
    for (name, value) in ms_headers {
        string_to_sign.push_str(&format!("{}:{}\n", name, value));
    }
    string_to_sign.push_str(&format!("/{}{}", account, url.path()));
    for (name, mut values) in query {
        values.sort();
        string_to_sign.push_str(&format!("\n{}:{}", name, values.join(",")));
    }

    sign(key, &string_to_sign)
}

fn tag_contents<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        match after.find(&close) {
            Some(end) => {
                values.push(&after[..end]);
                rest = &after[end + close.len()..];
            }
            None => break,
        }
    }
    values
}

fn unescape_xml(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn parse_blob_listing(xml: &str) -> ObjectListing {
    let objects = tag_contents(xml, "Blob")
        .into_iter()
        .filter_map(|blob| {
            let name = tag_contents(blob, "Name").first().map(|n| unescape_xml(n))?;
            let size = tag_contents(blob, "Content-Length")
                .first()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let storage_class = tag_contents(blob, "AccessTier")
                .first()
                .map(|s| s.to_string());
            Some(ListedObject {
                key: name,
                size,
                storage_class,
            })
        })
        .collect();

    let next_token = tag_contents(xml, "NextMarker")
        .first()
        .filter(|m| !m.is_empty())
        .map(|m| m.to_string());

    ObjectListing {
        objects,
        next_token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connection_string_with_key() {
        let cs = ConnectionString::parse(
            "DefaultEndpointsProtocol=https;AccountName=media;AccountKey=c2VjcmV0;EndpointSuffix=core.windows.net",
        )
        .unwrap();
        assert_eq!(cs.account_name, "media");
        assert_eq!(cs.account_key.as_deref(), Some(&b"secret"[..]));
        assert_eq!(cs.blob_endpoint, "https://media.blob.core.windows.net");
    }

    #[test]
    fn connection_string_without_credentials_is_rejected() {
        assert!(ConnectionString::parse("AccountName=media").is_err());
    }

    #[test]
    fn sas_url_is_read_only_blob_scoped() {
        let cs = ConnectionString::parse("AccountName=media;AccountKey=c2VjcmV0").unwrap();
        let client = BlobContainerClient::new(reqwest::Client::new(), cs, "videos");
        let url = client
            .generate_sas_url("in/clip.mxf", Duration::from_secs(3600))
            .unwrap();
        let parsed = Url::parse(&url).unwrap();

        assert_eq!(parsed.path(), "/videos/in/clip.mxf");
        let query: BTreeMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(query["sp"], "r");
        assert_eq!(query["sr"], "b");
        assert_eq!(query["sv"], SAS_VERSION);
        assert!(query.contains_key("sig"));
    }

    #[test]
    fn blob_listing_reads_names_sizes_and_marker() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
            <EnumerationResults><Blobs>
              <Blob><Name>in/a&amp;b.mxf</Name><Properties><Content-Length>10</Content-Length><AccessTier>Hot</AccessTier></Properties></Blob>
              <Blob><Name>in/c.mxf</Name><Properties><Content-Length>20</Content-Length></Properties></Blob>
            </Blobs><NextMarker>abc</NextMarker></EnumerationResults>"#;
        let listing = parse_blob_listing(xml);
        assert_eq!(listing.objects.len(), 2);
        assert_eq!(listing.objects[0].key, "in/a&b.mxf");
        assert_eq!(listing.objects[0].size, 10);
        assert_eq!(listing.objects[0].storage_class.as_deref(), Some("Hot"));
        assert_eq!(listing.next_token.as_deref(), Some("abc"));
    }

    #[test]
    fn empty_next_marker_ends_listing() {
        let listing = parse_blob_listing("<EnumerationResults><Blobs></Blobs><NextMarker /></EnumerationResults>");
        assert!(listing.objects.is_empty());
        assert!(listing.next_token.is_none());
    }
}
