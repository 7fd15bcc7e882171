//! Plain HTTP access to sources: public URLs, signed URLs and egress endpoints.

use crate::services::storage_clients::ObjectMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, header::HeaderMap};
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("`{url}` responded with status {status}")]
    Status { url: String, status: u16 },
    #[error("`{url}` did not report a usable Content-Range")]
    MissingContentRange { url: String },
    #[error("invalid header `{0}`")]
    InvalidHeader(String),
}

pub type HttpResult<T> = Result<T, HttpError>;

/// Extra request headers, e.g. the egress API key.
pub type RequestHeaders = BTreeMap<String, String>;

#[async_trait]
pub trait HttpSource: Send + Sync {
    /// HEAD the URL. Size is `None` when the server omits Content-Length.
    async fn head(&self, url: &str, headers: &RequestHeaders) -> HttpResult<ObjectMetadata>;

    /// GET `bytes=0-0` and take the size from the `Content-Range` total.
    async fn probe_range(&self, url: &str, headers: &RequestHeaders)
    -> HttpResult<ObjectMetadata>;

    /// Download the whole body, or the inclusive range `start..=end`.
    async fn get(
        &self,
        url: &str,
        headers: &RequestHeaders,
        range: Option<(u64, u64)>,
    ) -> HttpResult<Bytes>;
}

/// `HttpSource` over a shared reqwest client.
pub struct ReqwestHttpSource {
    http: reqwest::Client,
}

impl ReqwestHttpSource {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Client used for all outbound calls of the service.
    pub fn build_client(timeout: Duration) -> HttpResult<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()?)
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: &RequestHeaders,
    ) -> HttpResult<reqwest::RequestBuilder> {
        let mut builder = self.http.request(method, url);
        for (name, value) in headers {
            reqwest::header::HeaderValue::from_str(value)
                .map_err(|_| HttpError::InvalidHeader(name.clone()))?;
            builder = builder.header(name.as_str(), value.as_str());
        }
        Ok(builder)
    }

    fn check(url: &str, response: reqwest::Response) -> HttpResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(HttpError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl HttpSource for ReqwestHttpSource {
    async fn head(&self, url: &str, headers: &RequestHeaders) -> HttpResult<ObjectMetadata> {
        debug!(url, "HEAD");
        let response = self
            .request(reqwest::Method::HEAD, url, headers)?
            .send()
            .await?;
        let response = Self::check(url, response)?;
        let mut metadata = metadata_from_headers(response.headers());
        metadata.size = header(response.headers(), "content-length").and_then(|v| v.parse().ok());
        Ok(metadata)
    }

    async fn probe_range(
        &self,
        url: &str,
        headers: &RequestHeaders,
    ) -> HttpResult<ObjectMetadata> {
        debug!(url, "GET bytes=0-0");
        let response = self
            .request(reqwest::Method::GET, url, headers)?
            .header(reqwest::header::RANGE, "bytes=0-0")
            .send()
            .await?;
        let response = Self::check(url, response)?;

        let mut metadata = metadata_from_headers(response.headers());
        metadata.size = if response.status() == StatusCode::PARTIAL_CONTENT {
            header(response.headers(), "content-range").and_then(|v| content_range_total(&v))
        } else {
            // Range ignored: the whole body is coming back.
            header(response.headers(), "content-length").and_then(|v| v.parse().ok())
        };
        if metadata.size.is_none() {
            return Err(HttpError::MissingContentRange {
                url: url.to_string(),
            });
        }
        Ok(metadata)
    }

    async fn get(
        &self,
        url: &str,
        headers: &RequestHeaders,
        range: Option<(u64, u64)>,
    ) -> HttpResult<Bytes> {
        let mut request = self.request(reqwest::Method::GET, url, headers)?;
        if let Some((start, end)) = range {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-{}", start, end));
        }
        let response = Self::check(url, request.send().await?)?;
        Ok(response.bytes().await?)
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn metadata_from_headers(headers: &HeaderMap) -> ObjectMetadata {
    ObjectMetadata {
        size: None,
        content_type: header(headers, "content-type"),
        etag: header(headers, "etag"),
        last_modified: header(headers, "last-modified")
            .and_then(|v| DateTime::parse_from_rfc2822(&v).ok())
            .map(|d| d.with_timezone(&Utc)),
        storage_class: None,
        restore: None,
    }
}

/// Total size from `bytes 0-0/12345`; `*` totals are unknown.
pub fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total_is_parsed() {
        assert_eq!(content_range_total("bytes 0-0/209715200"), Some(209_715_200));
        assert_eq!(content_range_total("bytes 0-0/*"), None);
        assert_eq!(content_range_total("garbage"), None);
    }
}
