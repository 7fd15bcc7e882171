//! StorageClientFactory resolves a bucket or storage account to an
//! authenticated client, loading credentials from the storage secret on first
//! use and caching one client per `(bucket, region)` / `(account, container)`.

use crate::services::{
    azure::{BlobContainerClient, ConnectionString, ContainerClient},
    s3::{AwsS3Client, S3Client},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no {kind} configuration for `{name}`")]
    NotConfigured { kind: &'static str, name: String },
    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),
    #[error("{operation} failed: {message}")]
    Service {
        operation: &'static str,
        message: String,
    },
    #[error("{operation} returned status {status}: {message}")]
    Status {
        operation: &'static str,
        status: u16,
        message: String,
    },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Metadata common to S3 objects and blobs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectMetadata {
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub storage_class: Option<String>,
    /// Raw archive restore status, e.g. `ongoing-request="false"`.
    pub restore: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    pub storage_class: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ObjectListing {
    pub objects: Vec<ListedObject>,
    pub next_token: Option<String>,
}

/// Storage secret: per-bucket AWS settings and per-account Azure connection strings.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct StorageClientConfig {
    #[serde(default)]
    pub aws: HashMap<String, AwsBucketConfig>,
    #[serde(default)]
    pub azure: HashMap<String, AzureAccountConfig>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct AwsBucketConfig {
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AzureAccountConfig {
    pub connection_string: String,
}

/// Source of the storage secret document.
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn get_secret(&self) -> StorageResult<String>;
}

/// Reads the storage secret from a JSON file.
///
/// Without a path the secret is empty and every lookup fails.
pub struct FileSecretsProvider {
    path: Option<PathBuf>,
}

impl FileSecretsProvider {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl SecretsProvider for FileSecretsProvider {
    async fn get_secret(&self) -> StorageResult<String> {
        match &self.path {
            Some(path) => {
                info!("Loading storage client configuration from {}", path.display());
                Ok(tokio::fs::read_to_string(path).await?)
            }
            None => Ok("{}".to_string()),
        }
    }
}

/// Constructs concrete clients from resolved configuration.
#[async_trait]
pub trait ClientBuilder: Send + Sync {
    async fn build_s3(
        &self,
        config: &AwsBucketConfig,
        region: &str,
    ) -> StorageResult<Arc<dyn S3Client>>;

    fn build_container(
        &self,
        account: &str,
        container: &str,
        config: &AzureAccountConfig,
    ) -> StorageResult<Arc<dyn ContainerClient>>;
}

/// Builds AWS SDK clients and REST Blob clients.
pub struct SdkClientBuilder {
    http: reqwest::Client,
}

impl SdkClientBuilder {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ClientBuilder for SdkClientBuilder {
    async fn build_s3(
        &self,
        config: &AwsBucketConfig,
        region: &str,
    ) -> StorageResult<Arc<dyn S3Client>> {
        Ok(Arc::new(AwsS3Client::new(config, region).await))
    }

    fn build_container(
        &self,
        account: &str,
        container: &str,
        config: &AzureAccountConfig,
    ) -> StorageResult<Arc<dyn ContainerClient>> {
        let connection = ConnectionString::parse(&config.connection_string)?;
        if connection.account_name != account {
            return Err(StorageError::InvalidConfig(format!(
                "connection string for `{}` names account `{}`",
                account, connection.account_name
            )));
        }
        Ok(Arc::new(BlobContainerClient::new(
            self.http.clone(),
            connection,
            container,
        )))
    }
}

pub struct StorageClientFactory {
    secrets: Arc<dyn SecretsProvider>,
    builder: Arc<dyn ClientBuilder>,
    config: OnceCell<StorageClientConfig>,
    s3_clients: Mutex<HashMap<(String, String), Arc<dyn S3Client>>>,
    container_clients: Mutex<HashMap<(String, String), Arc<dyn ContainerClient>>>,
}

impl StorageClientFactory {
    pub fn new(secrets: Arc<dyn SecretsProvider>, builder: Arc<dyn ClientBuilder>) -> Self {
        Self {
            secrets,
            builder,
            config: OnceCell::new(),
            s3_clients: Mutex::new(HashMap::new()),
            container_clients: Mutex::new(HashMap::new()),
        }
    }

    async fn config(&self) -> StorageResult<&StorageClientConfig> {
        self.config
            .get_or_try_init(|| async {
                let secret = self.secrets.get_secret().await?;
                serde_json::from_str::<StorageClientConfig>(&secret)
                    .map_err(|e| StorageError::InvalidConfig(e.to_string()))
            })
            .await
    }

    /// Client for `bucket`; an explicit `region` wins over the configured one.
    pub async fn get_s3_client(
        &self,
        bucket: &str,
        region: Option<&str>,
    ) -> StorageResult<Arc<dyn S3Client>> {
        let mut clients = self.s3_clients.lock().await;
        let key = (bucket.to_string(), region.unwrap_or_default().to_string());
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let config = self.config().await?;
        let bucket_config = config
            .aws
            .get(bucket)
            .ok_or_else(|| StorageError::NotConfigured {
                kind: "S3 bucket",
                name: bucket.to_string(),
            })?;
        let region = region
            .or(bucket_config.region.as_deref())
            .unwrap_or(DEFAULT_REGION);

        debug!(bucket, region, "building s3 client");
        let client = self.builder.build_s3(bucket_config, region).await?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    pub async fn get_container_client(
        &self,
        account: &str,
        container: &str,
    ) -> StorageResult<Arc<dyn ContainerClient>> {
        let mut clients = self.container_clients.lock().await;
        let key = (account.to_string(), container.to_string());
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let config = self.config().await?;
        let account_config =
            config
                .azure
                .get(account)
                .ok_or_else(|| StorageError::NotConfigured {
                    kind: "storage account",
                    name: account.to_string(),
                })?;

        debug!(account, container, "building blob container client");
        let client = self
            .builder
            .build_container(account, container, account_config)?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}
