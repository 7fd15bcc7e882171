//! In-memory stand-ins for the document table, the storage clients, HTTP
//! sources and the worker invoker.

use crate::{
    errors::CopyResult,
    models::{job::WorkerRequest, locator::S3Locator},
    operations::{Services, Worker, copy_session::SessionTimings},
    services::{
        azure::ContainerClient,
        document_table::DocumentTable,
        file_copier::FileCopierSettings,
        http_source::{HttpError, HttpResult, HttpSource, RequestHeaders},
        s3::{CompletedPartInfo, S3Client},
        storage_clients::{
            AwsBucketConfig, AzureAccountConfig, ClientBuilder, ListedObject, ObjectListing,
            ObjectMetadata, SecretsProvider, StorageClientFactory, StorageError, StorageResult,
        },
        worker_invoker::WorkerInvoker,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

const LISTING_PAGE_SIZE: usize = 2;

const TEST_SECRET: &str = r#"{
    "aws": {"media": {}, "archive": {}, "vault": {}},
    "azure": {"acct": {"connectionString": "AccountName=acct;AccountKey=a2V5"}}
}"#;

fn seeded_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub async fn memory_table() -> DocumentTable {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let table = DocumentTable::new(Arc::new(pool));
    table.migrate().await.unwrap();
    table
}

pub struct StaticSecrets {
    secret: String,
    pub calls: AtomicUsize,
}

impl StaticSecrets {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SecretsProvider for StaticSecrets {
    async fn get_secret(&self) -> StorageResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.secret.clone())
    }
}

/// Hands out the same fake S3 and container for every bucket and account.
#[derive(Default)]
pub struct FakeClientBuilder {
    pub s3: Arc<FakeS3>,
    pub blob: Arc<FakeContainer>,
    pub s3_builds: AtomicUsize,
    pub container_builds: AtomicUsize,
    pub last_region: Mutex<Option<String>>,
}

#[async_trait]
impl ClientBuilder for FakeClientBuilder {
    async fn build_s3(
        &self,
        _config: &AwsBucketConfig,
        region: &str,
    ) -> StorageResult<Arc<dyn S3Client>> {
        self.s3_builds.fetch_add(1, Ordering::SeqCst);
        *self.last_region.lock().unwrap() = Some(region.to_string());
        Ok(self.s3.clone())
    }

    fn build_container(
        &self,
        _account: &str,
        _container: &str,
        _config: &AzureAccountConfig,
    ) -> StorageResult<Arc<dyn ContainerClient>> {
        self.container_builds.fetch_add(1, Ordering::SeqCst);
        Ok(self.blob.clone())
    }
}

fn page<T: Clone>(items: &[T], token: Option<String>) -> (Vec<T>, Option<String>) {
    let start = token.and_then(|t| t.parse::<usize>().ok()).unwrap_or(0);
    let end = (start + LISTING_PAGE_SIZE).min(items.len());
    let next = (end < items.len()).then(|| end.to_string());
    (items[start.min(end)..end].to_vec(), next)
}

#[derive(Default)]
struct Calls {
    counts: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, usize>,
}

impl Calls {
    fn record(&mut self, operation: &'static str) -> StorageResult<()> {
        *self.counts.entry(operation).or_default() += 1;
        if let Some(remaining) = self.failures.get_mut(operation)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(StorageError::Service {
                operation,
                message: "injected failure".into(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct S3State {
    calls: Calls,
    objects: BTreeMap<(String, String), ObjectMetadata>,
    parts: HashMap<String, HashMap<u32, u64>>,
    completed: HashMap<(String, String), Vec<u32>>,
    restores: Vec<(String, u32, String)>,
    next_id: usize,
}

impl S3State {
    fn new_etag(&mut self) -> String {
        self.next_id += 1;
        format!("\"etag-{}\"", self.next_id)
    }

    fn create(&mut self, target: &S3Locator, size: u64, content_type: Option<&str>, storage_class: Option<&str>) {
        let etag = self.new_etag();
        self.objects.insert(
            (target.bucket.clone(), target.key.clone()),
            ObjectMetadata {
                size: Some(size),
                content_type: content_type.map(str::to_string),
                etag: Some(etag),
                last_modified: Some(Utc::now()),
                storage_class: storage_class.map(str::to_string),
                restore: None,
            },
        );
    }
}

#[derive(Default)]
pub struct FakeS3 {
    state: Mutex<S3State>,
    head_latency: Mutex<Duration>,
}

impl FakeS3 {
    fn begin(&self, operation: &'static str) -> StorageResult<MutexGuard<'_, S3State>> {
        let mut state = self.state.lock().unwrap();
        state.calls.record(operation)?;
        Ok(state)
    }

    pub fn add_object(&self, bucket: &str, key: &str, size: u64, content_type: &str) {
        self.insert(bucket, key, size, Some(content_type), None);
    }

    pub fn add_archived_object(&self, bucket: &str, key: &str, size: u64, storage_class: &str) {
        self.insert(bucket, key, size, None, Some(storage_class));
    }

    fn insert(
        &self,
        bucket: &str,
        key: &str,
        size: u64,
        content_type: Option<&str>,
        storage_class: Option<&str>,
    ) {
        self.state.lock().unwrap().objects.insert(
            (bucket.to_string(), key.to_string()),
            ObjectMetadata {
                size: Some(size),
                content_type: content_type.map(str::to_string),
                etag: Some(format!("\"{}/{}\"", bucket, key)),
                last_modified: Some(seeded_at()),
                storage_class: storage_class.map(str::to_string),
                restore: None,
            },
        );
    }

    pub fn set_restore(&self, bucket: &str, key: &str, restore: &str) {
        if let Some(object) = self
            .state
            .lock()
            .unwrap()
            .objects
            .get_mut(&(bucket.to_string(), key.to_string()))
        {
            object.restore = Some(restore.to_string());
        }
    }

    /// Every `HeadObject` call takes at least `latency`.
    pub fn set_head_latency(&self, latency: Duration) {
        *self.head_latency.lock().unwrap() = latency;
    }

    /// Make the next `times` calls of `operation` fail.
    pub fn fail_next(&self, operation: &'static str, times: usize) {
        self.state
            .lock()
            .unwrap()
            .calls
            .failures
            .insert(operation, times);
    }

    pub fn count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .counts
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn head(&self, bucket: &str, key: &str) -> Option<ObjectMetadata> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Part numbers of the last completed multipart upload, in commit order.
    pub fn completed_parts(&self, bucket: &str, key: &str) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .completed
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// `(key, days, tier)` of every restore request.
    pub fn restores(&self) -> Vec<(String, u32, String)> {
        self.state.lock().unwrap().restores.clone()
    }
}

fn no_such_key(operation: &'static str, object: &S3Locator) -> StorageError {
    StorageError::Status {
        operation,
        status: 404,
        message: format!("NoSuchKey: {}", object.key),
    }
}

#[async_trait]
impl S3Client for FakeS3 {
    async fn head_object(&self, object: &S3Locator) -> StorageResult<Option<ObjectMetadata>> {
        let latency = *self.head_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let state = self.begin("HeadObject")?;
        Ok(state
            .objects
            .get(&(object.bucket.clone(), object.key.clone()))
            .cloned())
    }

    async fn copy_object(
        &self,
        source: &S3Locator,
        target: &S3Locator,
        content_type: Option<&str>,
        storage_class: Option<&str>,
    ) -> StorageResult<()> {
        let mut state = self.begin("CopyObject")?;
        let size = state
            .objects
            .get(&(source.bucket.clone(), source.key.clone()))
            .and_then(|o| o.size)
            .ok_or_else(|| no_such_key("CopyObject", source))?;
        state.create(target, size, content_type, storage_class);
        Ok(())
    }

    async fn put_object(
        &self,
        target: &S3Locator,
        body: Bytes,
        content_type: Option<&str>,
        storage_class: Option<&str>,
    ) -> StorageResult<()> {
        let mut state = self.begin("PutObject")?;
        state.create(target, body.len() as u64, content_type, storage_class);
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        _target: &S3Locator,
        _content_type: Option<&str>,
        _storage_class: Option<&str>,
    ) -> StorageResult<String> {
        let mut state = self.begin("CreateMultipartUpload")?;
        state.next_id += 1;
        let upload_id = format!("upload-{}", state.next_id);
        state.parts.insert(upload_id.clone(), HashMap::new());
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _target: &S3Locator,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StorageResult<String> {
        let mut state = self.begin("UploadPart")?;
        state
            .parts
            .entry(upload_id.to_string())
            .or_default()
            .insert(part_number, body.len() as u64);
        Ok(format!("\"{}-{}\"", upload_id, part_number))
    }

    async fn upload_part_copy(
        &self,
        source: &S3Locator,
        _target: &S3Locator,
        upload_id: &str,
        part_number: u32,
        start: u64,
        end: u64,
    ) -> StorageResult<String> {
        let mut state = self.begin("UploadPartCopy")?;
        if !state
            .objects
            .contains_key(&(source.bucket.clone(), source.key.clone()))
        {
            return Err(no_such_key("UploadPartCopy", source));
        }
        state
            .parts
            .entry(upload_id.to_string())
            .or_default()
            .insert(part_number, end - start + 1);
        Ok(format!("\"{}-{}\"", upload_id, part_number))
    }

    async fn complete_multipart_upload(
        &self,
        target: &S3Locator,
        upload_id: &str,
        parts: &[CompletedPartInfo],
    ) -> StorageResult<()> {
        let mut state = self.begin("CompleteMultipartUpload")?;
        let sizes = state.parts.remove(upload_id).unwrap_or_default();
        let size = parts
            .iter()
            .map(|p| sizes.get(&p.part_number).copied().unwrap_or(0))
            .sum();
        state.completed.insert(
            (target.bucket.clone(), target.key.clone()),
            parts.iter().map(|p| p.part_number).collect(),
        );
        state.create(target, size, None, None);
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _target: &S3Locator,
        upload_id: &str,
    ) -> StorageResult<()> {
        let mut state = self.begin("AbortMultipartUpload")?;
        state.parts.remove(upload_id);
        Ok(())
    }

    async fn presign_get(&self, object: &S3Locator, _expires_in: Duration) -> StorageResult<String> {
        self.begin("PresignGetObject")?;
        Ok(format!("{}?X-Amz-Signature=test", object.url))
    }

    async fn restore_object(&self, object: &S3Locator, days: u32, tier: &str) -> StorageResult<()> {
        let mut state = self.begin("RestoreObject")?;
        state
            .restores
            .push((object.key.clone(), days, tier.to_string()));
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> StorageResult<ObjectListing> {
        let state = self.begin("ListObjectsV2")?;
        let matching = state
            .objects
            .iter()
            .filter(|((b, key), _)| b == bucket && key.starts_with(prefix))
            .map(|((_, key), metadata)| ListedObject {
                key: key.clone(),
                size: metadata.size.unwrap_or(0),
                storage_class: metadata.storage_class.clone(),
            })
            .collect::<Vec<_>>();
        let (objects, next_token) = page(&matching, continuation_token);
        Ok(ObjectListing {
            objects,
            next_token,
        })
    }
}

#[derive(Default)]
struct BlobState {
    calls: Calls,
    blobs: BTreeMap<String, ObjectMetadata>,
    blocks: HashMap<String, u64>,
    copied_from: Vec<(String, String)>,
}

impl BlobState {
    fn create(&mut self, blob_name: &str, size: Option<u64>, content_type: Option<&str>) {
        self.blobs.insert(
            blob_name.to_string(),
            ObjectMetadata {
                size,
                content_type: content_type.map(str::to_string),
                last_modified: Some(Utc::now()),
                ..Default::default()
            },
        );
    }
}

#[derive(Default)]
pub struct FakeContainer {
    state: Mutex<BlobState>,
}

impl FakeContainer {
    fn begin(&self, operation: &'static str) -> StorageResult<MutexGuard<'_, BlobState>> {
        let mut state = self.state.lock().unwrap();
        state.calls.record(operation)?;
        Ok(state)
    }

    pub fn add_blob(&self, blob_name: &str, size: u64) {
        self.state.lock().unwrap().blobs.insert(
            blob_name.to_string(),
            ObjectMetadata {
                size: Some(size),
                content_type: Some("application/octet-stream".into()),
                last_modified: Some(seeded_at()),
                ..Default::default()
            },
        );
    }

    /// `(blob_name, source_url)` of every server-side copy.
    pub fn copied_from(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().copied_from.clone()
    }
}

#[async_trait]
impl ContainerClient for FakeContainer {
    async fn get_properties(&self, blob_name: &str) -> StorageResult<Option<ObjectMetadata>> {
        let state = self.begin("GetBlobProperties")?;
        Ok(state.blobs.get(blob_name).cloned())
    }

    async fn copy_from_url(&self, blob_name: &str, source_url: &str) -> StorageResult<()> {
        let mut state = self.begin("CopyBlobFromUrl")?;
        state
            .copied_from
            .push((blob_name.to_string(), source_url.to_string()));
        state.create(blob_name, None, None);
        Ok(())
    }

    async fn stage_block_from_url(
        &self,
        _blob_name: &str,
        block_id: &str,
        _source_url: &str,
        start: u64,
        end: u64,
    ) -> StorageResult<()> {
        let mut state = self.begin("PutBlockFromUrl")?;
        state.blocks.insert(block_id.to_string(), end - start + 1);
        Ok(())
    }

    async fn stage_block(&self, _blob_name: &str, block_id: &str, body: Bytes) -> StorageResult<()> {
        let mut state = self.begin("PutBlock")?;
        state.blocks.insert(block_id.to_string(), body.len() as u64);
        Ok(())
    }

    async fn commit_block_list(
        &self,
        blob_name: &str,
        block_ids: &[String],
        content_type: Option<&str>,
    ) -> StorageResult<()> {
        let mut state = self.begin("PutBlockList")?;
        let size = block_ids
            .iter()
            .map(|id| state.blocks.remove(id).unwrap_or(0))
            .sum();
        state.create(blob_name, Some(size), content_type);
        Ok(())
    }

    async fn upload(
        &self,
        blob_name: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> StorageResult<()> {
        let mut state = self.begin("PutBlob")?;
        state.create(blob_name, Some(body.len() as u64), content_type);
        Ok(())
    }

    fn generate_sas_url(&self, blob_name: &str, _expires_in: Duration) -> StorageResult<String> {
        Ok(format!(
            "https://acct.blob.core.windows.net/test/{}?sv=test",
            blob_name
        ))
    }

    async fn list_blobs(
        &self,
        prefix: &str,
        marker: Option<String>,
    ) -> StorageResult<ObjectListing> {
        let state = self.begin("ListBlobs")?;
        let matching = state
            .blobs
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, metadata)| ListedObject {
                key: name.clone(),
                size: metadata.size.unwrap_or(0),
                storage_class: None,
            })
            .collect::<Vec<_>>();
        let (objects, next_token) = page(&matching, marker);
        Ok(ObjectListing {
            objects,
            next_token,
        })
    }
}

#[derive(Default)]
struct HttpState {
    /// url -> (size, whether HEAD reports Content-Length)
    objects: HashMap<String, (u64, bool)>,
    range_probes: usize,
}

#[derive(Default)]
pub struct FakeHttp {
    state: Mutex<HttpState>,
}

impl FakeHttp {
    pub fn add_object(&self, url: &str, size: u64, head_has_length: bool) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(url.to_string(), (size, head_has_length));
    }

    pub fn range_probes(&self) -> usize {
        self.state.lock().unwrap().range_probes
    }

    fn lookup(&self, url: &str) -> HttpResult<(u64, bool)> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(url)
            .copied()
            .ok_or_else(|| HttpError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

#[async_trait]
impl HttpSource for FakeHttp {
    async fn head(&self, url: &str, _headers: &RequestHeaders) -> HttpResult<ObjectMetadata> {
        let (size, has_length) = self.lookup(url)?;
        Ok(ObjectMetadata {
            size: has_length.then_some(size),
            content_type: Some("video/mp4".into()),
            ..Default::default()
        })
    }

    async fn probe_range(
        &self,
        url: &str,
        _headers: &RequestHeaders,
    ) -> HttpResult<ObjectMetadata> {
        self.state.lock().unwrap().range_probes += 1;
        let (size, _) = self.lookup(url)?;
        Ok(ObjectMetadata {
            size: Some(size),
            content_type: Some("video/mp4".into()),
            ..Default::default()
        })
    }

    async fn get(
        &self,
        url: &str,
        _headers: &RequestHeaders,
        range: Option<(u64, u64)>,
    ) -> HttpResult<Bytes> {
        let (size, _) = self.lookup(url)?;
        let length = match range {
            Some((start, end)) => end.min(size.saturating_sub(1)).saturating_sub(start) + 1,
            None => size,
        };
        Ok(Bytes::from(vec![0u8; length as usize]))
    }
}

#[derive(Default)]
pub struct RecordingInvoker {
    calls: Mutex<Vec<WorkerRequest>>,
}

impl RecordingInvoker {
    pub fn calls(&self) -> Vec<WorkerRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerInvoker for RecordingInvoker {
    async fn invoke(
        &self,
        operation_name: &str,
        input: Value,
        tracker: Option<Value>,
    ) -> CopyResult<()> {
        let mut request = WorkerRequest::new(operation_name, input);
        request.tracker = tracker;
        self.calls.lock().unwrap().push(request);
        Ok(())
    }
}

/// A client factory wired to shared fakes.
///
/// Buckets `media`, `archive` and `vault` and the storage account `acct`
/// are configured.
pub struct TestStorage {
    pub factory: Arc<StorageClientFactory>,
    pub http: Arc<FakeHttp>,
    pub s3: Arc<FakeS3>,
    pub blob: Arc<FakeContainer>,
}

impl TestStorage {
    pub fn new() -> Self {
        Self::with_http(Arc::new(FakeHttp::default()))
    }

    pub fn with_http(http: Arc<FakeHttp>) -> Self {
        let builder = FakeClientBuilder::default();
        let s3 = builder.s3.clone();
        let blob = builder.blob.clone();
        let factory = StorageClientFactory::new(
            Arc::new(StaticSecrets::new(TEST_SECRET)),
            Arc::new(builder),
        );
        Self {
            factory: Arc::new(factory),
            http,
            s3,
            blob,
        }
    }

    pub async fn table(&self) -> DocumentTable {
        memory_table().await
    }
}

/// A worker over `storage` with a fresh table and short delays.
pub async fn worker(storage: &TestStorage) -> (Worker, DocumentTable, Arc<RecordingInvoker>) {
    let table = memory_table().await;
    let invoker = Arc::new(RecordingInvoker::default());
    let mut services = Services::new(
        table.clone(),
        storage.factory.clone(),
        storage.http.clone(),
        invoker.clone(),
    );
    services.copier_settings = FileCopierSettings {
        progress_interval: Duration::from_millis(20),
        complete_retry_delay: Duration::from_millis(5),
        ..FileCopierSettings::default()
    };
    services.timings = SessionTimings {
        completion_delay: Duration::from_millis(1),
        ..SessionTimings::default()
    };
    services.checkpoint_retry_delay = Duration::from_millis(1);
    (
        Worker::new(Arc::new(services), Duration::from_secs(600)),
        table,
        invoker,
    )
}
