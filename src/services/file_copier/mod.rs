//! FileCopier: a resumable, deadline-aware engine copying many files with
//! bounded concurrency.
//!
//! Work items move through `Prepare → Single` or
//! `Prepare → MultipartStart → MultipartSegment×N → MultipartComplete`.
//! A single scheduling loop owns the queue, the counters and the segment
//! arena; in-flight operations only report outcomes back to it, so no state
//! is shared with running futures.
//!
//! `get_state` / `set_state` turn the engine into a `FileCopierState`
//! snapshot and back, which is what lets a copy continue in a later
//! invocation.

pub mod work;

use crate::{
    errors::{CopyError, CopyResult},
    models::work_item::{
        DestinationFile, FileCopierState, MultipartSegment, SourceFile, WorkItem, WorkType,
    },
    services::{
        http_source::HttpSource, probe::ObjectProbe, storage_clients::StorageClientFactory,
    },
};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt, future::BoxFuture, stream::FuturesUnordered};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use work::{Outcome, WorkRunner, expand_multipart};

pub const DEFAULT_MAX_CONCURRENCY: usize = 32;
pub const DEFAULT_MULTIPART_SIZE: u64 = 64 * 1024 * 1024;
const MIN_MULTIPART_SIZE: u64 = 5 * 1024 * 1024;
const MAX_MULTIPART_SIZE: u64 = 4_194_304_000;
const MAX_RETRIES: u32 = 1;

#[derive(Clone, Debug)]
pub struct FileCopierSettings {
    /// Work items in flight at once.
    pub max_concurrency: usize,
    /// Files above this size are copied in segments of at least this size.
    pub multipart_size: u64,
    pub progress_interval: Duration,
    /// Pause before re-checking a multipart completion whose segments are still running.
    pub complete_retry_delay: Duration,
    pub signed_url_validity: Duration,
}

impl FileCopierSettings {
    /// Out-of-range values fall back to the defaults.
    pub fn new(max_concurrency: Option<usize>, multipart_size: Option<u64>) -> Self {
        let max_concurrency = max_concurrency
            .filter(|c| (1..64).contains(c))
            .unwrap_or(DEFAULT_MAX_CONCURRENCY);
        let multipart_size = multipart_size
            .filter(|s| (MIN_MULTIPART_SIZE..=MAX_MULTIPART_SIZE).contains(s))
            .unwrap_or(DEFAULT_MULTIPART_SIZE);
        Self {
            max_concurrency,
            multipart_size,
            ..Self::default()
        }
    }
}

impl Default for FileCopierSettings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            multipart_size: DEFAULT_MULTIPART_SIZE,
            progress_interval: Duration::from_secs(1),
            complete_retry_delay: Duration::from_secs(1),
            signed_url_validity: Duration::from_secs(12 * 3600),
        }
    }
}

/// File and byte counters of a copy run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopyProgress {
    pub files_total: u64,
    pub files_copied: u64,
    pub bytes_total: u64,
    pub bytes_copied: u64,
}

impl CopyProgress {
    /// Copied bytes as a percentage rounded to one decimal; `None` until sizes are known.
    pub fn percentage(&self) -> Option<f64> {
        if self.bytes_total == 0 {
            return None;
        }
        let percent = self.bytes_copied as f64 / self.bytes_total as f64 * 100.0;
        Some((percent * 10.0).round() / 10.0)
    }
}

#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, progress: CopyProgress);
}

type InFlight = BoxFuture<'static, (WorkItem, CopyResult<Outcome>)>;

pub struct FileCopier {
    runner: Arc<WorkRunner>,
    progress: Option<Arc<dyn ProgressReporter>>,
    queue: VecDeque<WorkItem>,
    /// Segments of each multipart transfer, keyed by upload id then part number.
    arena: HashMap<String, BTreeMap<u32, MultipartSegment>>,
    counters: CopyProgress,
    error: Option<CopyError>,
}

impl FileCopier {
    pub fn new(
        clients: Arc<StorageClientFactory>,
        http: Arc<dyn HttpSource>,
        settings: FileCopierSettings,
    ) -> Self {
        let probe = ObjectProbe::new(clients.clone(), http.clone());
        Self {
            runner: Arc::new(WorkRunner {
                clients,
                http,
                probe,
                settings,
                api_key: None,
            }),
            progress: None,
            queue: VecDeque::new(),
            arena: HashMap::new(),
            counters: CopyProgress::default(),
            error: None,
        }
    }

    /// API key sent to egress endpoints that require one.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        if let Some(runner) = Arc::get_mut(&mut self.runner) {
            runner.api_key = api_key;
        }
        self
    }

    pub fn with_progress(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress = Some(reporter);
        self
    }

    pub fn add_file(&mut self, source: SourceFile, destination: DestinationFile) {
        self.queue.push_back(WorkItem::prepare(source, destination));
    }

    pub fn progress(&self) -> CopyProgress {
        self.counters
    }

    /// Snapshot of the counters and every queued work item.
    ///
    /// Complete items carry their upload's segments so the arena can be
    /// rebuilt by `set_state`.
    pub fn get_state(&self) -> FileCopierState {
        let work_items = self
            .queue
            .iter()
            .map(|item| {
                let mut item = item.clone();
                if item.work_type == WorkType::MultipartComplete
                    && let Some(data) = item.multipart_data.as_mut()
                {
                    data.segments = data
                        .upload_id
                        .as_ref()
                        .and_then(|id| self.arena.get(id))
                        .map(|parts| parts.values().cloned().collect());
                }
                item
            })
            .collect();

        FileCopierState {
            bytes_total: self.counters.bytes_total,
            bytes_copied: self.counters.bytes_copied,
            files_total: self.counters.files_total,
            files_copied: self.counters.files_copied,
            work_items,
        }
    }

    /// Replace the engine state with a snapshot from `get_state`.
    ///
    /// Fails when a segment refers to an upload with no complete item.
    pub fn set_state(&mut self, state: FileCopierState) -> CopyResult<()> {
        let mut arena = HashMap::new();
        for item in &state.work_items {
            if item.work_type != WorkType::MultipartComplete {
                continue;
            }
            let data = item.multipart_data.as_ref();
            let upload_id = data
                .and_then(|d| d.upload_id.clone())
                .ok_or_else(|| CopyError::InvalidInput("Incomplete work items list".into()))?;
            let segments = data
                .and_then(|d| d.segments.as_ref())
                .map(|segments| {
                    segments
                        .iter()
                        .map(|s| (s.part_number, s.clone()))
                        .collect::<BTreeMap<_, _>>()
                })
                .unwrap_or_default();
            arena.insert(upload_id, segments);
        }

        let mut queue = VecDeque::with_capacity(state.work_items.len());
        for mut item in state.work_items {
            match item.work_type {
                WorkType::MultipartComplete => {
                    if let Some(data) = item.multipart_data.as_mut() {
                        data.segments = None;
                    }
                }
                WorkType::MultipartSegment => {
                    let known = item.upload_id().is_some_and(|id| arena.contains_key(id));
                    if !known {
                        return Err(CopyError::InvalidInput("Incomplete work items list".into()));
                    }
                }
                _ => {}
            }
            queue.push_back(item);
        }

        self.counters = CopyProgress {
            files_total: state.files_total,
            files_copied: state.files_copied,
            bytes_total: state.bytes_total,
            bytes_copied: state.bytes_copied,
        };
        self.queue = queue;
        self.arena = arena;
        self.error = None;
        Ok(())
    }

    /// Process work until the queue is empty or `deadline` passes.
    ///
    /// No item is admitted after `deadline` or after a fatal error, and every
    /// in-flight item is drained before returning. Operations still running
    /// at `abort_at` are cut short and re-queued.
    pub async fn run_until(&mut self, deadline: Instant, abort_at: Instant) -> CopyResult<()> {
        let max_concurrency = self.runner.settings.max_concurrency;
        let mut active: FuturesUnordered<InFlight> = FuturesUnordered::new();
        let mut ticker = tokio::time::interval(self.runner.settings.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            while self.error.is_none()
                && active.len() < max_concurrency
                && Instant::now() < deadline
                && let Some(item) = self.queue.pop_front()
            {
                active.push(self.dispatch(item, abort_at));
            }

            if active.is_empty() {
                break;
            }

            tokio::select! {
                Some((item, result)) = active.next() => self.handle(item, result),
                _ = ticker.tick() => self.report_progress().await,
            }
        }

        self.report_progress().await;
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn dispatch(&self, item: WorkItem, abort_at: Instant) -> InFlight {
        let segments = match item.work_type {
            WorkType::MultipartComplete => item
                .upload_id()
                .and_then(|id| self.arena.get(id))
                .map(|parts| parts.values().cloned().collect()),
            _ => None,
        };
        let runner = self.runner.clone();
        async move {
            let result = tokio::time::timeout_at(abort_at, runner.run(&item, segments))
                .await
                .unwrap_or(Err(CopyError::Aborted));
            (item, result)
        }
        .boxed()
    }

    fn handle(&mut self, mut item: WorkItem, result: CopyResult<Outcome>) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(CopyError::Aborted) => {
                debug!(url = item.url(), work_type = ?item.work_type, "aborted, re-queued");
                self.queue.push_back(item);
                return;
            }
            Err(e) if item.retries < MAX_RETRIES => {
                warn!(
                    url = item.url(),
                    work_type = ?item.work_type,
                    part_number = ?item.part_number(),
                    error = %e,
                    "work item failed, retrying"
                );
                item.retries += 1;
                self.queue.push_back(item);
                return;
            }
            Err(e) => {
                error!(
                    url = item.url(),
                    work_type = ?item.work_type,
                    part_number = ?item.part_number(),
                    error = %e,
                    "work item failed"
                );
                if self.error.is_none() {
                    self.error = Some(e);
                }
                self.queue.push_front(item);
                return;
            }
        };

        match outcome {
            Outcome::Prepared(next) => {
                self.counters.files_total += 1;
                self.counters.bytes_total += next.content_length.unwrap_or(0);
                self.queue.push_back(next);
            }
            Outcome::Skipped => {
                info!(
                    source = item.url(),
                    destination = item.destination_file.locator.url(),
                    "destination is up to date, skipping"
                );
            }
            Outcome::SingleDone { bytes } => {
                self.counters.files_copied += 1;
                self.counters.bytes_copied += bytes;
                debug!(url = item.url(), bytes, "copied");
            }
            Outcome::MultipartStarted {
                upload_id,
                segments,
            } => {
                self.queue
                    .extend(expand_multipart(&item, &upload_id, &segments));
                self.arena.insert(
                    upload_id,
                    segments.into_iter().map(|s| (s.part_number, s)).collect(),
                );
            }
            Outcome::SegmentDone { upload_id, segment } => {
                self.counters.bytes_copied += segment.length;
                debug!(url = item.url(), part_number = segment.part_number, "segment copied");
                if let Some(parts) = self.arena.get_mut(&upload_id) {
                    parts.insert(segment.part_number, segment);
                }
            }
            // behind the segments it waits for, which may have been re-queued
            Outcome::NotReady => self.queue.push_back(item),
            Outcome::Completed { upload_id } => {
                self.counters.files_copied += 1;
                self.arena.remove(&upload_id);
                debug!(url = item.url(), "multipart copy completed");
            }
        }
    }

    async fn report_progress(&self) {
        if let Some(reporter) = &self.progress {
            reporter.report(self.counters).await;
        }
    }
}
