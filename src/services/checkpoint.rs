//! Checkpoint store: persists a `FileCopierState` in the document table so a
//! later invocation can resume the copy.
//!
//! The state is split into pages of at most 200 work items stored at
//! `{jobId}/file-copier-state-{offset}`; the first page also carries the
//! counters. `{jobId}/file-copier-state-index` lists the page ids and is
//! written last, so a partially written checkpoint is never picked up.

use crate::{
    errors::CopyResult,
    models::work_item::{FileCopierState, WorkItem},
    services::document_table::{DocumentTable, TableResult},
};
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tracing::{debug, warn};

const PAGE_SIZE: usize = 200;
const WRITE_ATTEMPTS: u32 = 3;

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct CheckpointIndex {
    database_ids: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct CheckpointPage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bytes_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bytes_copied: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    files_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    files_copied: Option<u64>,
    work_items: Vec<WorkItem>,
}

#[derive(Clone)]
pub struct CheckpointStore {
    table: DocumentTable,
    retry_delay: Duration,
}

impl CheckpointStore {
    pub fn new(table: DocumentTable) -> Self {
        Self {
            table,
            retry_delay: Duration::from_secs(3),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub async fn save(&self, job_id: &str, state: &FileCopierState) -> CopyResult<()> {
        let mut database_ids = Vec::new();

        let mut chunks = state.work_items.chunks(PAGE_SIZE).peekable();
        if chunks.peek().is_none() {
            let id = page_id(job_id, 0);
            let page = first_page(state, Vec::new());
            self.with_retry(|| self.table.put(&id, &page)).await?;
            database_ids.push(id);
        }
        for (index, chunk) in chunks.enumerate() {
            let offset = index * PAGE_SIZE;
            let id = page_id(job_id, offset);
            let page = if offset == 0 {
                first_page(state, chunk.to_vec())
            } else {
                CheckpointPage {
                    work_items: chunk.to_vec(),
                    ..Default::default()
                }
            };
            self.with_retry(|| self.table.put(&id, &page)).await?;
            database_ids.push(id);
        }

        let index = CheckpointIndex { database_ids };
        let index_id = index_id(job_id);
        self.with_retry(|| self.table.put(&index_id, &index)).await?;
        debug!(
            job_assignment_id = job_id,
            pages = index.database_ids.len(),
            work_items = state.work_items.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Saved state, or an empty state when no complete checkpoint exists.
    pub async fn load(&self, job_id: &str) -> CopyResult<FileCopierState> {
        let Some(index) = self
            .table
            .get::<CheckpointIndex>(&index_id(job_id))
            .await?
        else {
            return Ok(FileCopierState::default());
        };

        let mut state = FileCopierState::default();
        for id in &index.database_ids {
            let Some(page) = self.table.get::<CheckpointPage>(id).await? else {
                warn!(job_assignment_id = job_id, page = %id, "checkpoint page missing");
                return Ok(FileCopierState::default());
            };
            state.bytes_total = page.bytes_total.unwrap_or(state.bytes_total);
            state.bytes_copied = page.bytes_copied.unwrap_or(state.bytes_copied);
            state.files_total = page.files_total.unwrap_or(state.files_total);
            state.files_copied = page.files_copied.unwrap_or(state.files_copied);
            state.work_items.extend(page.work_items);
        }
        Ok(state)
    }

    /// Best-effort removal; failures are logged.
    pub async fn delete(&self, job_id: &str) {
        let index_id = index_id(job_id);
        let index = match self.table.get::<CheckpointIndex>(&index_id).await {
            Ok(Some(index)) => index,
            Ok(None) => return,
            Err(e) => {
                warn!(job_assignment_id = job_id, error = %e, "failed to read checkpoint index");
                return;
            }
        };

        if let Err(e) = self.table.delete(&index_id).await {
            warn!(job_assignment_id = job_id, error = %e, "failed to delete checkpoint index");
        }
        for id in index.database_ids {
            if let Err(e) = self.table.delete(&id).await {
                warn!(job_assignment_id = job_id, page = %id, error = %e, "failed to delete checkpoint page");
            }
        }
    }

    async fn with_retry<F, Fut>(&self, mut op: F) -> TableResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TableResult<()>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < WRITE_ATTEMPTS => {
                    warn!(attempt, error = %e, "checkpoint write failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn first_page(state: &FileCopierState, work_items: Vec<WorkItem>) -> CheckpointPage {
    CheckpointPage {
        bytes_total: Some(state.bytes_total),
        bytes_copied: Some(state.bytes_copied),
        files_total: Some(state.files_total),
        files_copied: Some(state.files_copied),
        work_items,
    }
}

fn page_id(job_id: &str, offset: usize) -> String {
    format!("{}/file-copier-state-{}", job_id, offset)
}

fn index_id(job_id: &str) -> String {
    format!("{}/file-copier-state-index", job_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{
            locator::Locator,
            work_item::{DestinationFile, SourceFile},
        },
        testutil::memory_table,
    };
    use serde_json::Value;

    const JOB: &str = "/job-assignments/7f3c";

    fn state_with(items: usize) -> FileCopierState {
        FileCopierState {
            bytes_total: 1000,
            bytes_copied: 400,
            files_total: items as u64 + 2,
            files_copied: 2,
            work_items: (0..items)
                .map(|i| {
                    WorkItem::prepare(
                        SourceFile::new(Locator::s3("media", format!("in/{i}"), None)),
                        DestinationFile::new(Locator::s3("archive", format!("out/{i}"), None)),
                    )
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn round_trips_empty_single_and_multi_page_states() {
        let table = memory_table().await;
        let store = CheckpointStore::new(table.clone());

        for items in [0, 1, 450] {
            let state = state_with(items);
            store.save(JOB, &state).await.unwrap();
            assert_eq!(store.load(JOB).await.unwrap(), state);
            store.delete(JOB).await;
        }
    }

    #[tokio::test]
    async fn pages_hold_at_most_two_hundred_items() {
        let table = memory_table().await;
        let store = CheckpointStore::new(table.clone());
        store.save(JOB, &state_with(450)).await.unwrap();

        let index: Value = table.get(&index_id(JOB)).await.unwrap().unwrap();
        assert_eq!(
            index["databaseIds"],
            serde_json::json!([
                format!("{JOB}/file-copier-state-0"),
                format!("{JOB}/file-copier-state-200"),
                format!("{JOB}/file-copier-state-400"),
            ])
        );
        let last: Value = table.get(&page_id(JOB, 400)).await.unwrap().unwrap();
        assert_eq!(last["workItems"].as_array().map(Vec::len), Some(50));
        assert!(last.get("bytesTotal").is_none());
    }

    #[tokio::test]
    async fn missing_index_or_page_loads_as_empty() {
        let table = memory_table().await;
        let store = CheckpointStore::new(table.clone());
        assert!(store.load(JOB).await.unwrap().is_empty());

        store.save(JOB, &state_with(250)).await.unwrap();
        table.delete(&page_id(JOB, 200)).await.unwrap();
        assert_eq!(store.load(JOB).await.unwrap(), FileCopierState::default());
    }

    #[tokio::test]
    async fn delete_removes_everything_and_is_idempotent() {
        let table = memory_table().await;
        let store = CheckpointStore::new(table.clone());
        store.save(JOB, &state_with(250)).await.unwrap();

        store.delete(JOB).await;
        store.delete(JOB).await;

        let left = table.query_all::<Value>(JOB).await.unwrap();
        assert!(left.is_empty());
    }
}
