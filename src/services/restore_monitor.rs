//! Restore monitor: detects finished archive restores and hands the waiting
//! jobs back to the worker.
//!
//! Only one monitor pass runs at a time across all processes sharing the
//! table; a pass that cannot take the lock does nothing.

use crate::{
    errors::CopyResult,
    models::{
        locator::Locator,
        restore::{RestoreWorkItem, parse_restore_value, restore_work_item_path},
    },
    services::{
        document_table::DocumentTable, job_assignment::JobAssignmentHelper,
        storage_clients::StorageClientFactory, worker_invoker::WorkerInvoker,
    },
};
use serde_json::json;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

pub const MONITOR_LOCK_NAME: &str = "cloud-storage-service-monitor";
const MONITOR_LOCK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// What one monitor pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub ran: bool,
    pub finished_restores: usize,
    /// Records that could not be tracked and were deleted unrestored.
    pub dropped: usize,
    pub completed_jobs: Vec<String>,
}

pub struct RestoreMonitor {
    table: DocumentTable,
    clients: Arc<StorageClientFactory>,
    invoker: Arc<dyn WorkerInvoker>,
    holder: String,
}

impl RestoreMonitor {
    pub fn new(
        table: DocumentTable,
        clients: Arc<StorageClientFactory>,
        invoker: Arc<dyn WorkerInvoker>,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            table,
            clients,
            invoker,
            holder: holder.into(),
        }
    }

    pub async fn run_once(&self) -> CopyResult<MonitorReport> {
        let mutex = self
            .table
            .create_mutex(MONITOR_LOCK_NAME, &self.holder, MONITOR_LOCK_TIMEOUT);
        if !mutex.try_lock().await? {
            debug!("restore monitor already running elsewhere");
            return Ok(MonitorReport::default());
        }

        let result = self.scan().await;
        if let Err(e) = mutex.unlock().await {
            warn!(error = %e, "failed to release monitor lock");
        }
        result
    }

    async fn scan(&self) -> CopyResult<MonitorReport> {
        let mut records = self
            .table
            .query_all::<RestoreWorkItem>(restore_work_item_path())
            .await?;
        let mut report = MonitorReport {
            ran: true,
            ..Default::default()
        };
        let mut finished_jobs = BTreeSet::new();

        for index in (0..records.len()).rev() {
            let record = &records[index];
            let restored = match self.is_restored(record).await {
                Some(true) => true,
                Some(false) => continue,
                None => false,
            };
            if let Err(e) = self.table.delete(&record.id).await {
                error!(id = %record.id, error = %e, "failed to delete restore work item");
                continue;
            }
            if restored {
                info!(id = %record.id, url = record.file.url(), "restore finished");
                finished_jobs.extend(record.job_assignment_database_ids.iter().cloned());
                report.finished_restores += 1;
            } else {
                report.dropped += 1;
            }
            records.remove(index);
        }

        for job_id in finished_jobs {
            let still_waiting = records
                .iter()
                .any(|r| r.job_assignment_database_ids.contains(&job_id));
            if still_waiting {
                continue;
            }
            match self.complete_restore(&job_id).await {
                Ok(()) => report.completed_jobs.push(job_id),
                Err(e) => error!(job_assignment_id = %job_id, error = %e, "failed to invoke CompleteRestore"),
            }
        }
        Ok(report)
    }

    /// `Some(true)` when done, `Some(false)` while ongoing or unknown, `None`
    /// when the record cannot be tracked and should be dropped.
    async fn is_restored(&self, record: &RestoreWorkItem) -> Option<bool> {
        let Locator::S3(object) = &record.file else {
            warn!(
                id = %record.id,
                locator = record.file.type_name(),
                "unsupported locator in restore work item, dropping"
            );
            return None;
        };

        let head = match self
            .clients
            .get_s3_client(&object.bucket, object.region.as_deref())
            .await
        {
            Ok(client) => client.head_object(object).await,
            Err(e) => Err(e),
        };
        let metadata = match head {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                warn!(url = %object.url, "restoring object no longer exists");
                return Some(true);
            }
            Err(e) => {
                error!(url = %object.url, error = %e, "failed to check restore status");
                return Some(false);
            }
        };

        let status = match parse_restore_value(metadata.restore.as_deref().unwrap_or_default()) {
            Ok(status) => status,
            Err(e) => {
                error!(url = %object.url, error = %e, "unreadable restore status");
                return Some(false);
            }
        };
        Some(status.get("ongoing-request").map(String::as_str) != Some("true"))
    }

    async fn complete_restore(&self, job_id: &str) -> CopyResult<()> {
        let helper = JobAssignmentHelper::new(self.table.clone(), job_id);
        let tracker = match helper.load().await {
            Ok(job) => job.tracker,
            Err(e) => {
                debug!(job_assignment_id = job_id, error = %e, "no tracker available");
                None
            }
        };
        self.invoker
            .invoke(
                "CompleteRestore",
                json!({ "jobAssignmentDatabaseId": job_id }),
                tracker,
            )
            .await
    }
}
