//! Restore work item registry: one record per archived object being restored,
//! shared by every job waiting on it.

use crate::{
    errors::{CopyError, CopyResult},
    models::{
        locator::Locator,
        restore::{RestorePriority, RestoreWorkItem, build_restore_work_item_id},
    },
    services::{document_table::DocumentTable, storage_clients::StorageClientFactory},
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

const RECORD_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// How an archived object should be restored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestoreOptions {
    pub priority: RestorePriority,
    pub duration_in_days: u32,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            priority: RestorePriority::Low,
            duration_in_days: 3,
        }
    }
}

#[derive(Clone)]
pub struct RestoreRegistry {
    table: DocumentTable,
    clients: Arc<StorageClientFactory>,
}

impl RestoreRegistry {
    pub fn new(table: DocumentTable, clients: Arc<StorageClientFactory>) -> Self {
        Self { table, clients }
    }

    /// Register `job_assignment_id` as waiting on `file`.
    ///
    /// The restore call is issued only for the request that creates the
    /// record; later requests for the same object just join it.
    pub async fn request_restore(
        &self,
        file: &Locator,
        job_assignment_id: &str,
        options: RestoreOptions,
        holder: &str,
    ) -> CopyResult<()> {
        let Locator::S3(object) = file else {
            return Err(CopyError::UnsupportedLocator(file.type_name().to_string()));
        };

        let id = build_restore_work_item_id(file);
        let mutex = self.table.create_mutex(&id, holder, RECORD_LOCK_TIMEOUT);
        mutex.lock().await?;
        let created = self.register(&id, file, job_assignment_id).await;
        if let Err(e) = mutex.unlock().await {
            warn!(lock = mutex.name(), error = %e, "failed to release restore lock");
        }

        if created? {
            info!(
                url = %object.url,
                tier = options.priority.s3_tier(),
                days = options.duration_in_days,
                "requesting restore"
            );
            let result = match self
                .clients
                .get_s3_client(&object.bucket, object.region.as_deref())
                .await
            {
                Ok(client) => client
                    .restore_object(object, options.duration_in_days, options.priority.s3_tier())
                    .await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(url = %object.url, error = %e, "restore request failed");
            }
        }
        Ok(())
    }

    /// Returns whether the record was created by this call.
    async fn register(&self, id: &str, file: &Locator, job_assignment_id: &str) -> CopyResult<bool> {
        match self.table.get::<RestoreWorkItem>(id).await? {
            Some(mut record) => {
                if record.add_job_assignment(job_assignment_id) {
                    self.table.put(id, &record).await?;
                }
                debug!(id, jobs = record.job_assignment_database_ids.len(), "joined restore");
                Ok(false)
            }
            None => {
                let mut record = RestoreWorkItem::new(file.clone());
                record.add_job_assignment(job_assignment_id);
                self.table.put(id, &record).await?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::restore::restore_work_item_path, testutil::TestStorage};

    #[tokio::test]
    async fn concurrent_jobs_share_one_record_and_one_restore() {
        let storage = TestStorage::new();
        storage
            .s3
            .add_archived_object("vault", "2020/tape.mxf", 100, "GLACIER");
        let table = storage.table().await;
        let registry = RestoreRegistry::new(table.clone(), storage.factory.clone());
        let file = Locator::s3("vault", "2020/tape.mxf", None);

        let (a, b) = tokio::join!(
            registry.request_restore(&file, "/job-assignments/a", RestoreOptions::default(), "req-a"),
            registry.request_restore(&file, "/job-assignments/b", RestoreOptions::default(), "req-b"),
        );
        a.unwrap();
        b.unwrap();
        registry
            .request_restore(&file, "/job-assignments/a", RestoreOptions::default(), "req-c")
            .await
            .unwrap();

        let records = table
            .query_all::<RestoreWorkItem>(restore_work_item_path())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        let mut ids = records[0].job_assignment_database_ids.clone();
        ids.sort();
        assert_eq!(ids, vec!["/job-assignments/a", "/job-assignments/b"]);
        assert_eq!(storage.s3.count("RestoreObject"), 1);
        assert_eq!(storage.s3.restores(), vec![("2020/tape.mxf".to_string(), 3, "Bulk".to_string())]);
    }

    #[tokio::test]
    async fn failed_restore_call_still_registers() {
        let storage = TestStorage::new();
        storage.s3.fail_next("RestoreObject", 1);
        let table = storage.table().await;
        let registry = RestoreRegistry::new(table.clone(), storage.factory.clone());
        let file = Locator::s3("vault", "a.mxf", None);

        registry
            .request_restore(&file, "/job-assignments/a", RestoreOptions::default(), "req")
            .await
            .unwrap();

        let record: Option<RestoreWorkItem> = table
            .get(&build_restore_work_item_id(&file))
            .await
            .unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn blob_files_are_not_restorable() {
        let storage = TestStorage::new();
        let registry = RestoreRegistry::new(storage.table().await, storage.factory.clone());
        let err = registry
            .request_restore(
                &Locator::blob("acct", "videos", "a.mxf"),
                "/job-assignments/a",
                RestoreOptions::default(),
                "req",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::UnsupportedLocator(_)));
    }
}
