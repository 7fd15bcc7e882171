//! `CompleteRestore`: every object a restore job waited on is available again.

use super::WorkerContext;
use crate::{errors::CopyResult, services::job_assignment::JobAssignmentHelper};
use tracing::info;

pub async fn complete_restore(_ctx: &WorkerContext, job: &JobAssignmentHelper) -> CopyResult<()> {
    let assignment = job.load().await?;
    if assignment.status.is_terminal() {
        info!(status = ?assignment.status, "job assignment already finished");
        return Ok(());
    }
    job.complete(None).await
}

#[cfg(test)]
mod tests {
    use crate::{
        models::job::{JobAssignment, JobStatus, WorkerRequest},
        operations::COMPLETE_RESTORE,
        testutil::{TestStorage, worker},
    };
    use serde_json::json;

    #[tokio::test]
    async fn running_restore_job_is_completed() {
        let storage = TestStorage::new();
        let (worker, table, _) = worker(&storage).await;
        let mut job = JobAssignment::new("/job-assignments/1", "RestoreFiles", json!({}));
        job.status = JobStatus::Running;
        table.put(&job.id, &job).await.unwrap();

        worker
            .execute(WorkerRequest::new(
                COMPLETE_RESTORE,
                json!({"jobAssignmentDatabaseId": "/job-assignments/1"}),
            ))
            .await
            .unwrap();

        let job: JobAssignment = table.get("/job-assignments/1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
}
