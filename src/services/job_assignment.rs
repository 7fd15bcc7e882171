//! Access to a job assignment document: input, status, progress and outcome.

use crate::{
    errors::{CopyError, CopyResult},
    models::job::{JobAssignment, JobStatus, ProblemDetail},
    services::document_table::DocumentTable,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{error, info};

#[derive(Clone)]
pub struct JobAssignmentHelper {
    table: DocumentTable,
    id: String,
}

impl JobAssignmentHelper {
    pub fn new(table: DocumentTable, id: impl Into<String>) -> Self {
        Self {
            table,
            id: id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn load(&self) -> CopyResult<JobAssignment> {
        self.table
            .get::<JobAssignment>(&self.id)
            .await?
            .ok_or_else(|| CopyError::InvalidInput(format!("job assignment `{}` not found", self.id)))
    }

    /// Job input deserialized into `T`.
    pub async fn input<T: DeserializeOwned>(&self) -> CopyResult<T> {
        let job = self.load().await?;
        serde_json::from_value(job.job_input).map_err(|e| CopyError::InvalidInput(e.to_string()))
    }

    /// Apply `mutator` to the stored document and write it back.
    pub async fn update_job_assignment<F>(&self, mutator: F) -> CopyResult<JobAssignment>
    where
        F: FnOnce(&mut JobAssignment),
    {
        let mut job = self.load().await?;
        mutator(&mut job);
        job.date_modified = Utc::now();
        self.table.put(&self.id, &job).await?;
        Ok(job)
    }

    pub async fn mark_running(&self) -> CopyResult<()> {
        self.update_job_assignment(|job| job.status = JobStatus::Running)
            .await?;
        Ok(())
    }

    pub async fn update_progress(&self, progress: f64) -> CopyResult<()> {
        self.update_job_assignment(|job| job.progress = Some(progress))
            .await?;
        Ok(())
    }

    pub async fn complete(&self, output: Option<Value>) -> CopyResult<()> {
        self.update_job_assignment(|job| {
            job.status = JobStatus::Completed;
            if output.is_some() {
                job.job_output = output;
            }
        })
        .await?;
        info!(job_assignment_id = %self.id, "job completed");
        Ok(())
    }

    pub async fn fail(&self, problem: ProblemDetail) -> CopyResult<()> {
        error!(
            job_assignment_id = %self.id,
            problem_type = %problem.problem_type,
            title = %problem.title,
            detail = ?problem.detail,
            "job failed"
        );
        self.update_job_assignment(|job| {
            job.status = JobStatus::Failed;
            job.error = Some(problem);
        })
        .await?;
        Ok(())
    }
}
