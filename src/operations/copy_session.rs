//! Runs a `FileCopier` inside one invocation and hands unfinished work to the
//! next one.
//!
//! The copier runs in slices. After each slice with work left the state is
//! checkpointed; once the invocation is close to its deadline a
//! `ContinueCopy` request is queued and this invocation stops.

use super::{CONTINUE_COPY, WorkerContext};
use crate::{
    errors::{CopyError, CopyResult},
    models::job::{ProblemDetail, ProblemKind},
    services::{
        file_copier::{CopyProgress, FileCopier, ProgressReporter},
        job_assignment::JobAssignmentHelper,
    },
};
use async_trait::async_trait;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::{info, warn};

/// Progress changes at or below this many percentage points are not written.
const PROGRESS_STEP: f64 = 0.5;

/// Offsets from the invocation deadline that bound a copy session.
#[derive(Clone, Debug)]
pub struct SessionTimings {
    /// No new work is admitted this close to the deadline.
    pub stop_admitting: Duration,
    /// Operations still running this close to the deadline are cut short.
    pub abort_operations: Duration,
    /// Last moment to checkpoint and hand off.
    pub bail_out: Duration,
    /// Length of one copier run between checkpoints.
    pub slice: Duration,
    /// Pause before marking a finished copy completed.
    pub completion_delay: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            stop_admitting: Duration::from_secs(120),
            abort_operations: Duration::from_secs(30),
            bail_out: Duration::from_secs(10),
            slice: Duration::from_secs(60),
            completion_delay: Duration::from_secs(1),
        }
    }
}

fn before(deadline: Instant, offset: Duration) -> Instant {
    deadline.checked_sub(offset).unwrap_or(deadline)
}

/// Writes copier progress to the job assignment.
struct JobProgress {
    job: JobAssignmentHelper,
    last: Mutex<Option<f64>>,
}

#[async_trait]
impl ProgressReporter for JobProgress {
    async fn report(&self, progress: CopyProgress) {
        let Some(percentage) = progress.percentage() else {
            return;
        };
        let mut last = self.last.lock().await;
        if let Some(previous) = *last
            && (percentage - previous).abs() <= PROGRESS_STEP
        {
            return;
        }
        match self.job.update_progress(percentage).await {
            Ok(()) => *last = Some(percentage),
            Err(e) => warn!(job_assignment_id = self.job.id(), error = %e, "failed to update progress"),
        }
    }
}

/// Drive `copier` until it is drained or the invocation has to hand off.
///
/// A copy failure fails the job with `copy-failure`; only bookkeeping errors
/// (checkpoint, job table, invoker) are returned.
pub async fn run_copy(
    ctx: &WorkerContext,
    job: &JobAssignmentHelper,
    copier: FileCopier,
) -> CopyResult<()> {
    let timings = &ctx.services.timings;
    let checkpoints = ctx.services.checkpoints();
    let reporter = Arc::new(JobProgress {
        job: job.clone(),
        last: Mutex::new(job.load().await?.progress),
    });
    let mut copier = copier.with_progress(reporter);

    let run_until = before(ctx.deadline, timings.stop_admitting);
    let abort_at = before(ctx.deadline, timings.abort_operations);
    let bail_out = before(ctx.deadline, timings.bail_out);

    loop {
        if Instant::now() < run_until {
            let slice_end = (Instant::now() + timings.slice).min(run_until);
            let result = tokio::time::timeout_at(bail_out, copier.run_until(slice_end, abort_at))
                .await
                .unwrap_or(Err(CopyError::Aborted));
            if let Err(e) = result {
                job.fail(ProblemDetail::new(
                    ProblemKind::CopyFailure,
                    "Failure while copying file(s)",
                    Some(e.to_string()),
                ))
                .await?;
                return Ok(());
            }
        }

        let state = copier.get_state();
        if state.is_empty() {
            break;
        }

        checkpoints.delete(job.id()).await;
        checkpoints.save(job.id(), &state).await?;

        if Instant::now() >= run_until {
            info!(
                remaining = state.work_items.len(),
                files_copied = state.files_copied,
                files_total = state.files_total,
                "invocation deadline near, continuing in a new invocation"
            );
            ctx.services
                .invoker
                .invoke(
                    CONTINUE_COPY,
                    json!({ "jobAssignmentDatabaseId": job.id() }),
                    ctx.tracker.clone(),
                )
                .await?;
            return Ok(());
        }
    }

    checkpoints.delete(job.id()).await;
    tokio::time::sleep(timings.completion_delay).await;
    job.complete(None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{
            job::{JobAssignment, JobStatus},
            locator::Locator,
            work_item::{DestinationFile, SourceFile},
        },
        operations::continue_copy::continue_copy,
        testutil::{TestStorage, memory_table, worker},
    };

    #[tokio::test]
    async fn small_progress_changes_are_not_written() {
        let table = memory_table().await;
        let job = JobAssignment::new("/job-assignments/1", "CopyFiles", json!({}));
        table.put(&job.id, &job).await.unwrap();
        let reporter = JobProgress {
            job: JobAssignmentHelper::new(table.clone(), "/job-assignments/1"),
            last: Mutex::new(None),
        };
        let at = |bytes_copied| CopyProgress {
            files_total: 1,
            files_copied: 0,
            bytes_total: 1000,
            bytes_copied,
        };

        reporter.report(at(100)).await;
        reporter.report(at(104)).await;
        let stored: JobAssignment = table.get("/job-assignments/1").await.unwrap().unwrap();
        assert_eq!(stored.progress, Some(10.0));

        reporter.report(at(200)).await;
        let stored: JobAssignment = table.get("/job-assignments/1").await.unwrap().unwrap();
        assert_eq!(stored.progress, Some(20.0));
    }

    #[tokio::test]
    async fn out_of_time_checkpoints_and_continues_elsewhere() {
        let storage = TestStorage::new();
        storage.s3.add_object("media", "in/a.mxf", 1000, "video/mxf");
        let (worker, table, invoker) = worker(&storage).await;
        let job = JobAssignment::new("/job-assignments/1", "CopyFiles", json!({}));
        table.put(&job.id, &job).await.unwrap();
        let services = worker.services().clone();
        let helper = services.job("/job-assignments/1");

        let mut copier = services.file_copier();
        copier.add_file(
            SourceFile::new(Locator::s3("media", "in/a.mxf", None)),
            DestinationFile::new(Locator::s3("archive", "out/a.mxf", None)),
        );
        let ctx = WorkerContext {
            request_id: "r1".into(),
            deadline: Instant::now(),
            tracker: Some(json!({"id": "t"})),
            services: services.clone(),
        };
        run_copy(&ctx, &helper, copier).await.unwrap();

        let calls = invoker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].operation_name, CONTINUE_COPY);
        assert_eq!(calls[0].tracker, Some(json!({"id": "t"})));
        assert_eq!(storage.s3.count("CopyObject"), 0);
        let saved = services.checkpoints().load("/job-assignments/1").await.unwrap();
        assert_eq!(saved.work_items.len(), 1);

        let ctx = WorkerContext {
            request_id: "r2".into(),
            deadline: Instant::now() + Duration::from_secs(600),
            tracker: None,
            services: services.clone(),
        };
        continue_copy(&ctx, &helper).await.unwrap();

        let job = helper.load().await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, Some(100.0));
        assert_eq!(storage.s3.count("CopyObject"), 1);
        assert!(
            services
                .checkpoints()
                .load("/job-assignments/1")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn copy_error_fails_job_with_copy_failure() {
        let storage = TestStorage::new();
        let (worker, table, _) = worker(&storage).await;
        let job = JobAssignment::new("/job-assignments/1", "CopyFiles", json!({}));
        table.put(&job.id, &job).await.unwrap();
        let services = worker.services().clone();
        let helper = services.job("/job-assignments/1");

        let mut copier = services.file_copier();
        copier.add_file(
            SourceFile::new(Locator::s3("media", "missing.mxf", None)),
            DestinationFile::new(Locator::s3("archive", "missing.mxf", None)),
        );
        let ctx = WorkerContext {
            request_id: "r1".into(),
            deadline: Instant::now() + Duration::from_secs(600),
            tracker: None,
            services,
        };
        run_copy(&ctx, &helper, copier).await.unwrap();

        let job = helper.load().await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let problem = job.error.unwrap();
        assert!(problem.problem_type.ends_with("/copy-failure"));
        assert_eq!(problem.title, "Failure while copying file(s)");
    }
}
