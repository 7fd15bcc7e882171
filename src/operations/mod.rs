//! Worker operations: job profile handlers plus the `ContinueCopy` and
//! `CompleteRestore` follow-ups the service schedules for itself.

pub mod complete_restore;
pub mod continue_copy;
pub mod copy_file;
pub mod copy_files;
pub mod copy_folder;
pub mod copy_session;
pub mod folders;
pub mod restore_files;
pub mod restore_folder;

use crate::{
    errors::{CopyError, CopyResult},
    models::job::{ProblemKind, WorkerRequest},
    services::{
        checkpoint::CheckpointStore,
        document_table::DocumentTable,
        file_copier::{FileCopier, FileCopierSettings},
        http_source::HttpSource,
        job_assignment::JobAssignmentHelper,
        restore_registry::RestoreRegistry,
        storage_clients::StorageClientFactory,
        transfer::TransferSelector,
        worker_invoker::WorkerInvoker,
    },
};
use copy_session::SessionTimings;
use serde::Deserialize;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

pub const PROCESS_JOB_ASSIGNMENT: &str = "ProcessJobAssignment";
pub const CONTINUE_COPY: &str = "ContinueCopy";
pub const COMPLETE_RESTORE: &str = "CompleteRestore";

/// Everything an operation needs, shared across invocations.
pub struct Services {
    pub table: DocumentTable,
    pub clients: Arc<StorageClientFactory>,
    pub http: Arc<dyn HttpSource>,
    pub invoker: Arc<dyn WorkerInvoker>,
    pub copier_settings: FileCopierSettings,
    pub timings: SessionTimings,
    pub checkpoint_retry_delay: Duration,
    pub api_key: Option<String>,
}

impl Services {
    pub fn new(
        table: DocumentTable,
        clients: Arc<StorageClientFactory>,
        http: Arc<dyn HttpSource>,
        invoker: Arc<dyn WorkerInvoker>,
    ) -> Self {
        Self {
            table,
            clients,
            http,
            invoker,
            copier_settings: FileCopierSettings::default(),
            timings: SessionTimings::default(),
            checkpoint_retry_delay: Duration::from_secs(3),
            api_key: None,
        }
    }

    pub fn job(&self, id: &str) -> JobAssignmentHelper {
        JobAssignmentHelper::new(self.table.clone(), id)
    }

    pub fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(self.table.clone()).with_retry_delay(self.checkpoint_retry_delay)
    }

    pub fn restore_registry(&self) -> RestoreRegistry {
        RestoreRegistry::new(self.table.clone(), self.clients.clone())
    }

    pub fn transfer_selector(&self) -> TransferSelector {
        TransferSelector::new(self.clients.clone(), self.http.clone(), self.api_key.clone())
    }

    pub fn file_copier(&self) -> FileCopier {
        FileCopier::new(
            self.clients.clone(),
            self.http.clone(),
            self.copier_settings.clone(),
        )
        .with_api_key(self.api_key.clone())
    }
}

/// Per-invocation context.
pub struct WorkerContext {
    pub request_id: String,
    /// When the hosting platform will stop this invocation.
    pub deadline: Instant,
    pub tracker: Option<Value>,
    pub services: Arc<Services>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobAssignmentRef {
    job_assignment_database_id: String,
}

/// Dispatches worker requests to operations.
#[derive(Clone)]
pub struct Worker {
    services: Arc<Services>,
    invocation_budget: Duration,
}

impl Worker {
    pub fn new(services: Arc<Services>, invocation_budget: Duration) -> Self {
        Self {
            services,
            invocation_budget,
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Run one request to the end.
    ///
    /// Failures of the operation itself are recorded on the job assignment;
    /// only malformed requests are returned as errors.
    pub async fn execute(&self, request: WorkerRequest) -> CopyResult<()> {
        let ctx = WorkerContext {
            request_id: Uuid::new_v4().to_string(),
            deadline: Instant::now() + self.invocation_budget,
            tracker: request.tracker.clone(),
            services: self.services.clone(),
        };
        let job_ref: JobAssignmentRef = serde_json::from_value(request.input)
            .map_err(|e| CopyError::InvalidInput(format!("worker request input: {}", e)))?;
        let job = self.services.job(&job_ref.job_assignment_database_id);

        let span = info_span!(
            "worker",
            operation = %request.operation_name,
            request_id = %ctx.request_id,
            job_assignment_id = job.id(),
        );
        async {
            info!("worker request received");
            let result = match request.operation_name.as_str() {
                PROCESS_JOB_ASSIGNMENT => process_job_assignment(&ctx, &job).await,
                CONTINUE_COPY => continue_copy::continue_copy(&ctx, &job).await,
                COMPLETE_RESTORE => complete_restore::complete_restore(&ctx, &job).await,
                other => {
                    return Err(CopyError::InvalidInput(format!(
                        "unknown operation `{}`",
                        other
                    )));
                }
            };
            if let Err(e) = result {
                fail_job(&job, &e).await;
            }
            Ok(())
        }
        .instrument(span)
        .await
    }
}

async fn process_job_assignment(ctx: &WorkerContext, job: &JobAssignmentHelper) -> CopyResult<()> {
    let assignment = job.load().await?;
    if assignment.status.is_terminal() {
        info!(status = ?assignment.status, "job assignment already finished");
        return Ok(());
    }
    job.mark_running().await?;

    match assignment.profile_name.as_str() {
        "CopyFile" => copy_file::copy_file(ctx, job).await,
        "CopyFiles" => copy_files::copy_files(ctx, job).await,
        "CopyFolder" => copy_folder::copy_folder(ctx, job).await,
        "RestoreFile" => restore_files::restore_file(ctx, job).await,
        "RestoreFiles" => restore_files::restore_files(ctx, job).await,
        "RestoreFolder" => restore_folder::restore_folder(ctx, job).await,
        other => Err(CopyError::rejected(
            ProblemKind::InvalidInput,
            "Job profile not supported",
            format!("Job profile '{}' is not supported", other),
        )),
    }
}

pub(crate) async fn fail_job(job: &JobAssignmentHelper, e: &CopyError) {
    if let Err(update) = job.fail(e.to_problem()).await {
        error!(job_assignment_id = job.id(), error = %update, "failed to record job failure");
    }
}
